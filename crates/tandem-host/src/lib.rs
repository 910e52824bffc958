//! Process-boundary plumbing for kernel trees: the transport seam, the proxy
//! kernel that stands in for a remote kernel, and the host loop that serves
//! a kernel tree over a transport. Routing slips are the defence at every
//! boundary: a command delivered twice to the same hop fails the slip
//! invariant instead of executing twice.

mod error;
mod host;
mod proxy;
mod transport;

pub use error::HostError;
pub use host::KernelHost;
pub use proxy::{ProxyKernel, RemoteConnection, RemoteConnectionConfig};
pub use transport::{InMemoryTransport, Transport};
