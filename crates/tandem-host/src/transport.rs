use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use tandem_protocol::Envelope;

use crate::error::HostError;

/// Physical transport for serialized envelopes. The real wire (pipes,
/// sockets) lives outside this crate; anything that can move envelopes in
/// order satisfies the seam.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<(), HostError>;

    /// The next incoming envelope, or `None` once the peer hung up.
    async fn recv(&self) -> Option<Envelope>;
}

/// Crosswired channel pair, the test stand-in for a process boundary.
pub struct InMemoryTransport {
    outgoing: mpsc::UnboundedSender<Envelope>,
    incoming: Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

impl InMemoryTransport {
    pub fn pair() -> (InMemoryTransport, InMemoryTransport) {
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let (right_tx, right_rx) = mpsc::unbounded_channel();
        (
            InMemoryTransport {
                outgoing: left_tx,
                incoming: Mutex::new(right_rx),
            },
            InMemoryTransport {
                outgoing: right_tx,
                incoming: Mutex::new(left_rx),
            },
        )
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), HostError> {
        self.outgoing
            .send(envelope)
            .map_err(|_| HostError::ConnectionClosed)
    }

    async fn recv(&self) -> Option<Envelope> {
        self.incoming.lock().await.recv().await
    }
}
