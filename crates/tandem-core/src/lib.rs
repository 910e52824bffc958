//! Scheduling and routing core for trees of cooperating kernels: one command
//! at a time per scope, structured parent/child nesting, deferred setup
//! operations, and duplicate-free routing slips on everything that crosses a
//! kernel boundary.

pub mod cancellation;
pub mod command;
pub mod composite;
pub mod context;
pub mod error;
pub mod event;
pub mod kernel;
pub mod pipeline;
pub mod routing;
pub mod scheduler;
pub mod scope;
pub mod splitter;
pub mod token;

pub use cancellation::{CancellationSource, CancellationToken};
pub use command::{
    CommandKind, CommandOutcome, KernelCommand, KernelCommandBody, KernelCommandResult,
};
pub use composite::CompositeKernel;
pub use context::KernelInvocationContext;
pub use error::{KernelError, RoutingSlipError, SchedulerError};
pub use event::{EventKind, KernelEvent, KernelEventBody};
pub use kernel::{HandlerFn, Kernel, KernelCommandHandler, KernelInfo};
pub use pipeline::{CommandPipeline, Middleware, NextAction};
pub use routing::{CommandRoutingSlip, EventRoutingSlip, RoutingSlipEntry};
pub use scheduler::{DeferredOperationSource, KernelScheduler, OnExecute};
pub use scope::SchedulingScope;
pub use token::CommandToken;
