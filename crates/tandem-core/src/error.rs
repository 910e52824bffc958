use thiserror::Error;

use crate::command::CommandKind;

/// Violations of the routing-slip invariants. These are programmer errors in
/// forwarding logic and surface synchronously to the stamping caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingSlipError {
    #[error("routing slip already contains an entry for '{0}'")]
    DuplicateEntry(String),
    #[error("routing slip has no pending entry for '{0}'")]
    MissingEntry(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler has been disposed")]
    Disposed,
    #[error("operation was cancelled")]
    Cancelled,
    #[error("operation handler failed: {0}")]
    HandlerFault(anyhow::Error),
}

impl SchedulerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SchedulerError::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("no kernel can handle command '{0}'")]
    NoSuitableKernel(String),
    #[error("kernel '{kernel}' has no handler for {kind} commands")]
    NoHandler { kernel: String, kind: CommandKind },
    #[error("a kernel named '{0}' is already attached")]
    DuplicateKernelName(String),
    #[error("value '{0}' not found")]
    ValueNotFound(String),
    #[error(transparent)]
    RoutingSlip(#[from] RoutingSlipError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("{0}")]
    Handler(#[source] anyhow::Error),
}

impl From<anyhow::Error> for KernelError {
    fn from(err: anyhow::Error) -> Self {
        KernelError::Handler(err)
    }
}
