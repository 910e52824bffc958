use std::time::Duration;

use thiserror::Error;

use tandem_core::{KernelError, RoutingSlipError};
use tandem_protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("transport closed")]
    ConnectionClosed,
    #[error("remote kernel did not answer within {0:?}")]
    ForwardTimeout(Duration),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    RoutingSlip(#[from] RoutingSlipError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}
