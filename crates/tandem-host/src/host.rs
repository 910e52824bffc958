//! Server side of a transport: feeds incoming command envelopes into a
//! kernel tree and ships the resulting events back out, in publication
//! order.

use std::sync::Arc;

use tandem_core::{CompositeKernel, KernelEvent, KernelEventBody};
use tandem_protocol::{Envelope, EventEnvelope};

use crate::error::HostError;
use crate::transport::Transport;

pub struct KernelHost {
    kernel: CompositeKernel,
    transport: Arc<dyn Transport>,
}

impl KernelHost {
    pub fn new(kernel: CompositeKernel, transport: Arc<dyn Transport>) -> Self {
        Self { kernel, transport }
    }

    pub fn kernel(&self) -> &CompositeKernel {
        &self.kernel
    }

    /// Serves commands until the transport closes. Undecodable envelopes are
    /// logged and skipped; per-command failures travel back to the peer as
    /// `CommandFailed` events, never as a dead connection.
    pub async fn run(&self) -> Result<(), HostError> {
        while let Some(envelope) = self.transport.recv().await {
            match envelope {
                Envelope::Command(envelope) => {
                    let command = match envelope.into_command() {
                        Ok(command) => command,
                        Err(err) => {
                            tracing::warn!(error = %err, "undecodable command envelope");
                            continue;
                        }
                    };
                    self.serve_command(command).await?;
                }
                Envelope::Event(_) => {
                    tracing::warn!("peer sent an event on a host connection");
                }
            }
        }
        Ok(())
    }

    async fn serve_command(&self, command: tandem_core::KernelCommand) -> Result<(), HostError> {
        tracing::debug!(command = %command.kind(), token = %command.token(), "serving command");
        match self.kernel.send(command.clone()).await {
            Ok(result) => {
                for event in result.events() {
                    self.publish(event).await?;
                }
            }
            Err(err) => {
                // The scheduler or the routing slip rejected the command
                // outright; report that the same way handler failures are
                // reported.
                let failure = KernelEvent::new(
                    KernelEventBody::CommandFailed {
                        message: err.to_string(),
                    },
                    command,
                );
                self.publish(&failure).await?;
            }
        }
        Ok(())
    }

    async fn publish(&self, event: &KernelEvent) -> Result<(), HostError> {
        self.transport
            .send(Envelope::Event(EventEnvelope::from_event(event)))
            .await
    }
}
