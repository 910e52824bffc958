//! The proxy kernel: a local, transparent stand-in for a kernel living
//! behind a transport. Commands routed to it are serialized and forwarded;
//! remote events are replayed into the local invocation context verbatim.
//! The proxy refuses to forward a command whose routing slip already names
//! the remote kernel, which is what turns a forwarding loop into an error
//! instead of infinite traffic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use tandem_core::{
    CommandKind, EventKind, Kernel, KernelCommand, KernelCommandHandler, KernelEvent,
    KernelEventBody, KernelInvocationContext, RoutingSlipError,
};
use tandem_protocol::{CommandEnvelope, Envelope};

use crate::error::HostError;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct RemoteConnectionConfig {
    pub forward_timeout: Duration,
}

impl Default for RemoteConnectionConfig {
    fn default() -> Self {
        Self {
            forward_timeout: Duration::from_secs(30),
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<KernelEvent>>>>;

/// Client side of a transport: demultiplexes incoming event envelopes to the
/// forward in flight for their command token.
pub struct RemoteConnection {
    transport: Arc<dyn Transport>,
    pending: PendingMap,
    config: RemoteConnectionConfig,
    _reader: JoinHandle<()>,
}

impl RemoteConnection {
    pub fn new(transport: Arc<dyn Transport>, config: RemoteConnectionConfig) -> Arc<Self> {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_loop(transport.clone(), pending.clone()));
        Arc::new(Self {
            transport,
            pending,
            config,
            _reader: reader,
        })
    }

    /// Forwards `command` to the remote kernel at `remote_uri` and replays
    /// the remote's events into `context` until the remote reports the
    /// command's terminal state.
    pub async fn forward(
        &self,
        command: &KernelCommand,
        context: &KernelInvocationContext,
        remote_uri: &Url,
    ) -> anyhow::Result<()> {
        if command.routing_slip().contains(remote_uri) {
            return Err(anyhow::Error::new(RoutingSlipError::DuplicateEntry(
                remote_uri.to_string(),
            )));
        }

        let token = command.token().to_string();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        self.pending
            .lock()
            .expect("pending forwards lock")
            .insert(token.clone(), sender);

        let outcome = async {
            self.transport
                .send(Envelope::Command(CommandEnvelope::from_command(command)))
                .await?;
            loop {
                let Some(event) = receiver.recv().await else {
                    return Err(HostError::ConnectionClosed);
                };
                match event.kind() {
                    EventKind::CommandSucceeded => {
                        // Learn the hops the command took on the far side so
                        // re-forwarding stays detectable.
                        command.routing_slip().append(event.command().routing_slip())?;
                        return Ok(());
                    }
                    EventKind::CommandFailed => {
                        command.routing_slip().append(event.command().routing_slip())?;
                        let message = match event.body() {
                            KernelEventBody::CommandFailed { message } => message.clone(),
                            _ => "remote command failed".to_string(),
                        };
                        return Err(HostError::Kernel(tandem_core::KernelError::Handler(
                            anyhow::anyhow!("{message}"),
                        )));
                    }
                    _ => context.publish(event),
                }
            }
        };

        let result = tokio::time::timeout(self.config.forward_timeout, outcome)
            .await
            .unwrap_or(Err(HostError::ForwardTimeout(self.config.forward_timeout)));
        self.pending
            .lock()
            .expect("pending forwards lock")
            .remove(&token);
        result.map_err(Into::into)
    }
}

async fn read_loop(transport: Arc<dyn Transport>, pending: PendingMap) {
    while let Some(envelope) = transport.recv().await {
        match envelope {
            Envelope::Event(envelope) => match envelope.into_event() {
                Ok(event) => {
                    let token = event.command().token().to_string();
                    let sender = pending
                        .lock()
                        .expect("pending forwards lock")
                        .get(&token)
                        .cloned();
                    match sender {
                        Some(sender) => {
                            let _ = sender.send(event);
                        }
                        None => tracing::debug!(
                            command = %token,
                            "dropping remote event with no forward in flight"
                        ),
                    }
                }
                Err(err) => tracing::warn!(error = %err, "undecodable remote event"),
            },
            Envelope::Command(_) => {
                tracing::warn!("remote peer sent a command on a client connection");
            }
        }
    }
    tracing::debug!("remote connection closed");
}

/// Builds proxy kernels bound to one remote connection.
pub struct ProxyKernel;

impl ProxyKernel {
    /// A kernel named `name` that forwards every command it receives to the
    /// remote kernel at `remote_uri`. Attach the result to a composite like
    /// any local kernel.
    pub fn create(name: &str, remote_uri: Url, connection: Arc<RemoteConnection>) -> Kernel {
        let kernel = Kernel::remote(name, remote_uri.clone());
        let forwarder: Arc<Forwarder> = Arc::new(Forwarder {
            connection,
            remote_uri,
        });
        for kind in [
            CommandKind::SubmitCode,
            CommandKind::RequestKernelInfo,
            CommandKind::RequestValue,
            CommandKind::SendValue,
            CommandKind::Cancel,
        ] {
            kernel.register_handler(kind, forwarder.clone());
        }
        kernel
    }
}

struct Forwarder {
    connection: Arc<RemoteConnection>,
    remote_uri: Url,
}

#[async_trait]
impl KernelCommandHandler for Forwarder {
    async fn handle(
        &self,
        command: KernelCommand,
        context: KernelInvocationContext,
    ) -> anyhow::Result<()> {
        self.connection
            .forward(&command, &context, &self.remote_uri)
            .await
    }
}
