use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::command::{CommandKind, KernelCommand, KernelCommandBody};
use crate::context::KernelInvocationContext;
use crate::error::{KernelError, RoutingSlipError};
use crate::event::{KernelEvent, KernelEventBody};
use crate::pipeline::{CommandPipeline, NextAction};

/// A command handler attached to a kernel for one command kind.
#[async_trait]
pub trait KernelCommandHandler: Send + Sync {
    async fn handle(
        &self,
        command: KernelCommand,
        context: KernelInvocationContext,
    ) -> anyhow::Result<()>;
}

/// Adapter turning a closure into a [`KernelCommandHandler`].
pub struct HandlerFn(
    Arc<
        dyn Fn(KernelCommand, KernelInvocationContext) -> BoxFuture<'static, anyhow::Result<()>>
            + Send
            + Sync,
    >,
);

impl HandlerFn {
    pub fn new(
        handler: impl Fn(KernelCommand, KernelInvocationContext) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self(Arc::new(handler)))
    }
}

#[async_trait]
impl KernelCommandHandler for HandlerFn {
    async fn handle(
        &self,
        command: KernelCommand,
        context: KernelInvocationContext,
    ) -> anyhow::Result<()> {
        (self.0)(command, context).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub name: String,
    pub language: Option<String>,
    pub uri: Url,
    pub remote_uri: Option<Url>,
    pub supported_commands: Vec<CommandKind>,
}

struct KernelInner {
    name: String,
    uri: Url,
    language: Option<String>,
    remote_uri: Option<Url>,
    handlers: Mutex<HashMap<CommandKind, Arc<dyn KernelCommandHandler>>>,
    values: Mutex<HashMap<String, String>>,
    pipeline: CommandPipeline,
}

/// A single execution target. Handlers are registered per command kind and
/// resolved by table lookup; the kernel's pipeline runs in front of them.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    pub fn new(name: &str) -> Self {
        Self::build(name, None, None)
    }

    pub fn with_language(name: &str, language: &str) -> Self {
        Self::build(name, Some(language.to_string()), None)
    }

    /// A local stand-in for a kernel living behind `remote_uri`. Remote
    /// kernels are transparent hops: the remote side stamps routing slips,
    /// not the stand-in.
    pub fn remote(name: &str, remote_uri: Url) -> Self {
        Self::build(name, None, Some(remote_uri))
    }

    fn build(name: &str, language: Option<String>, remote_uri: Option<Url>) -> Self {
        let uri = Url::parse(&format!("kernel://{name}")).expect("kernel name forms a valid URI");
        let inner = Arc::new_cyclic(|weak: &Weak<KernelInner>| {
            let dispatch = weak.clone();
            let terminal: NextAction = Arc::new(move |command, context| {
                let dispatch = dispatch.clone();
                Box::pin(async move {
                    match dispatch.upgrade() {
                        Some(kernel) => dispatch_command(&kernel, command, context).await,
                        None => Ok(()),
                    }
                })
            });
            KernelInner {
                name: name.to_string(),
                uri,
                language,
                remote_uri,
                handlers: Mutex::new(HashMap::new()),
                values: Mutex::new(HashMap::new()),
                pipeline: CommandPipeline::new(terminal),
            }
        });
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn uri(&self) -> &Url {
        &self.inner.uri
    }

    pub fn remote_uri(&self) -> Option<&Url> {
        self.inner.remote_uri.as_ref()
    }

    pub fn pipeline(&self) -> &CommandPipeline {
        &self.inner.pipeline
    }

    pub fn kernel_info(&self) -> KernelInfo {
        let mut supported: Vec<CommandKind> = vec![
            CommandKind::RequestKernelInfo,
            CommandKind::SendValue,
            CommandKind::RequestValue,
        ];
        for kind in self.inner.handlers.lock().expect("kernel lock").keys() {
            if !supported.contains(kind) {
                supported.push(*kind);
            }
        }
        KernelInfo {
            name: self.inner.name.clone(),
            language: self.inner.language.clone(),
            uri: self.inner.uri.clone(),
            remote_uri: self.inner.remote_uri.clone(),
            supported_commands: supported,
        }
    }

    /// Registers (or replaces) the handler for one command kind.
    pub fn register_handler(&self, kind: CommandKind, handler: Arc<dyn KernelCommandHandler>) {
        self.inner
            .handlers
            .lock()
            .expect("kernel lock")
            .insert(kind, handler);
    }

    /// A value previously shared into this kernel with `SendValue`.
    pub fn value(&self, name: &str) -> Option<String> {
        self.inner
            .values
            .lock()
            .expect("kernel lock")
            .get(name)
            .cloned()
    }

    /// Runs `command` through this kernel: stamp the routing slip as arrived,
    /// run the pipeline, complete the stamp. Slip violations mean the same
    /// command was delivered here twice and surface synchronously.
    pub async fn handle(
        &self,
        command: KernelCommand,
        context: KernelInvocationContext,
    ) -> Result<(), RoutingSlipError> {
        let transparent = self.inner.remote_uri.is_some();
        if !transparent {
            command.routing_slip().stamp_as_arrived(self.uri())?;
        }
        let scoped = if transparent {
            context
        } else {
            context.with_origin(self.uri().clone())
        };
        self.inner.pipeline.send(command.clone(), scoped).await;
        if !transparent {
            command.routing_slip().stamp(self.uri())?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.inner.name)
            .field("uri", &self.inner.uri.as_str())
            .finish()
    }
}

/// Terminal pipeline stage: registered handlers first, then the built-ins
/// every kernel carries (kernel info and the value store).
async fn dispatch_command(
    kernel: &Arc<KernelInner>,
    command: KernelCommand,
    context: KernelInvocationContext,
) -> Result<(), KernelError> {
    let handler = kernel
        .handlers
        .lock()
        .expect("kernel lock")
        .get(&command.kind())
        .cloned();
    if let Some(handler) = handler {
        return handler
            .handle(command, context)
            .await
            .map_err(KernelError::Handler);
    }

    match command.body().clone() {
        KernelCommandBody::RequestKernelInfo => {
            let info = Kernel {
                inner: kernel.clone(),
            }
            .kernel_info();
            context.publish(KernelEvent::new(
                KernelEventBody::KernelInfoProduced { kernel_info: info },
                command,
            ));
            Ok(())
        }
        KernelCommandBody::SendValue { name, value } => {
            kernel.values.lock().expect("kernel lock").insert(name, value);
            Ok(())
        }
        KernelCommandBody::RequestValue { name } => {
            let value = kernel
                .values
                .lock()
                .expect("kernel lock")
                .get(&name)
                .cloned();
            match value {
                Some(value) => {
                    context.publish(KernelEvent::new(
                        KernelEventBody::ValueProduced { name, value },
                        command,
                    ));
                    Ok(())
                }
                None => Err(KernelError::ValueNotFound(name)),
            }
        }
        _ => Err(KernelError::NoHandler {
            kernel: kernel.name.clone(),
            kind: command.kind(),
        }),
    }
}
