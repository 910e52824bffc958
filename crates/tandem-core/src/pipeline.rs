//! Command pipeline: an ordered middleware list composed into one callable.
//!
//! Middleware may transform, split, short-circuit, or forward a command
//! before invoking the next stage; the composed chain terminates in the
//! owning kernel's dispatch. Composition is a right fold, rebuilt lazily the
//! first time the pipeline is used after a mutation.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use crate::command::KernelCommand;
use crate::context::KernelInvocationContext;
use crate::error::KernelError;

/// The tail of the pipeline from a middleware's point of view.
pub type NextAction = Arc<
    dyn Fn(KernelCommand, KernelInvocationContext) -> BoxFuture<'static, Result<(), KernelError>>
        + Send
        + Sync,
>;

pub type Middleware = Arc<
    dyn Fn(
            KernelCommand,
            KernelInvocationContext,
            NextAction,
        ) -> BoxFuture<'static, Result<(), KernelError>>
        + Send
        + Sync,
>;

pub struct CommandPipeline {
    middlewares: Mutex<Vec<Middleware>>,
    terminal: NextAction,
    composed: Mutex<Option<NextAction>>,
}

impl CommandPipeline {
    pub fn new(terminal: NextAction) -> Self {
        Self {
            middlewares: Mutex::new(Vec::new()),
            terminal,
            composed: Mutex::new(None),
        }
    }

    /// Appends a middleware and invalidates the composed chain.
    pub fn add_middleware(&self, middleware: Middleware) {
        self.middlewares
            .lock()
            .expect("pipeline lock")
            .push(middleware);
        *self.composed.lock().expect("pipeline lock") = None;
    }

    fn composed(&self) -> NextAction {
        if let Some(chain) = self.composed.lock().expect("pipeline lock").as_ref() {
            return chain.clone();
        }
        let middlewares = self.middlewares.lock().expect("pipeline lock").clone();
        let mut next = self.terminal.clone();
        for middleware in middlewares.into_iter().rev() {
            let inner = next;
            next = Arc::new(move |command, context| {
                middleware(command, context, inner.clone())
            });
        }
        *self.composed.lock().expect("pipeline lock") = Some(next.clone());
        next
    }

    /// Runs `command` through the chain. A fault anywhere in the chain is
    /// caught here and turned into a failure on the invocation context; it
    /// never propagates to the caller.
    pub async fn send(&self, command: KernelCommand, context: KernelInvocationContext) {
        let chain = self.composed();
        if let Err(err) = chain(command.clone(), context.clone()).await {
            tracing::debug!(command = %command.kind(), error = %err, "pipeline fault");
            context.fail(&command, err.to_string());
        }
    }
}
