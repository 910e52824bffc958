//! The composite kernel: a tree of child kernels behind one front door.
//!
//! The composite owns the scheduler that serializes top-level commands for
//! the whole tree, the per-root-command invocation contexts, and the two
//! built-in middlewares: one that splits multi-kernel code submissions into
//! targeted sub-commands and one that resolves which kernel handles each
//! command (destination URI first, then explicit target name, then the
//! default kernel).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;
use tokio::sync::mpsc;
use url::Url;

use crate::command::{
    CommandKind, CommandOutcome, KernelCommand, KernelCommandBody, KernelCommandResult,
};
use crate::context::KernelInvocationContext;
use crate::error::{KernelError, SchedulerError};
use crate::event::KernelEvent;
use crate::kernel::Kernel;
use crate::pipeline::NextAction;
use crate::scheduler::{DeferredOperationSource, KernelScheduler, OnExecute};
use crate::scope::SchedulingScope;
use crate::splitter;
use crate::token::CommandToken;

struct CompositeInner {
    kernel: Kernel,
    children: Mutex<IndexMap<String, Kernel>>,
    default_kernel: Mutex<Option<String>>,
    scheduler: KernelScheduler<KernelCommand, KernelCommandResult>,
    contexts: Mutex<HashMap<CommandToken, KernelInvocationContext>>,
    scope: SchedulingScope,
}

#[derive(Clone)]
pub struct CompositeKernel {
    inner: Arc<CompositeInner>,
}

impl CompositeKernel {
    /// Must be created inside a tokio runtime; the scheduler worker starts
    /// immediately.
    pub fn new(name: &str) -> Self {
        let inner = Arc::new(CompositeInner {
            kernel: Kernel::new(name),
            children: Mutex::new(IndexMap::new()),
            default_kernel: Mutex::new(None),
            scheduler: KernelScheduler::new(),
            contexts: Mutex::new(HashMap::new()),
            scope: SchedulingScope::new(name),
        });

        // Child classification: same root-command ancestor. A candidate is a
        // child of the running operation when its parent token is the
        // running command's token or one of that command's tracked children.
        let for_classifier = Arc::downgrade(&inner);
        inner.scheduler.set_child_classifier(
            move |candidate: &KernelCommand, running: &KernelCommand| {
                let Some(parent) = candidate.parent_token() else {
                    return false;
                };
                if parent == running.token() {
                    return true;
                }
                let Some(inner) = for_classifier.upgrade() else {
                    return false;
                };
                let contexts = inner.contexts.lock().expect("composite lock");
                contexts
                    .get(running.token())
                    .is_some_and(|context| context.is_child(parent))
            },
        );

        let for_splitter = Arc::downgrade(&inner);
        inner
            .kernel
            .pipeline()
            .add_middleware(Arc::new(move |command, context, next| {
                let weak = for_splitter.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(inner) => split_submissions(inner, command, context, next).await,
                        None => next(command, context).await,
                    }
                })
            }));

        let for_router = Arc::downgrade(&inner);
        inner
            .kernel
            .pipeline()
            .add_middleware(Arc::new(move |command, context, next| {
                let weak = for_router.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(inner) => route_command(inner, command, context, next).await,
                        None => next(command, context).await,
                    }
                })
            }));

        Self { inner }
    }

    pub fn name(&self) -> &str {
        self.inner.kernel.name()
    }

    pub fn uri(&self) -> &Url {
        self.inner.kernel.uri()
    }

    /// The composite's own handler container, for registering handlers that
    /// run on the composite itself.
    pub fn kernel(&self) -> &Kernel {
        &self.inner.kernel
    }

    /// Attaches a child kernel. The first kernel attached becomes the
    /// default target for untargeted commands.
    pub fn add_kernel(&self, kernel: Kernel) -> Result<(), KernelError> {
        let mut children = self.inner.children.lock().expect("composite lock");
        if children.contains_key(kernel.name()) {
            return Err(KernelError::DuplicateKernelName(kernel.name().to_string()));
        }
        let mut default = self.inner.default_kernel.lock().expect("composite lock");
        if default.is_none() {
            *default = Some(kernel.name().to_string());
        }
        children.insert(kernel.name().to_string(), kernel);
        Ok(())
    }

    pub fn set_default_kernel(&self, name: &str) -> Result<(), KernelError> {
        if !self
            .inner
            .children
            .lock()
            .expect("composite lock")
            .contains_key(name)
        {
            return Err(KernelError::NoSuitableKernel(name.to_string()));
        }
        *self.inner.default_kernel.lock().expect("composite lock") = Some(name.to_string());
        Ok(())
    }

    pub fn default_kernel_name(&self) -> Option<String> {
        self.inner.default_kernel.lock().expect("composite lock").clone()
    }

    pub fn find_kernel(&self, name: &str) -> Option<Kernel> {
        self.inner
            .children
            .lock()
            .expect("composite lock")
            .get(name)
            .cloned()
    }

    /// Queues `command` to run before the next top-level command submitted
    /// to the command's scope or any of its descendants. Used to inject
    /// setup work, like sharing values into a freshly attached kernel, ahead
    /// of the first user command.
    pub fn defer_command(&self, command: KernelCommand) {
        let scope = scope_for(&self.inner, &command);
        let slot = Arc::new(Mutex::new(Some(command)));
        let weak = Arc::downgrade(&self.inner);
        let on_execute: OnExecute<KernelCommand, KernelCommandResult> = Arc::new(move |command| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    anyhow::bail!("composite kernel was dropped");
                };
                let context = KernelInvocationContext::new(command.clone());
                execute(inner, command, context).await
            })
        });
        let source = DeferredOperationSource::new(
            scope,
            move |_value, _scope| {
                slot.lock()
                    .expect("deferred slot lock")
                    .take()
                    .into_iter()
                    .collect()
            },
            on_execute,
        );
        self.inner.scheduler.register_deferred_source(source);
    }

    /// Subscribes to the event stream of `command`'s invocation context,
    /// establishing the context if the command has not been sent yet.
    pub fn subscribe(&self, command: &KernelCommand) -> mpsc::UnboundedReceiver<KernelEvent> {
        self.context_for(command).subscribe()
    }

    /// Sends a command into the tree and resolves with its terminal result.
    ///
    /// Top-level commands are serialized by the scheduler; a command whose
    /// parent is currently running executes inline ahead of the parent's
    /// completion. `Cancel` bypasses the scheduler entirely, since it must
    /// not queue behind the very work it is meant to stop.
    pub async fn send(&self, command: KernelCommand) -> Result<KernelCommandResult, KernelError> {
        if command.kind() == CommandKind::Cancel {
            self.cancel_all();
            return Ok(KernelCommandResult::new(
                CommandOutcome::Succeeded,
                Vec::new(),
            ));
        }

        let context = self.context_for(&command);
        let scope = scope_for(&self.inner, &command);
        let token = context.cancellation_token();

        let exec_inner = self.inner.clone();
        let exec_context = context.clone();
        let on_execute: OnExecute<KernelCommand, KernelCommandResult> = Arc::new(move |command| {
            let inner = exec_inner.clone();
            let context = exec_context.clone();
            Box::pin(async move { execute(inner, command, context).await })
        });

        let outcome = self
            .inner
            .scheduler
            .schedule(command.clone(), on_execute, scope, token)
            .await;

        if command.is_root() {
            self.inner
                .contexts
                .lock()
                .expect("composite lock")
                .remove(command.token());
        }

        match outcome {
            Ok(result) => Ok(result),
            Err(SchedulerError::Cancelled) => Ok(KernelCommandResult::cancelled()),
            Err(err) => Err(err.into()),
        }
    }

    /// Cancels every live invocation context and sweeps the scheduler's
    /// queues.
    pub fn cancel_all(&self) {
        let contexts: Vec<_> = self
            .inner
            .contexts
            .lock()
            .expect("composite lock")
            .values()
            .cloned()
            .collect();
        for context in contexts {
            context.cancel();
        }
        self.inner.scheduler.cancel_all();
    }

    pub fn cancel_current_operation(&self) {
        self.inner.scheduler.cancel_current_operation();
    }

    /// Stops the scheduler; further sends fail with a disposed error.
    pub fn dispose(&self) {
        self.inner.scheduler.dispose();
    }

    fn context_for(&self, command: &KernelCommand) -> KernelInvocationContext {
        let mut contexts = self.inner.contexts.lock().expect("composite lock");
        if let Some(existing) = contexts.get(command.token()) {
            return existing.clone();
        }
        if let Some(parent) = command.parent_token() {
            for context in contexts.values() {
                if context.command().token() == parent || context.is_child(parent) {
                    context.track_child(command);
                    return context.clone();
                }
            }
        }
        let context = KernelInvocationContext::new(command.clone());
        contexts.insert(command.token().clone(), context.clone());
        context
    }
}

impl std::fmt::Debug for CompositeKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeKernel")
            .field("name", &self.name())
            .finish()
    }
}

/// Runs one command through the composite's pipeline and settles its
/// completion state on the context.
async fn execute(
    inner: Arc<CompositeInner>,
    command: KernelCommand,
    context: KernelInvocationContext,
) -> anyhow::Result<KernelCommandResult> {
    inner.kernel.handle(command.clone(), context.clone()).await?;
    context.complete(&command);
    if command.is_root() {
        Ok(context
            .result()
            .unwrap_or_else(|| KernelCommandResult::new(CommandOutcome::Succeeded, Vec::new())))
    } else {
        let outcome = context
            .outcome_of(command.token())
            .unwrap_or(CommandOutcome::Succeeded);
        Ok(KernelCommandResult::new(outcome, Vec::new()))
    }
}

enum Resolution {
    Own,
    Attached(Kernel),
    Unresolvable(String),
}

fn resolve(inner: &CompositeInner, command: &KernelCommand) -> Resolution {
    let children = inner.children.lock().expect("composite lock");
    if let Some(destination) = command.destination() {
        if destination == inner.kernel.uri() {
            return Resolution::Own;
        }
        for kernel in children.values() {
            if kernel.uri() == destination || kernel.remote_uri() == Some(destination) {
                return Resolution::Attached(kernel.clone());
            }
        }
        return Resolution::Unresolvable(destination.to_string());
    }
    if let Some(name) = command.target_kernel_name() {
        if name == inner.kernel.name() {
            return Resolution::Own;
        }
        return match children.get(name) {
            Some(kernel) => Resolution::Attached(kernel.clone()),
            None => Resolution::Unresolvable(name.to_string()),
        };
    }
    if command.kind() == CommandKind::RequestKernelInfo {
        return Resolution::Own;
    }
    let default = inner.default_kernel.lock().expect("composite lock").clone();
    match default.and_then(|name| children.get(&name).cloned()) {
        Some(kernel) => Resolution::Attached(kernel),
        None if children.is_empty() => Resolution::Own,
        None => Resolution::Unresolvable(format!("{} (no default kernel)", command.kind())),
    }
}

fn scope_for(inner: &CompositeInner, command: &KernelCommand) -> SchedulingScope {
    match resolve(inner, command) {
        Resolution::Attached(kernel) => inner.scope.child(kernel.name()),
        _ => inner.scope.clone(),
    }
}

/// Built-in middleware: resolves the handling kernel. Commands for another
/// kernel are forwarded to that kernel directly instead of continuing down
/// this pipeline.
async fn route_command(
    inner: Arc<CompositeInner>,
    command: KernelCommand,
    context: KernelInvocationContext,
    next: NextAction,
) -> Result<(), KernelError> {
    match resolve(&inner, &command) {
        Resolution::Own => next(command, context).await,
        Resolution::Attached(kernel) => {
            tracing::debug!(
                kernel = kernel.name(),
                command = %command.kind(),
                "routing command"
            );
            kernel.handle(command, context).await?;
            Ok(())
        }
        Resolution::Unresolvable(target) => Err(KernelError::NoSuitableKernel(target)),
    }
}

/// Built-in middleware: splits a `SubmitCode` whose source interleaves
/// `#!kernel` directives into one sub-command per segment. The sub-commands
/// run in order; the last one to finish signals completion of the whole
/// submission through the root command's context.
async fn split_submissions(
    inner: Arc<CompositeInner>,
    command: KernelCommand,
    context: KernelInvocationContext,
    next: NextAction,
) -> Result<(), KernelError> {
    let code = match command.body().clone() {
        KernelCommandBody::SubmitCode { code } if splitter::has_directives(&code) => code,
        _ => return next(command, context).await,
    };

    let segments = splitter::split_submission(&code);
    let mut planned = Vec::with_capacity(segments.len());
    for segment in segments {
        let target = segment
            .target
            .or_else(|| command.target_kernel_name().map(str::to_string))
            .or_else(|| {
                inner
                    .default_kernel
                    .lock()
                    .expect("composite lock")
                    .clone()
            });
        let Some(target) = target else {
            return Err(KernelError::NoSuitableKernel(
                "submission segment has no target kernel".into(),
            ));
        };
        let Some(kernel) = inner
            .children
            .lock()
            .expect("composite lock")
            .get(&target)
            .cloned()
        else {
            return Err(KernelError::NoSuitableKernel(target));
        };
        planned.push((kernel, segment.code));
    }

    for (kernel, code) in planned {
        let sub = context
            .create_child_command(KernelCommandBody::SubmitCode { code })
            .with_target(kernel.name());
        kernel.handle(sub.clone(), context.clone()).await?;
        context.complete(&sub);
        if let Some(CommandOutcome::Failed { message }) = context.outcome_of(sub.token()) {
            return Err(KernelError::Handler(anyhow::anyhow!(
                "segment for kernel '{}' failed: {message}",
                kernel.name()
            )));
        }
    }
    Ok(())
}
