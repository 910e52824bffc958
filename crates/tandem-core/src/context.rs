//! Per-root-command invocation context.
//!
//! One context is established when a root command enters a kernel tree and is
//! reused, not recreated, for every nested command sharing that root. It owns
//! the command's cancellation source, the set of live child commands, and the
//! ordered event stream, and it decides which published events are visible to
//! the command's subscribers.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use url::Url;

use crate::cancellation::{CancellationSource, CancellationToken};
use crate::command::{CommandOutcome, KernelCommand, KernelCommandBody, KernelCommandResult};
use crate::event::{KernelEvent, KernelEventBody};
use crate::token::CommandToken;

struct ContextState {
    children: HashSet<CommandToken>,
    subscribers: Vec<mpsc::UnboundedSender<KernelEvent>>,
    events: Vec<KernelEvent>,
    result: Option<KernelCommandResult>,
    complete: bool,
}

struct ContextInner {
    command: KernelCommand,
    cancellation: CancellationSource,
    child_counter: AtomicU64,
    state: Mutex<ContextState>,
}

/// Cheap-to-clone handle. `origin` is handle-local: a kernel hands its
/// handlers a handle scoped to its own URI so published events get stamped
/// with the kernel they came from.
#[derive(Clone)]
pub struct KernelInvocationContext {
    inner: Arc<ContextInner>,
    origin: Option<Url>,
}

impl KernelInvocationContext {
    pub fn new(command: KernelCommand) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                command,
                cancellation: CancellationSource::new(),
                child_counter: AtomicU64::new(0),
                state: Mutex::new(ContextState {
                    children: HashSet::new(),
                    subscribers: Vec::new(),
                    events: Vec::new(),
                    result: None,
                    complete: false,
                }),
            }),
            origin: None,
        }
    }

    /// The root command this context was established for.
    pub fn command(&self) -> &KernelCommand {
        &self.inner.command
    }

    /// A handle that stamps published events with `origin`.
    pub fn with_origin(&self, origin: Url) -> Self {
        Self {
            inner: self.inner.clone(),
            origin: Some(origin),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation.token()
    }

    /// An ordered stream of the events visible to this context. The stream
    /// ends when the root command completes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<KernelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .state
            .lock()
            .expect("context lock")
            .subscribers
            .push(tx);
        rx
    }

    /// Derives and tracks the next child command of the root.
    pub fn create_child_command(&self, body: KernelCommandBody) -> KernelCommand {
        let index = self.inner.child_counter.fetch_add(1, Ordering::SeqCst);
        let child = KernelCommand::child_of(&self.inner.command, index, body);
        self.track_child(&child);
        child
    }

    pub fn track_child(&self, command: &KernelCommand) {
        self.inner
            .state
            .lock()
            .expect("context lock")
            .children
            .insert(command.token().clone());
    }

    pub fn is_child(&self, token: &CommandToken) -> bool {
        self.inner
            .state
            .lock()
            .expect("context lock")
            .children
            .contains(token)
    }

    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().expect("context lock").complete
    }

    /// Terminal result, once the root command has completed.
    pub fn result(&self) -> Option<KernelCommandResult> {
        self.inner.state.lock().expect("context lock").result.clone()
    }

    /// The most recent terminal outcome observed for `token` on this
    /// context's stream, if any.
    pub fn outcome_of(&self, token: &CommandToken) -> Option<CommandOutcome> {
        let state = self.inner.state.lock().expect("context lock");
        state.events.iter().rev().find_map(|event| {
            if event.command().token() != token {
                return None;
            }
            match event.body() {
                KernelEventBody::CommandSucceeded => Some(CommandOutcome::Succeeded),
                KernelEventBody::CommandFailed { message } => Some(CommandOutcome::Failed {
                    message: message.clone(),
                }),
                _ => None,
            }
        })
    }

    /// Publishes an event if it is visible to this context: events are
    /// dropped once the context is complete, and events about commands that
    /// are neither the root nor a tracked child never leak into the stream.
    pub fn publish(&self, event: KernelEvent) {
        let mut state = self.inner.state.lock().expect("context lock");
        if state.complete {
            return;
        }
        let token = event.command().token();
        let visible =
            token == self.inner.command.token() || state.children.contains(token);
        if !visible {
            tracing::debug!(
                event = %event.kind(),
                command = %token,
                "dropping event from untracked command"
            );
            return;
        }
        if let Some(origin) = &self.origin {
            if !event.routing_slip().contains(origin) {
                // The slip was seeded from the command's path; duplicates are
                // excluded by the contains check above.
                let _ = event.routing_slip().stamp(origin);
            }
        }
        deliver(&mut state, event);
    }

    /// Marks `command` as done. For the root command this finalizes the
    /// context; for a tracked child it only emits the scoped success event
    /// and forgets the child.
    pub fn complete(&self, command: &KernelCommand) {
        let mut state = self.inner.state.lock().expect("context lock");
        if state.complete {
            return;
        }
        if command.token() == self.inner.command.token() {
            deliver(
                &mut state,
                KernelEvent::new(KernelEventBody::CommandSucceeded, self.inner.command.clone()),
            );
            finalize(&mut state, CommandOutcome::Succeeded);
        } else if state.children.remove(command.token()) {
            deliver(
                &mut state,
                KernelEvent::new(KernelEventBody::CommandSucceeded, command.clone()),
            );
        }
    }

    /// Fails `command`. Root failure finalizes the context; child failure
    /// emits the scoped failure event and the context lives on.
    pub fn fail(&self, command: &KernelCommand, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.inner.state.lock().expect("context lock");
        if state.complete {
            return;
        }
        if command.token() == self.inner.command.token() {
            deliver(
                &mut state,
                KernelEvent::new(
                    KernelEventBody::CommandFailed {
                        message: message.clone(),
                    },
                    self.inner.command.clone(),
                ),
            );
            finalize(&mut state, CommandOutcome::Failed { message });
        } else if state.children.remove(command.token()) {
            deliver(
                &mut state,
                KernelEvent::new(KernelEventBody::CommandFailed { message }, command.clone()),
            );
        }
    }

    /// Requests cancellation and fails the context with the cancellation
    /// outcome. Idempotent: a context that already completed is left alone.
    pub fn cancel(&self) {
        self.inner.cancellation.cancel();
        let mut state = self.inner.state.lock().expect("context lock");
        if state.complete {
            return;
        }
        deliver(
            &mut state,
            KernelEvent::new(
                KernelEventBody::CommandFailed {
                    message: "command was cancelled".into(),
                },
                self.inner.command.clone(),
            ),
        );
        finalize(&mut state, CommandOutcome::Cancelled);
    }
}

fn deliver(state: &mut ContextState, event: KernelEvent) {
    state.events.push(event.clone());
    state
        .subscribers
        .retain(|subscriber| subscriber.send(event.clone()).is_ok());
}

fn finalize(state: &mut ContextState, outcome: CommandOutcome) {
    state.result = Some(KernelCommandResult::new(outcome, state.events.clone()));
    state.complete = true;
    state.subscribers.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::KernelCommandBody;

    fn submit(code: &str) -> KernelCommand {
        KernelCommand::new(KernelCommandBody::SubmitCode { code: code.into() })
    }

    #[tokio::test]
    async fn events_from_untracked_commands_are_invisible() {
        let root = submit("a");
        let ctx = KernelInvocationContext::new(root.clone());
        let mut events = ctx.subscribe();

        let stranger = submit("b");
        ctx.publish(KernelEvent::new(
            KernelEventBody::DisplayedValueProduced { value: "x".into() },
            stranger,
        ));
        ctx.complete(&root);

        let first = events.recv().await.expect("terminal event");
        assert_eq!(first.kind(), crate::event::EventKind::CommandSucceeded);
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn child_completion_does_not_finalize_the_context() {
        let root = submit("parent");
        let ctx = KernelInvocationContext::new(root.clone());
        let child = ctx.create_child_command(KernelCommandBody::SubmitCode { code: "c".into() });

        ctx.complete(&child);
        assert!(!ctx.is_complete());
        assert!(!ctx.is_child(child.token()));

        ctx.complete(&root);
        assert!(ctx.is_complete());
        let result = ctx.result().expect("result");
        assert!(result.is_success());
        // Child success, then root success, in that order.
        let kinds: Vec<_> = result.events().iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                crate::event::EventKind::CommandSucceeded,
                crate::event::EventKind::CommandSucceeded
            ]
        );
        assert_eq!(result.events()[0].command().token(), child.token());
        assert_eq!(result.events()[1].command().token(), root.token());
    }

    #[test]
    fn cancel_is_idempotent_and_distinguishable() {
        let root = submit("a");
        let ctx = KernelInvocationContext::new(root.clone());
        ctx.cancel();
        ctx.cancel();
        let result = ctx.result().expect("result");
        assert_eq!(result.outcome(), &CommandOutcome::Cancelled);
        assert!(ctx.cancellation_token().is_cancelled());
    }

    #[test]
    fn publish_after_completion_is_a_no_op() {
        let root = submit("a");
        let ctx = KernelInvocationContext::new(root.clone());
        ctx.complete(&root);
        let before = ctx.result().expect("result").events().len();
        ctx.publish(KernelEvent::new(
            KernelEventBody::DisplayedValueProduced { value: "late".into() },
            root,
        ));
        assert_eq!(ctx.result().expect("result").events().len(), before);
    }
}
