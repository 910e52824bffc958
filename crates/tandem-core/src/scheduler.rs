//! The run-loop scheduler.
//!
//! One dedicated worker task per scheduler instance drains a FIFO of
//! top-level operations; that worker is the only place top-level
//! serialization is enforced. Before a top-level operation runs, every
//! registered deferred-operation source whose scope covers the operation's
//! scope is asked for work that must precede it. Operations classified as
//! children of the value currently running execute inline on the calling
//! task instead of being queued; a participant barrier keeps the worker from
//! completing the parent while inline work is still in flight.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;

use crate::cancellation::{CancellationSource, CancellationToken};
use crate::error::SchedulerError;
use crate::scope::SchedulingScope;

pub type OnExecute<T, R> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;

pub type ChildClassifier<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Provider of operations that must run immediately before a top-level
/// operation in a covered scope. Sources are consulted in registration
/// order; the values each returns run sequentially, in order, before the
/// primary operation.
pub struct DeferredOperationSource<T, R> {
    scope: SchedulingScope,
    generate: Arc<dyn Fn(&T, &SchedulingScope) -> Vec<T> + Send + Sync>,
    on_execute: OnExecute<T, R>,
    propagate_failures: bool,
}

impl<T, R> DeferredOperationSource<T, R> {
    pub fn new(
        scope: SchedulingScope,
        generate: impl Fn(&T, &SchedulingScope) -> Vec<T> + Send + Sync + 'static,
        on_execute: OnExecute<T, R>,
    ) -> Self {
        Self {
            scope,
            generate: Arc::new(generate),
            on_execute,
            propagate_failures: false,
        }
    }

    /// By default a failing deferred operation is logged and the primary
    /// operation still runs; with this set, the failure fails the primary.
    pub fn propagate_failures(mut self, propagate: bool) -> Self {
        self.propagate_failures = propagate;
        self
    }
}

impl<T, R> Clone for DeferredOperationSource<T, R> {
    fn clone(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            generate: self.generate.clone(),
            on_execute: self.on_execute.clone(),
            propagate_failures: self.propagate_failures,
        }
    }
}

type CompletionSlot<R> = Arc<Mutex<Option<oneshot::Sender<Result<R, SchedulerError>>>>>;

/// Take-once completion: whoever completes first wins, later attempts are
/// skipped (a cancellation sweep may race the run loop).
fn complete_slot<R>(slot: &CompletionSlot<R>, result: Result<R, SchedulerError>) {
    if let Some(sender) = slot.lock().expect("completion lock").take() {
        let _ = sender.send(result);
    }
}

struct ScheduledOperation<T, R> {
    value: T,
    on_execute: OnExecute<T, R>,
    scope: SchedulingScope,
    token: CancellationToken,
    completion: CompletionSlot<R>,
    propagate_failures: bool,
}

#[derive(Default)]
struct ChildBarrier {
    active: AtomicUsize,
    idle: Notify,
}

impl ChildBarrier {
    fn enter(barrier: &Arc<ChildBarrier>) -> BarrierGuard {
        barrier.active.fetch_add(1, Ordering::SeqCst);
        BarrierGuard(barrier.clone())
    }

    fn exit(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.idle.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Releases the barrier even if the inline execution future is dropped
/// mid-flight (a cancelled parent abandons the futures nested inside it).
struct BarrierGuard(Arc<ChildBarrier>);

impl Drop for BarrierGuard {
    fn drop(&mut self) {
        self.0.exit();
    }
}

struct CurrentOperation<T, R> {
    value: T,
    cancel: CancellationSource,
    barrier: Arc<ChildBarrier>,
    completion: CompletionSlot<R>,
}

struct SchedulerState<T, R> {
    queue: Mutex<VecDeque<ScheduledOperation<T, R>>>,
    deferred: Mutex<VecDeque<ScheduledOperation<T, R>>>,
    work: Notify,
    sources: Mutex<Vec<DeferredOperationSource<T, R>>>,
    current: Mutex<Option<CurrentOperation<T, R>>>,
    classifier: Mutex<Option<ChildClassifier<T>>>,
    disposed: AtomicBool,
}

/// Serializes operations for one scheduling scope tree. Must be created
/// inside a tokio runtime; the worker task lives until [`dispose`] is called
/// or the scheduler is dropped.
///
/// [`dispose`]: KernelScheduler::dispose
pub struct KernelScheduler<T, R> {
    state: Arc<SchedulerState<T, R>>,
    _worker: JoinHandle<()>,
}

impl<T, R> KernelScheduler<T, R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    pub fn new() -> Self {
        let state = Arc::new(SchedulerState {
            queue: Mutex::new(VecDeque::new()),
            deferred: Mutex::new(VecDeque::new()),
            work: Notify::new(),
            sources: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            classifier: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });
        let worker = tokio::spawn(run_loop(state.clone()));
        Self {
            state,
            _worker: worker,
        }
    }

    /// Installs the predicate deciding whether a newly scheduled value is a
    /// child of the value currently running. Without one, everything is
    /// top-level.
    pub fn set_child_classifier(
        &self,
        classifier: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
    ) {
        *self.state.classifier.lock().expect("scheduler lock") = Some(Arc::new(classifier));
    }

    pub fn register_deferred_source(&self, source: DeferredOperationSource<T, R>) {
        self.state
            .sources
            .lock()
            .expect("scheduler lock")
            .push(source);
    }

    /// Submits `value` for execution. Top-level work resolves when the run
    /// loop reaches it; work classified as a child of the running operation
    /// executes inline, immediately, on the calling task.
    pub async fn schedule(
        &self,
        value: T,
        on_execute: OnExecute<T, R>,
        scope: SchedulingScope,
        token: CancellationToken,
    ) -> Result<R, SchedulerError> {
        if self.state.disposed.load(Ordering::SeqCst) {
            return Err(SchedulerError::Disposed);
        }

        let inline = {
            let current = self.state.current.lock().expect("scheduler lock");
            let classifier = self.state.classifier.lock().expect("scheduler lock").clone();
            match (current.as_ref(), classifier) {
                (Some(running), Some(is_child)) if is_child(&value, &running.value) => {
                    let guard = ChildBarrier::enter(&running.barrier);
                    let op_cancel = CancellationSource::new();
                    token.link_child(&op_cancel);
                    running.cancel.token().link_child(&op_cancel);
                    Some((guard, op_cancel))
                }
                _ => None,
            }
        };

        if let Some((_guard, op_cancel)) = inline {
            let cancelled = op_cancel.token();
            let exec = (on_execute)(value);
            return tokio::select! {
                biased;
                _ = cancelled.cancelled() => Err(SchedulerError::Cancelled),
                outcome = exec => outcome.map_err(SchedulerError::HandlerFault),
            };
        }

        let (sender, receiver) = oneshot::channel();
        let operation = ScheduledOperation {
            value,
            on_execute,
            scope,
            token,
            completion: Arc::new(Mutex::new(Some(sender))),
            propagate_failures: false,
        };
        {
            let mut queue = self.state.queue.lock().expect("scheduler lock");
            if self.state.disposed.load(Ordering::SeqCst) {
                return Err(SchedulerError::Disposed);
            }
            queue.push_back(operation);
        }
        self.state.work.notify_one();

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::Disposed),
        }
    }

    /// Fails the currently running top-level operation with a cancellation
    /// result and clears the running marker. The run loop is untouched and
    /// proceeds to the next queued operation.
    pub fn cancel_current_operation(&self) {
        let current = self.state.current.lock().expect("scheduler lock").take();
        if let Some(operation) = current {
            complete_slot(&operation.completion, Err(SchedulerError::Cancelled));
            operation.cancel.cancel();
        }
    }

    /// Cancels the in-flight operation and fails everything queued, both
    /// top-level and deferred, then lets the loop resume with new work.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = {
            let mut deferred = self.state.deferred.lock().expect("scheduler lock");
            deferred.drain(..).collect()
        };
        for operation in drained {
            complete_slot(&operation.completion, Err(SchedulerError::Cancelled));
        }
        let drained: Vec<_> = {
            let mut queue = self.state.queue.lock().expect("scheduler lock");
            queue.drain(..).collect()
        };
        for operation in drained {
            complete_slot(&operation.completion, Err(SchedulerError::Cancelled));
        }
        self.cancel_current_operation();
    }

    /// Signals the worker to stop once the current operation finishes.
    /// Everything still queued fails with [`SchedulerError::Disposed`].
    pub fn dispose(&self) {
        if self.state.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.work.notify_one();
    }

    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::SeqCst)
    }
}

impl<T, R> Default for KernelScheduler<T, R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, R> Drop for KernelScheduler<T, R> {
    fn drop(&mut self) {
        if !self.state.disposed.swap(true, Ordering::SeqCst) {
            self.state.work.notify_one();
        }
    }
}

async fn run_loop<T, R>(state: Arc<SchedulerState<T, R>>)
where
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    loop {
        let operation = loop {
            if state.disposed.load(Ordering::SeqCst) {
                drain_disposed(&state);
                return;
            }
            let next = state.queue.lock().expect("scheduler lock").pop_front();
            match next {
                Some(operation) => break operation,
                None => state.work.notified().await,
            }
        };
        run_top_level(&state, operation).await;
    }
}

async fn run_top_level<T, R>(state: &Arc<SchedulerState<T, R>>, operation: ScheduledOperation<T, R>)
where
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    gather_deferred(state, &operation);
    loop {
        let deferred = state
            .deferred
            .lock()
            .expect("scheduler lock")
            .pop_front();
        let Some(deferred) = deferred else { break };
        let propagate = deferred.propagate_failures;
        match run_operation(state, deferred).await {
            Ok(()) => {}
            Err(description) if propagate => {
                // Drop whatever deferred work is still pending so it cannot
                // leak in front of the next top-level operation.
                state.deferred.lock().expect("scheduler lock").clear();
                complete_slot(
                    &operation.completion,
                    Err(SchedulerError::HandlerFault(anyhow::anyhow!(
                        "deferred operation failed: {description}"
                    ))),
                );
                return;
            }
            Err(description) => {
                tracing::warn!(error = %description, "deferred operation failed; continuing");
            }
        }
    }
    if let Err(description) = run_operation(state, operation).await {
        // Already reported through the operation's promise; the loop must
        // survive every handler outcome.
        tracing::debug!(error = %description, "top-level operation did not succeed");
    }
}

/// Runs one operation to completion on the worker, resolving its promise.
/// The `Err` carries a description for the deferred-propagation path; the
/// caller decides whether anyone else needs to hear about it.
async fn run_operation<T, R>(
    state: &Arc<SchedulerState<T, R>>,
    operation: ScheduledOperation<T, R>,
) -> Result<(), String>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    let ScheduledOperation {
        value,
        on_execute,
        token,
        completion,
        ..
    } = operation;

    let op_cancel = CancellationSource::new();
    token.link_child(&op_cancel);
    let barrier = Arc::new(ChildBarrier::default());
    {
        *state.current.lock().expect("scheduler lock") = Some(CurrentOperation {
            value: value.clone(),
            cancel: op_cancel.clone(),
            barrier: barrier.clone(),
            completion: completion.clone(),
        });
    }

    let cancelled = op_cancel.token();
    let exec = (on_execute)(value);
    let result = tokio::select! {
        biased;
        _ = cancelled.cancelled() => Err(SchedulerError::Cancelled),
        outcome = exec => outcome.map_err(SchedulerError::HandlerFault),
    };

    // Stop accepting new inline children, then wait out the ones already
    // registered: their results must be observable before the parent's.
    let _ = state.current.lock().expect("scheduler lock").take();
    barrier.wait_idle().await;

    let description = match &result {
        Ok(_) => None,
        Err(err) => Some(err.to_string()),
    };
    complete_slot(&completion, result);
    match description {
        None => Ok(()),
        Some(description) => Err(description),
    }
}

fn gather_deferred<T, R>(state: &Arc<SchedulerState<T, R>>, operation: &ScheduledOperation<T, R>)
where
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    let sources = state.sources.lock().expect("scheduler lock").clone();
    let mut generated = Vec::new();
    for source in sources
        .iter()
        .filter(|source| source.scope.covers(&operation.scope))
    {
        for value in (source.generate)(&operation.value, &operation.scope) {
            generated.push(ScheduledOperation {
                value,
                on_execute: source.on_execute.clone(),
                scope: operation.scope.clone(),
                token: operation.token.clone(),
                completion: Arc::new(Mutex::new(None)),
                propagate_failures: source.propagate_failures,
            });
        }
    }
    if !generated.is_empty() {
        state
            .deferred
            .lock()
            .expect("scheduler lock")
            .extend(generated);
    }
}

fn drain_disposed<T, R>(state: &SchedulerState<T, R>) {
    let drained: Vec<_> = {
        let mut queue = state.queue.lock().expect("scheduler lock");
        queue.drain(..).collect()
    };
    for operation in drained {
        complete_slot(&operation.completion, Err(SchedulerError::Disposed));
    }
    let drained: Vec<_> = {
        let mut deferred = state.deferred.lock().expect("scheduler lock");
        deferred.drain(..).collect()
    };
    for operation in drained {
        complete_slot(&operation.completion, Err(SchedulerError::Disposed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_execute() -> OnExecute<u32, u32> {
        Arc::new(|value| Box::pin(async move { Ok(value) }))
    }

    #[tokio::test]
    async fn completes_a_single_operation() {
        let scheduler = KernelScheduler::<u32, u32>::new();
        let result = scheduler
            .schedule(
                7,
                noop_execute(),
                SchedulingScope::new("root"),
                CancellationToken::none(),
            )
            .await
            .expect("operation completes");
        assert_eq!(result, 7);
    }

    #[tokio::test]
    async fn handler_faults_surface_through_the_promise() {
        let scheduler = KernelScheduler::<u32, u32>::new();
        let failing: OnExecute<u32, u32> =
            Arc::new(|_| Box::pin(async { Err(anyhow::anyhow!("no")) }));
        let err = scheduler
            .schedule(
                1,
                failing,
                SchedulingScope::new("root"),
                CancellationToken::none(),
            )
            .await
            .expect_err("fault expected");
        assert!(matches!(err, SchedulerError::HandlerFault(_)));

        // The loop survives the fault.
        let result = scheduler
            .schedule(
                2,
                noop_execute(),
                SchedulingScope::new("root"),
                CancellationToken::none(),
            )
            .await
            .expect("loop still running");
        assert_eq!(result, 2);
    }

    #[tokio::test]
    async fn disposed_scheduler_rejects_new_work() {
        let scheduler = KernelScheduler::<u32, u32>::new();
        scheduler.dispose();
        let err = scheduler
            .schedule(
                1,
                noop_execute(),
                SchedulingScope::new("root"),
                CancellationToken::none(),
            )
            .await
            .expect_err("disposed");
        assert!(matches!(err, SchedulerError::Disposed));
    }
}
