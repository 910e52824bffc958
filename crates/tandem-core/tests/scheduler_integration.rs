//! Run-loop guarantees: submission-order completion, inline children,
//! deferred operations, cancellation sweeps, disposal.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tandem_core::cancellation::{CancellationSource, CancellationToken};
use tandem_core::error::SchedulerError;
use tandem_core::scheduler::{DeferredOperationSource, KernelScheduler, OnExecute};
use tandem_core::scope::SchedulingScope;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq)]
struct Op {
    id: u32,
    parent: Option<u32>,
}

impl Op {
    fn top(id: u32) -> Self {
        Self { id, parent: None }
    }

    fn child_of(parent: u32, id: u32) -> Self {
        Self {
            id,
            parent: Some(parent),
        }
    }
}

fn scope() -> SchedulingScope {
    SchedulingScope::new("root")
}

#[tokio::test]
async fn top_level_operations_complete_in_submission_order() {
    let scheduler = KernelScheduler::<Op, u32>::new();
    let completions: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    // Later submissions finish their internal async work faster; completion
    // order must still be submission order.
    let record = completions.clone();
    let on_execute: OnExecute<Op, u32> = Arc::new(move |op: Op| {
        let record = record.clone();
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(40u64.saturating_sub(10 * op.id as u64)))
                .await;
            record.lock().unwrap().push(op.id);
            Ok(op.id)
        })
    });

    let submissions = (0..4).map(|id| {
        scheduler.schedule(
            Op::top(id),
            on_execute.clone(),
            scope(),
            CancellationToken::none(),
        )
    });
    let results = futures::future::join_all(submissions).await;

    for (index, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), index as u32);
    }
    assert_eq!(*completions.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn a_child_operation_completes_before_its_parent() {
    let scheduler = Arc::new(KernelScheduler::<Op, u32>::new());
    scheduler.set_child_classifier(|candidate, running| candidate.parent == Some(running.id));

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let child_order = order.clone();
    let child_execute: OnExecute<Op, u32> = Arc::new(move |op: Op| {
        let order = child_order.clone();
        Box::pin(async move {
            order.lock().unwrap().push("child-done");
            Ok(op.id)
        })
    });

    let parent_order = order.clone();
    let parent_scheduler = scheduler.clone();
    let parent_execute: OnExecute<Op, u32> = Arc::new(move |op: Op| {
        let order = parent_order.clone();
        let scheduler = parent_scheduler.clone();
        let child_execute = child_execute.clone();
        Box::pin(async move {
            let child = scheduler
                .schedule(
                    Op::child_of(op.id, 100),
                    child_execute,
                    scope(),
                    CancellationToken::none(),
                )
                .await
                .expect("child runs inline");
            assert_eq!(child, 100);
            order.lock().unwrap().push("parent-done");
            Ok(op.id)
        })
    });

    let result = scheduler
        .schedule(Op::top(1), parent_execute, scope(), CancellationToken::none())
        .await
        .unwrap();
    assert_eq!(result, 1);
    assert_eq!(*order.lock().unwrap(), vec!["child-done", "parent-done"]);
}

#[tokio::test]
async fn cancelling_the_parent_token_fails_outstanding_children() {
    let scheduler = Arc::new(KernelScheduler::<Op, u32>::new());
    scheduler.set_child_classifier(|candidate, running| candidate.parent == Some(running.id));

    let source = CancellationSource::new();
    let parent_running = Arc::new(Notify::new());

    let running = parent_running.clone();
    let parent_execute: OnExecute<Op, u32> = Arc::new(move |_| {
        let running = running.clone();
        Box::pin(async move {
            running.notify_one();
            futures::future::pending::<()>().await;
            unreachable!()
        })
    });

    let parent = {
        let scheduler = scheduler.clone();
        let token = source.token();
        tokio::spawn(async move {
            scheduler
                .schedule(Op::top(1), parent_execute, scope(), token)
                .await
        })
    };
    parent_running.notified().await;

    // Children submitted from elsewhere while the parent runs; they register
    // against the parent's cancellation at creation time.
    let stuck: OnExecute<Op, u32> = Arc::new(|_| {
        Box::pin(async { futures::future::pending::<anyhow::Result<u32>>().await })
    });
    let children: Vec<_> = (0..2)
        .map(|index| {
            let scheduler = scheduler.clone();
            let stuck = stuck.clone();
            tokio::spawn(async move {
                scheduler
                    .schedule(
                        Op::child_of(1, 100 + index),
                        stuck,
                        scope(),
                        CancellationToken::none(),
                    )
                    .await
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(10)).await;

    source.cancel();

    for child in children {
        assert!(matches!(
            child.await.unwrap(),
            Err(SchedulerError::Cancelled)
        ));
    }
    assert!(matches!(
        parent.await.unwrap(),
        Err(SchedulerError::Cancelled)
    ));
}

#[tokio::test]
async fn deferred_operations_run_before_covered_scopes_only() {
    let scheduler = KernelScheduler::<Op, u32>::new();
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let deferred_log = log.clone();
    let deferred_execute: OnExecute<Op, u32> = Arc::new(move |op: Op| {
        let log = deferred_log.clone();
        Box::pin(async move {
            log.lock().unwrap().push(format!("deferred-{}", op.id));
            Ok(op.id)
        })
    });
    scheduler.register_deferred_source(DeferredOperationSource::new(
        SchedulingScope::new("root/a"),
        |op: &Op, _scope| vec![Op::top(op.id + 1000)],
        deferred_execute,
    ));

    let main_log = log.clone();
    let on_execute: OnExecute<Op, u32> = Arc::new(move |op: Op| {
        let log = main_log.clone();
        Box::pin(async move {
            log.lock().unwrap().push(format!("op-{}", op.id));
            Ok(op.id)
        })
    });

    scheduler
        .schedule(
            Op::top(1),
            on_execute.clone(),
            SchedulingScope::new("root/b"),
            CancellationToken::none(),
        )
        .await
        .unwrap();
    scheduler
        .schedule(
            Op::top(2),
            on_execute.clone(),
            SchedulingScope::new("root/a/inner"),
            CancellationToken::none(),
        )
        .await
        .unwrap();
    scheduler
        .schedule(
            Op::top(3),
            on_execute,
            SchedulingScope::new("root/a"),
            CancellationToken::none(),
        )
        .await
        .unwrap();

    // Sibling scope untouched; covered scopes get the deferred op first.
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "op-1".to_string(),
            "deferred-1002".to_string(),
            "op-2".to_string(),
            "deferred-1003".to_string(),
            "op-3".to_string(),
        ]
    );
}

#[tokio::test]
async fn deferred_failures_are_absorbed_unless_propagation_is_requested() {
    let scheduler = KernelScheduler::<Op, u32>::new();

    let failing: OnExecute<Op, u32> =
        Arc::new(|_| Box::pin(async { Err(anyhow::anyhow!("setup failed")) }));
    scheduler.register_deferred_source(DeferredOperationSource::new(
        SchedulingScope::new("root"),
        |_op: &Op, _scope| vec![Op::top(999)],
        failing.clone(),
    ));

    let on_execute: OnExecute<Op, u32> = Arc::new(|op: Op| Box::pin(async move { Ok(op.id) }));
    let result = scheduler
        .schedule(
            Op::top(1),
            on_execute.clone(),
            scope(),
            CancellationToken::none(),
        )
        .await;
    assert_eq!(result.unwrap(), 1);

    let strict = KernelScheduler::<Op, u32>::new();
    strict.register_deferred_source(
        DeferredOperationSource::new(
            SchedulingScope::new("root"),
            |_op: &Op, _scope| vec![Op::top(999)],
            failing,
        )
        .propagate_failures(true),
    );
    let err = strict
        .schedule(Op::top(1), on_execute, scope(), CancellationToken::none())
        .await
        .expect_err("deferred failure propagates");
    assert!(matches!(err, SchedulerError::HandlerFault(_)));
    assert!(err.to_string().contains("deferred operation failed"));
}

#[tokio::test]
async fn cancel_all_sweeps_queued_work_and_the_loop_resumes() {
    let scheduler = Arc::new(KernelScheduler::<Op, u32>::new());

    let running = Arc::new(Notify::new());
    let running_signal = running.clone();
    let blocker: OnExecute<Op, u32> = Arc::new(move |_| {
        let running = running_signal.clone();
        Box::pin(async move {
            running.notify_one();
            futures::future::pending::<()>().await;
            unreachable!()
        })
    });
    let quick: OnExecute<Op, u32> = Arc::new(|op: Op| Box::pin(async move { Ok(op.id) }));

    let first = {
        let scheduler = scheduler.clone();
        let blocker = blocker.clone();
        tokio::spawn(async move {
            scheduler
                .schedule(Op::top(1), blocker, scope(), CancellationToken::none())
                .await
        })
    };
    running.notified().await;

    let queued = {
        let scheduler = scheduler.clone();
        let quick = quick.clone();
        tokio::spawn(async move {
            scheduler
                .schedule(Op::top(2), quick, scope(), CancellationToken::none())
                .await
        })
    };
    // Let the queued operation actually enqueue before the sweep.
    tokio::time::sleep(Duration::from_millis(10)).await;

    scheduler.cancel_all();

    assert!(matches!(
        first.await.unwrap(),
        Err(SchedulerError::Cancelled)
    ));
    assert!(matches!(
        queued.await.unwrap(),
        Err(SchedulerError::Cancelled)
    ));

    // The worker survives the sweep and accepts fresh work.
    let result = scheduler
        .schedule(Op::top(3), quick, scope(), CancellationToken::none())
        .await
        .unwrap();
    assert_eq!(result, 3);
}

#[tokio::test]
async fn disposal_fails_queued_operations() {
    let scheduler = Arc::new(KernelScheduler::<Op, u32>::new());

    let running = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let running_signal = running.clone();
    let release_wait = release.clone();
    let blocker: OnExecute<Op, u32> = Arc::new(move |op: Op| {
        let running = running_signal.clone();
        let release = release_wait.clone();
        Box::pin(async move {
            running.notify_one();
            release.notified().await;
            Ok(op.id)
        })
    });
    let quick: OnExecute<Op, u32> = Arc::new(|op: Op| Box::pin(async move { Ok(op.id) }));

    let first = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler
                .schedule(Op::top(1), blocker, scope(), CancellationToken::none())
                .await
        })
    };
    running.notified().await;

    let queued = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler
                .schedule(Op::top(2), quick, scope(), CancellationToken::none())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    scheduler.dispose();
    release.notify_one();

    // The in-flight operation finishes; everything queued is rejected.
    assert_eq!(first.await.unwrap().unwrap(), 1);
    assert!(matches!(
        queued.await.unwrap(),
        Err(SchedulerError::Disposed)
    ));
}
