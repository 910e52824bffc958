//! Composite kernel behavior: routing, nested commands, directive
//! splitting, deferred setup commands, and cancellation.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tandem_core::{
    CommandKind, CommandOutcome, CompositeKernel, EventKind, HandlerFn, Kernel, KernelCommand,
    KernelCommandBody, KernelEventBody,
};
use tokio::sync::Notify;
use url::Url;

fn submit(code: &str) -> KernelCommand {
    KernelCommand::new(KernelCommandBody::SubmitCode { code: code.into() })
}

/// A kernel whose SubmitCode handler records what it ran.
fn recording_kernel(name: &str, log: Arc<Mutex<Vec<String>>>) -> Kernel {
    let kernel = Kernel::new(name);
    let kernel_name = name.to_string();
    kernel.register_handler(
        CommandKind::SubmitCode,
        HandlerFn::new(move |command, context| {
            let log = log.clone();
            let kernel_name = kernel_name.clone();
            Box::pin(async move {
                let KernelCommandBody::SubmitCode { code } = command.body() else {
                    anyhow::bail!("unexpected body");
                };
                log.lock().unwrap().push(format!("{kernel_name}:{code}"));
                context.publish(tandem_core::KernelEvent::new(
                    KernelEventBody::DisplayedValueProduced { value: code.clone() },
                    command.clone(),
                ));
                Ok(())
            }) as BoxFuture<'static, anyhow::Result<()>>
        }),
    );
    kernel
}

#[tokio::test]
async fn a_nested_command_completes_before_its_parent_and_events_are_ordered() {
    let composite = CompositeKernel::new("root");
    let echo = Kernel::new("echo");

    let composite_for_handler = composite.clone();
    echo.register_handler(
        CommandKind::SubmitCode,
        HandlerFn::new(move |command, context| {
            let composite = composite_for_handler.clone();
            Box::pin(async move {
                let KernelCommandBody::SubmitCode { code } = command.body() else {
                    anyhow::bail!("unexpected body");
                };
                if code == "parent" {
                    let child = context.create_child_command(KernelCommandBody::SubmitCode {
                        code: "child".into(),
                    });
                    let result = composite.send(child).await?;
                    // The child's result is in hand before the parent finishes.
                    assert!(result.is_success());
                } else {
                    context.publish(tandem_core::KernelEvent::new(
                        KernelEventBody::CodeSubmissionReceived { code: code.clone() },
                        command.clone(),
                    ));
                }
                Ok(())
            }) as BoxFuture<'static, anyhow::Result<()>>
        }),
    );
    composite.add_kernel(echo).unwrap();

    let command = submit("parent");
    let root_token = command.token().clone();
    let result = composite.send(command).await.unwrap();
    assert!(result.is_success());

    let kinds: Vec<EventKind> = result.events().iter().map(|event| event.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::CodeSubmissionReceived, // child started
            EventKind::CommandSucceeded,       // child completed
            EventKind::CommandSucceeded,       // parent completed
        ]
    );
    assert_ne!(result.events()[1].command().token(), &root_token);
    assert_eq!(result.events()[2].command().token(), &root_token);
}

#[tokio::test]
async fn submissions_complete_in_order_even_when_later_ones_are_faster() {
    let composite = CompositeKernel::new("root");
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let kernel = Kernel::new("sleepy");
    let record = order.clone();
    kernel.register_handler(
        CommandKind::SubmitCode,
        HandlerFn::new(move |command, _context| {
            let record = record.clone();
            Box::pin(async move {
                let KernelCommandBody::SubmitCode { code } = command.body() else {
                    anyhow::bail!("unexpected body");
                };
                let delay = 30u64.saturating_sub(10 * code.parse::<u64>().unwrap_or(0));
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                record.lock().unwrap().push(code.clone());
                Ok(())
            }) as BoxFuture<'static, anyhow::Result<()>>
        }),
    );
    composite.add_kernel(kernel).unwrap();

    let sends = (0..3).map(|index| composite.send(submit(&index.to_string())));
    let results = futures::future::join_all(sends).await;
    for result in results {
        assert!(result.unwrap().is_success());
    }
    assert_eq!(*order.lock().unwrap(), vec!["0", "1", "2"]);
}

#[tokio::test]
async fn directive_splitting_dispatches_each_segment_to_its_kernel() {
    let composite = CompositeKernel::new("root");
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    composite
        .add_kernel(recording_kernel("csharp", log.clone()))
        .unwrap();
    composite
        .add_kernel(recording_kernel("sql", log.clone()))
        .unwrap();

    let result = composite
        .send(submit("#!csharp\nvar x = 1;\n#!sql\nselect 1"))
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(
        *log.lock().unwrap(),
        vec!["csharp:var x = 1;".to_string(), "sql:select 1".to_string()]
    );

    // One success event per sub-command, then the root's.
    let successes = result
        .events()
        .iter()
        .filter(|event| event.kind() == EventKind::CommandSucceeded)
        .count();
    assert_eq!(successes, 3);
}

#[tokio::test]
async fn splitting_fails_whole_submission_when_a_segment_names_an_unknown_kernel() {
    let composite = CompositeKernel::new("root");
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    composite
        .add_kernel(recording_kernel("csharp", log.clone()))
        .unwrap();

    let result = composite
        .send(submit("#!csharp\nvar x = 1;\n#!fortran\nprint *, 1"))
        .await
        .unwrap();
    match result.outcome() {
        CommandOutcome::Failed { message } => assert!(message.contains("fortran")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn commands_route_by_destination_uri_then_target_name_then_default() {
    let composite = CompositeKernel::new("root");
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    composite
        .add_kernel(recording_kernel("csharp", log.clone()))
        .unwrap();
    composite
        .add_kernel(recording_kernel("sql", log.clone()))
        .unwrap();

    composite
        .send(submit("by-destination").with_destination(Url::parse("kernel://sql").unwrap()))
        .await
        .unwrap();
    composite
        .send(submit("by-name").with_target("sql"))
        .await
        .unwrap();
    composite.send(submit("by-default")).await.unwrap();

    composite.set_default_kernel("sql").unwrap();
    composite.send(submit("by-new-default")).await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "sql:by-destination".to_string(),
            "sql:by-name".to_string(),
            "csharp:by-default".to_string(),
            "sql:by-new-default".to_string(),
        ]
    );
}

#[tokio::test]
async fn an_unresolvable_target_fails_with_no_suitable_kernel() {
    let composite = CompositeKernel::new("root");
    composite
        .add_kernel(recording_kernel("csharp", Arc::new(Mutex::new(Vec::new()))))
        .unwrap();

    let result = composite
        .send(submit("code").with_target("nope"))
        .await
        .unwrap();
    match result.outcome() {
        CommandOutcome::Failed { message } => assert!(message.contains("nope")),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn deferred_commands_run_before_the_first_user_command() {
    let composite = CompositeKernel::new("root");

    let observed: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let kernel = Kernel::new("csharp");
    let observed_in_handler = observed.clone();
    let kernel_for_handler = kernel.clone();
    kernel.register_handler(
        CommandKind::SubmitCode,
        HandlerFn::new(move |_command, _context| {
            let observed = observed_in_handler.clone();
            let kernel = kernel_for_handler.clone();
            Box::pin(async move {
                // The deferred SendValue must have run already.
                *observed.lock().unwrap() = kernel.value("shared");
                Ok(())
            }) as BoxFuture<'static, anyhow::Result<()>>
        }),
    );
    composite.add_kernel(kernel).unwrap();

    composite.defer_command(
        KernelCommand::new(KernelCommandBody::SendValue {
            name: "shared".into(),
            value: "42".into(),
        })
        .with_target("csharp"),
    );

    let result = composite.send(submit("use shared")).await.unwrap();
    assert!(result.is_success());
    assert_eq!(observed.lock().unwrap().as_deref(), Some("42"));
}

#[tokio::test]
async fn a_cancel_command_interrupts_the_running_submission() {
    let composite = CompositeKernel::new("root");

    let running = Arc::new(Notify::new());
    let kernel = Kernel::new("slow");
    let running_signal = running.clone();
    kernel.register_handler(
        CommandKind::SubmitCode,
        HandlerFn::new(move |_command, _context| {
            let running = running_signal.clone();
            Box::pin(async move {
                running.notify_one();
                futures::future::pending::<anyhow::Result<()>>().await
            }) as BoxFuture<'static, anyhow::Result<()>>
        }),
    );
    composite.add_kernel(kernel).unwrap();

    let stuck = {
        let composite = composite.clone();
        tokio::spawn(async move { composite.send(submit("forever")).await })
    };
    running.notified().await;

    let cancel = composite
        .send(KernelCommand::new(KernelCommandBody::Cancel))
        .await
        .unwrap();
    assert!(cancel.is_success());

    let result = stuck.await.unwrap().unwrap();
    assert_eq!(result.outcome(), &CommandOutcome::Cancelled);

    // The tree keeps serving after the sweep.
    let log = Arc::new(Mutex::new(Vec::new()));
    composite
        .add_kernel(recording_kernel("echo", log.clone()))
        .unwrap();
    let next = composite
        .send(submit("still alive").with_target("echo"))
        .await
        .unwrap();
    assert!(next.is_success());
}

#[tokio::test]
async fn request_kernel_info_without_target_answers_for_the_composite() {
    let composite = CompositeKernel::new("root");
    composite
        .add_kernel(recording_kernel("csharp", Arc::new(Mutex::new(Vec::new()))))
        .unwrap();

    let result = composite
        .send(KernelCommand::new(KernelCommandBody::RequestKernelInfo))
        .await
        .unwrap();
    assert!(result.is_success());
    let info = result
        .events()
        .iter()
        .find_map(|event| match event.body() {
            KernelEventBody::KernelInfoProduced { kernel_info } => Some(kernel_info.clone()),
            _ => None,
        })
        .expect("kernel info event");
    assert_eq!(info.name, "root");
}

#[tokio::test]
async fn redelivering_the_same_command_trips_the_routing_slip() {
    let composite = CompositeKernel::new("root");
    composite
        .add_kernel(recording_kernel("csharp", Arc::new(Mutex::new(Vec::new()))))
        .unwrap();

    let command = submit("once");
    let first = composite.send(command.clone()).await.unwrap();
    assert!(first.is_success());

    let err = composite
        .send(command)
        .await
        .expect_err("second delivery must trip the slip invariant");
    assert!(err.to_string().contains("routing slip"));
}
