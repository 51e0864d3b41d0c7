//! End-to-end runs through the in-process runtime and client.
use durable_replay::history::{Event, EventKind, ExecutionOutcome};
use durable_replay::providers::in_memory::InMemoryHistoryStore;
use durable_replay::providers::{HistoryStore, ProviderError};
use durable_replay::runtime::{ActivityRegistry, Runtime};
use durable_replay::{
    BackoffStrategy, Client, Compensation, DurableOutput, InstanceStatus, OrchestrationContext, OrchestrationError,
    OrchestrationRegistry, RetryPolicy, RuntimeOptions, Saga, SagaStatus,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

mod common;

#[tokio::test]
async fn fan_out_fan_in_doubles_in_input_order() {
    let activities = ActivityRegistry::builder()
        .register("Double", |input: String| async move {
            let n: i64 = input.parse().map_err(|e: std::num::ParseIntError| e.to_string())?;
            // later items finish first
            tokio::time::sleep(Duration::from_millis((4 - n as u64) * 15)).await;
            Ok((n * 2).to_string())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("FanOut", |ctx: OrchestrationContext, input: String| async move {
            let items: Vec<i64> = serde_json::from_str(&input).map_err(|e| e.to_string())?;
            let futs = items
                .iter()
                .map(|n| ctx.schedule_activity_typed("Double", n))
                .collect();
            let doubled = ctx
                .call_all_typed::<i64>(futs)
                .await
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            serde_json::to_string(&doubled).map_err(|e| e.to_string())
        })
        .build();

    let rt = Runtime::start(Arc::new(activities), orchestrations).await;
    let client = Client::new(rt.clone());
    let instance = client.schedule_new_orchestration("FanOut", "[1,2,3]").await.unwrap();
    let status = client.wait_for_completion(&instance, common::WAIT).await.unwrap();
    assert_eq!(status.status, InstanceStatus::Completed);
    assert_eq!(status.output.as_deref(), Some("[2,4,6]"));

    let history = client.get_history(&instance).await.unwrap();
    let scheduled = history
        .iter()
        .filter(|e| matches!(e.kind, EventKind::TaskScheduled { .. }))
        .count();
    assert_eq!(scheduled, 3);
    rt.shutdown().await;
}

fn doubling_activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("Double", |input: String| async move {
            let n: i64 = input.parse().map_err(|e: std::num::ParseIntError| e.to_string())?;
            Ok((n * 2).to_string())
        })
        .build()
}

#[tokio::test]
async fn sequential_activities_double_in_order() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Sequential", |ctx: OrchestrationContext, _input: String| async move {
            let a = ctx.schedule_activity("Double", "1").into_activity().await?;
            let b = ctx.schedule_activity("Double", "2").into_activity().await?;
            let c = ctx.schedule_activity("Double", "3").into_activity().await?;
            Ok(format!("[{a},{b},{c}]"))
        })
        .build();
    let rt = Runtime::start(Arc::new(doubling_activities()), orchestrations).await;
    rt.start_orchestration("seq-1", "Sequential", "").await.unwrap();
    let status = rt.wait_for_completion("seq-1", common::WAIT).await.unwrap();
    assert_eq!(status.status, InstanceStatus::Completed);
    assert_eq!(status.output.as_deref(), Some("[2,4,6]"));

    let history = rt.get_history("seq-1").await.unwrap();
    assert_eq!(
        common::kind_names(&history),
        vec![
            "OrchestratorStarted",
            "TaskScheduled",
            "TaskCompleted",
            "TaskScheduled",
            "TaskCompleted",
            "TaskScheduled",
            "TaskCompleted",
            "OrchestratorCompleted"
        ]
    );
    rt.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn eternal_orchestration_continues_as_new() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Eternal", |ctx: OrchestrationContext, input: String| async move {
            let iteration: u32 = input.parse().unwrap_or(0);
            ctx.schedule_timer(Duration::from_secs(10)).into_timer().await;
            if iteration < 2 {
                ctx.continue_as_new((iteration + 1).to_string());
                return Ok(String::new());
            }
            Ok(format!("done:{iteration}"))
        })
        .build();
    let rt = Runtime::start(Arc::new(ActivityRegistry::builder().build()), orchestrations).await;
    let client = Client::new(rt.clone());
    client.start_orchestration("eternal-1", "Eternal", "0").await.unwrap();

    let status = client
        .wait_for_completion("eternal-1", Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(status.status, InstanceStatus::Completed);
    assert_eq!(status.output.as_deref(), Some("done:2"));
    assert_eq!(status.execution_id, 3);
    assert_eq!(client.list_executions("eternal-1").await, vec![1, 2, 3]);

    let first = rt.get_execution_history("eternal-1", 1).await.unwrap();
    assert_eq!(
        common::kind_names(&first),
        vec!["OrchestratorStarted", "TimerCreated", "TimerFired", "ContinuedAsNew"]
    );
    let second = rt.get_execution_history("eternal-1", 2).await.unwrap();
    assert!(matches!(
        &second[0].kind,
        EventKind::OrchestratorStarted { input, .. } if input == "1"
    ));
    // the new execution starts from a single event; nothing carries over
    assert_eq!(
        common::kind_names(&second),
        vec!["OrchestratorStarted", "TimerCreated", "TimerFired", "ContinuedAsNew"]
    );
    let opened = second
        .iter()
        .filter(|e| matches!(e.kind, EventKind::OrchestratorStarted { .. }))
        .count();
    assert_eq!(opened, 1);
    assert_eq!(second[1].event_id, 2);
    assert!(second.iter().all(|e| e.event_id <= 4));
    let old = rt.get_execution_status("eternal-1", 1).await.unwrap();
    assert_eq!(old.status, InstanceStatus::ContinuedAsNew);
    rt.shutdown().await;
}

fn order_activities(charge_fails: bool, release_fails: bool) -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("ValidateOrder", |order: String| async move { Ok(format!("valid:{order}")) })
        .register("ReserveInventory", |_order: String| async move { Ok("reservation-7".to_string()) })
        .register("ChargePayment", move |_order: String| async move {
            if charge_fails {
                Err("card declined".to_string())
            } else {
                Ok("payment-3".to_string())
            }
        })
        .register("ShipOrder", |_order: String| async move { Ok("shipped".to_string()) })
        .register("ReleaseReservation", move |reservation: String| async move {
            if release_fails {
                Err(format!("cannot release {reservation}"))
            } else {
                Ok(format!("released {reservation}"))
            }
        })
        .register("RefundPayment", |payment: String| async move { Ok(format!("refunded {payment}")) })
        .build()
}

fn order_saga() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("PlaceOrder", |ctx: OrchestrationContext, order: String| async move {
            let mut saga = Saga::new(&ctx);
            saga.step("validate", "ValidateOrder", order.clone(), None).await?;
            saga.step(
                "reserve",
                "ReserveInventory",
                order.clone(),
                Some(Compensation::new("ReleaseReservation")),
            )
            .await?;
            saga.step("charge", "ChargePayment", order.clone(), Some(Compensation::new("RefundPayment")))
                .await?;
            saga.step("ship", "ShipOrder", order, None).await?;
            Ok(saga.complete().status.to_string())
        })
        .build()
}

#[tokio::test]
async fn saga_compensates_completed_steps_when_charge_fails() {
    let rt = Runtime::start(Arc::new(order_activities(true, false)), order_saga()).await;
    rt.start_orchestration("order-1", "PlaceOrder", "o-1").await.unwrap();
    let status = rt.wait_for_completion("order-1", common::WAIT).await.unwrap();

    assert_eq!(status.status, InstanceStatus::Compensated);
    let report = status.compensation.expect("compensation report");
    assert_eq!(report.status, SagaStatus::Compensated);
    assert_eq!(report.failed_step.as_deref(), Some("charge"));
    assert_eq!(report.order(), vec!["reserve"]);
    assert_eq!(report.compensations[0].activity, "ReleaseReservation");
    assert_eq!(report.compensations[0].outcome, Ok("released reservation-7".to_string()));

    // ShipOrder never ran
    let history = rt.get_history("order-1").await.unwrap();
    assert!(!history.iter().any(|e| matches!(
        &e.kind,
        EventKind::TaskScheduled { name, .. } if name == "ShipOrder"
    )));
    rt.shutdown().await;
}

#[tokio::test]
async fn saga_reports_failed_compensation() {
    let rt = Runtime::start(Arc::new(order_activities(true, true)), order_saga()).await;
    rt.start_orchestration("order-2", "PlaceOrder", "o-2").await.unwrap();
    let status = rt.wait_for_completion("order-2", common::WAIT).await.unwrap();

    assert_eq!(status.status, InstanceStatus::CompensationFailed);
    assert!(matches!(status.error, Some(OrchestrationError::CompensationFailure { .. })));
    let report = status.compensation.unwrap();
    assert_eq!(report.failures().count(), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn saga_happy_path_completes() {
    let rt = Runtime::start(Arc::new(order_activities(false, false)), order_saga()).await;
    rt.start_orchestration("order-3", "PlaceOrder", "o-3").await.unwrap();
    let status = rt.wait_for_completion("order-3", common::WAIT).await.unwrap();
    assert_eq!(status.status, InstanceStatus::Completed);
    assert_eq!(status.output.as_deref(), Some("Completed"));
    assert!(status.compensation.is_none());
    rt.shutdown().await;
}

#[tokio::test]
async fn activity_retries_are_invisible_in_history() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let activities = ActivityRegistry::builder()
        .register("Flaky", move |_input: String| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(format!("attempt {n} failed")) } else { Ok(format!("ok after {n}")) }
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("UsesFlaky", |ctx: OrchestrationContext, _input: String| async move {
            let policy = RetryPolicy::new(3).with_backoff(BackoffStrategy::Fixed {
                delay: Duration::from_millis(10),
            });
            ctx.schedule_activity_with_retry("Flaky", "", policy).into_activity().await
        })
        .build();

    let rt = Runtime::start(Arc::new(activities), orchestrations).await;
    rt.start_orchestration("flaky-1", "UsesFlaky", "").await.unwrap();
    let status = rt.wait_for_completion("flaky-1", common::WAIT).await.unwrap();
    assert_eq!(status.output.as_deref(), Some("ok after 3"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let history = rt.get_history("flaky-1").await.unwrap();
    assert_eq!(
        common::kind_names(&history),
        vec!["OrchestratorStarted", "TaskScheduled", "TaskCompleted", "OrchestratorCompleted"]
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_record_one_failure() {
    let activities = ActivityRegistry::builder()
        .register("AlwaysFails", |_input: String| async move { Err::<String, _>("nope".to_string()) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Fails", |ctx: OrchestrationContext, _input: String| async move {
            let policy = RetryPolicy::new(2).with_backoff(BackoffStrategy::None);
            ctx.schedule_activity_with_retry("AlwaysFails", "", policy)
                .into_activity()
                .await
        })
        .build();

    let rt = Runtime::start(Arc::new(activities), orchestrations).await;
    rt.start_orchestration("fails-1", "Fails", "").await.unwrap();
    let status = rt.wait_for_completion("fails-1", common::WAIT).await.unwrap();
    assert_eq!(status.status, InstanceStatus::Failed);
    assert_eq!(status.error.map(|e| e.message()), Some("nope".to_string()));

    let history = rt.get_history("fails-1").await.unwrap();
    assert!(
        history
            .iter()
            .any(|e| matches!(e.kind, EventKind::TaskFailed { attempts: 2, .. }))
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn unregistered_activity_fails_the_call() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("CallsMissing", |ctx: OrchestrationContext, _input: String| async move {
            match ctx.schedule_activity("Missing", "").into_activity().await {
                Ok(_) => Ok("unexpected".to_string()),
                Err(e) => Ok(e),
            }
        })
        .build();
    let rt = Runtime::start(Arc::new(ActivityRegistry::builder().build()), orchestrations).await;
    rt.start_orchestration("missing-1", "CallsMissing", "").await.unwrap();
    let out = rt
        .wait_for_completion_typed::<String>("missing-1", common::WAIT)
        .await
        .unwrap();
    assert_eq!(out, Ok("unregistered activity: Missing".to_string()));
    rt.shutdown().await;
}

#[tokio::test]
async fn approval_beats_timeout_and_custom_status_is_visible() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Approval", |ctx: OrchestrationContext, _input: String| async move {
            ctx.set_custom_status("waiting for approval");
            let timeout = ctx.schedule_timer(Duration::from_secs(60));
            let approval = ctx.schedule_wait("Approve");
            match ctx.select2(timeout, approval).await {
                (1, DurableOutput::External(by)) => Ok(format!("approved by {by}")),
                _ => Ok("timed out".to_string()),
            }
        })
        .build();
    let rt = Runtime::start(Arc::new(ActivityRegistry::builder().build()), orchestrations).await;
    let client = Client::new(rt.clone());
    client.start_orchestration("approval-1", "Approval", "").await.unwrap();

    assert!(
        common::wait_for_history(rt.store(), "approval-1", |h| common::has_subscription(h, "Approve"), 5_000).await
    );
    let running = client.get_status("approval-1").await.unwrap();
    assert_eq!(running.status, InstanceStatus::Running);
    assert_eq!(running.custom_status.as_deref(), Some("waiting for approval"));

    client.raise_event("approval-1", "Approve", "alice").await.unwrap();
    let done = client.wait_for_completion("approval-1", common::WAIT).await.unwrap();
    assert_eq!(done.output.as_deref(), Some("approved by alice"));
    rt.shutdown().await;
}

#[tokio::test]
async fn terminate_closes_a_waiting_instance() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Waits", |ctx: OrchestrationContext, _input: String| async move {
            Ok(ctx.schedule_wait("Never").into_event().await)
        })
        .build();
    let rt = Runtime::start(Arc::new(ActivityRegistry::builder().build()), orchestrations).await;
    let client = Client::new(rt.clone());
    client.start_orchestration("term-1", "Waits", "").await.unwrap();
    assert!(common::wait_for_history(rt.store(), "term-1", |h| common::has_subscription(h, "Never"), 5_000).await);

    client.terminate_instance("term-1", "operator request").await.unwrap();
    let status = client.wait_for_completion("term-1", common::WAIT).await.unwrap();
    assert_eq!(status.status, InstanceStatus::Terminated);

    // events for a closed instance are dropped
    let before = client.get_history("term-1").await.unwrap();
    client.raise_event("term-1", "Never", "late").await.unwrap();
    let after = client.get_history("term-1").await.unwrap();
    assert_eq!(before, after);
    assert!(matches!(
        &after.last().unwrap().kind,
        EventKind::OrchestratorCompleted {
            outcome: ExecutionOutcome::Terminated { reason }
        } if reason == "operator request"
    ));
    rt.shutdown().await;
}

#[tokio::test]
async fn sub_orchestrations_report_results_and_failures() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Child", |_ctx: OrchestrationContext, input: String| async move {
            Ok(input.to_uppercase())
        })
        .register("Parent", |ctx: OrchestrationContext, input: String| async move {
            let outs = ctx
                .join(vec![
                    ctx.schedule_sub_orchestration("Child", input),
                    ctx.schedule_sub_orchestration("NotRegistered", ""),
                ])
                .await;
            match (&outs[0], &outs[1]) {
                (DurableOutput::SubOrchestration(Ok(v)), DurableOutput::SubOrchestration(Err(e))) => {
                    Ok(format!("{v}|{e}"))
                }
                other => Err(format!("unexpected {other:?}")),
            }
        })
        .build();
    let rt = Runtime::start(Arc::new(ActivityRegistry::builder().build()), orchestrations).await;
    rt.start_orchestration("parent-1", "Parent", "hello").await.unwrap();
    let status = rt.wait_for_completion("parent-1", common::WAIT).await.unwrap();
    assert_eq!(
        status.output.as_deref(),
        Some("HELLO|unregistered orchestration: NotRegistered")
    );

    let child = rt.get_status("parent-1::1::sub::2").await.unwrap();
    assert_eq!(child.status, InstanceStatus::Completed);
    assert_eq!(child.parent_instance.as_deref(), Some("parent-1"));
    rt.shutdown().await;
}

#[tokio::test]
async fn eternal_parent_starts_a_fresh_child_each_execution() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Child", |_ctx: OrchestrationContext, input: String| async move {
            Ok(format!("child:{input}"))
        })
        .register("Loop", |ctx: OrchestrationContext, input: String| async move {
            let (iteration, acc) = input.split_once('|').unwrap_or(("0", ""));
            let iteration: u32 = iteration.parse().map_err(|e: std::num::ParseIntError| e.to_string())?;
            let out = ctx
                .schedule_sub_orchestration("Child", iteration.to_string())
                .into_sub_orchestration()
                .await?;
            let acc = format!("{acc},{out}");
            if iteration < 2 {
                ctx.continue_as_new(format!("{}|{acc}", iteration + 1));
                return Ok(String::new());
            }
            Ok(acc)
        })
        .build();
    let rt = Runtime::start(Arc::new(ActivityRegistry::builder().build()), orchestrations).await;
    rt.start_orchestration("loop-1", "Loop", "0|").await.unwrap();
    let status = rt.wait_for_completion("loop-1", common::WAIT).await.unwrap();
    assert_eq!(status.status, InstanceStatus::Completed);
    assert_eq!(status.output.as_deref(), Some(",child:0,child:1,child:2"));
    assert_eq!(status.execution_id, 3);

    for exec in 1..=3u64 {
        let child = rt.get_status(&format!("loop-1::{exec}::sub::2")).await.unwrap();
        assert_eq!(child.status, InstanceStatus::Completed);
        assert_eq!(child.input, (exec - 1).to_string());
    }
    rt.shutdown().await;
}

#[tokio::test]
async fn starts_are_deduplicated_and_versions_resolved() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Versioned", |_ctx: OrchestrationContext, input: String| async move {
            Ok(format!("v1:{input}"))
        })
        .register_versioned("Versioned", "2.0.0", |ctx: OrchestrationContext, input: String| async move {
            Ok(format!("v{}:{input}", ctx.version()))
        })
        .build();
    let rt = Runtime::start(Arc::new(ActivityRegistry::builder().build()), orchestrations).await;

    rt.start_orchestration("ver-latest", "Versioned", "a").await.unwrap();
    rt.start_orchestration("ver-latest", "Versioned", "ignored").await.unwrap();
    let latest = rt.wait_for_completion("ver-latest", common::WAIT).await.unwrap();
    assert_eq!(latest.output.as_deref(), Some("v2.0.0:a"));
    assert_eq!(rt.list_executions("ver-latest").await, vec![1]);

    rt.start_orchestration_versioned("ver-pinned", "Versioned", "1.0.0", "b")
        .await
        .unwrap();
    let pinned = rt.wait_for_completion("ver-pinned", common::WAIT).await.unwrap();
    assert_eq!(pinned.output.as_deref(), Some("v1:b"));
    assert_eq!(pinned.version, "1.0.0");

    let err = rt
        .start_orchestration_versioned("ver-missing", "Versioned", "3.0.0", "c")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::UnregisteredOrchestration { .. }));
    let err = rt.start_orchestration("nope-1", "Nope", "").await.unwrap_err();
    assert!(matches!(err, OrchestrationError::UnregisteredOrchestration { .. }));
    rt.shutdown().await;
}

#[tokio::test]
async fn wait_times_out_for_a_blocked_instance() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Blocked", |ctx: OrchestrationContext, _input: String| async move {
            Ok(ctx.schedule_wait("Nothing").into_event().await)
        })
        .build();
    let rt = Runtime::start(Arc::new(ActivityRegistry::builder().build()), orchestrations).await;
    rt.start_orchestration("blocked-1", "Blocked", "").await.unwrap();
    let err = rt
        .wait_for_completion("blocked-1", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(err, durable_replay::WaitError::Timeout);
    rt.shutdown().await;
}

fn step_chain() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("Chain", |ctx: OrchestrationContext, _input: String| async move {
            let mut last = String::new();
            for n in 1..=10 {
                last = ctx.schedule_activity("Double", n.to_string()).into_activity().await?;
            }
            Ok(last)
        })
        .build()
}

#[tokio::test]
async fn history_cap_fails_the_instance() {
    let store = Arc::new(InMemoryHistoryStore::with_cap(6)) as Arc<dyn HistoryStore>;
    let rt = Runtime::start_with_options(
        store.clone(),
        Arc::new(doubling_activities()),
        step_chain(),
        RuntimeOptions::default(),
    )
    .await;
    rt.start_orchestration("capped-1", "Chain", "").await.unwrap();
    let status = rt.wait_for_completion("capped-1", common::WAIT).await.unwrap();
    assert_eq!(status.status, InstanceStatus::Failed);
    assert!(matches!(status.error, Some(OrchestrationError::Storage { .. })));

    let history = store.read("capped-1").await.unwrap();
    assert!(matches!(
        history.last().map(|e| &e.kind),
        Some(EventKind::OrchestratorCompleted {
            outcome: ExecutionOutcome::Failed { .. }
        })
    ));
    durable_replay::history::validate(&history).unwrap();
    rt.shutdown().await;
}

/// Accepts instance creation but refuses every append.
struct ReadOnlyStore(InMemoryHistoryStore);

#[async_trait::async_trait]
impl HistoryStore for ReadOnlyStore {
    async fn create_instance(&self, instance: &str, started: Event) -> Result<(), ProviderError> {
        self.0.create_instance(instance, started).await
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        self.0.read(instance).await
    }

    async fn read_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError> {
        self.0.read_execution(instance, execution_id).await
    }

    async fn append(&self, _instance: &str, _execution_id: u64, _events: Vec<Event>) -> Result<(), ProviderError> {
        Err(ProviderError::permanent("append", "disk full"))
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        self.0.latest_execution_id(instance).await
    }

    async fn list_executions(&self, instance: &str) -> Vec<u64> {
        self.0.list_executions(instance).await
    }

    async fn continue_as_new(
        &self,
        _instance: &str,
        _execution_id: u64,
        _closing: Event,
        _started: Event,
    ) -> Result<u64, ProviderError> {
        Err(ProviderError::permanent("continue_as_new", "disk full"))
    }

    async fn list_instances(&self) -> Vec<String> {
        self.0.list_instances().await
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        self.0.remove_instance(instance).await
    }

    async fn set_custom_status(&self, instance: &str, status: Option<String>) -> Result<(), ProviderError> {
        self.0.set_custom_status(instance, status).await
    }

    async fn custom_status(&self, instance: &str) -> Option<String> {
        self.0.custom_status(instance).await
    }
}

#[tokio::test]
async fn unwritable_store_still_reports_the_failure() {
    let store = Arc::new(ReadOnlyStore(InMemoryHistoryStore::default())) as Arc<dyn HistoryStore>;
    let rt = Runtime::start_with_options(
        store.clone(),
        Arc::new(doubling_activities()),
        step_chain(),
        RuntimeOptions::default(),
    )
    .await;
    rt.start_orchestration("stuck-1", "Chain", "").await.unwrap();
    let status = rt.wait_for_completion("stuck-1", common::WAIT).await.unwrap();
    assert_eq!(status.status, InstanceStatus::Failed);
    assert!(matches!(
        status.error,
        Some(OrchestrationError::Storage { ref message, .. }) if message == "disk full"
    ));
    assert_eq!(common::kind_names(&store.read("stuck-1").await.unwrap()), vec!["OrchestratorStarted"]);
    rt.shutdown().await;
}
