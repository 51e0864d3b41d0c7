//! Activity and sub-orchestration dispatch.
//!
//! Each scheduled activity runs on its own task: attempts are bounded by the
//! runtime's concurrency semaphore, failed attempts are retried per the recorded
//! policy, and only the final result is appended to history.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Runtime, now_ms};
use crate::history::{EventKind, ParentLink};
use crate::retry::RetryPolicy;
use crate::OrchestrationError;

pub(crate) fn spawn_activity(
    rt: &Arc<Runtime>,
    instance: String,
    execution_id: u64,
    event_id: u64,
    name: String,
    input: String,
    retry: Option<RetryPolicy>,
) {
    let runtime = rt.clone();
    rt.spawn_tracked(async move {
        let kind = execute_activity(&runtime, &instance, event_id, &name, input, retry).await;
        if let Err(e) = runtime.deliver(&instance, Some(execution_id), kind, now_ms()).await {
            warn!(instance = %instance, event_id, activity = %name, error = %e, "failed to record activity result");
        }
    });
}

/// Run attempts until one succeeds or the policy is exhausted; returns the
/// completion event to record.
async fn execute_activity(
    rt: &Runtime,
    instance: &str,
    event_id: u64,
    name: &str,
    input: String,
    retry: Option<RetryPolicy>,
) -> EventKind {
    let Some(handler) = rt.activities.get(name) else {
        warn!(instance, event_id, activity = name, "activity not registered");
        return EventKind::TaskFailed {
            source_event_id: event_id,
            error: format!("unregistered activity: {name}"),
            attempts: 0,
        };
    };
    let policy = retry
        .or_else(|| rt.options.default_retry_policy.clone())
        .unwrap_or_else(RetryPolicy::once);

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let result = {
            let _permit = match rt.activity_slots.acquire().await {
                Ok(p) => p,
                Err(_) => {
                    return EventKind::TaskFailed {
                        source_event_id: event_id,
                        error: "activity slots closed".to_string(),
                        attempts: attempt - 1,
                    };
                }
            };
            let call = AssertUnwindSafe(handler.invoke(input.clone())).catch_unwind();
            let outcome = match policy.timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(r) => r,
                    Err(_) => Ok(Err(format!("attempt timed out after {}ms", limit.as_millis()))),
                },
                None => call.await,
            };
            outcome.unwrap_or_else(|_| Err("activity panicked".to_string()))
        };

        match result {
            Ok(output) => {
                debug!(instance, event_id, activity = name, attempt, "activity completed");
                return EventKind::TaskCompleted {
                    source_event_id: event_id,
                    result: output,
                };
            }
            Err(message) if policy.should_retry(attempt) => {
                let transient = OrchestrationError::TransientActivityFailure {
                    name: name.to_string(),
                    attempt,
                    message,
                };
                let delay = policy.backoff.delay_for_attempt(attempt);
                warn!(
                    instance,
                    event_id,
                    error = %transient,
                    retry_in_ms = delay.as_millis() as u64,
                    "activity attempt failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(message) => {
                info!(instance, event_id, activity = name, attempts = attempt, error = %message, "activity failed");
                return EventKind::TaskFailed {
                    source_event_id: event_id,
                    error: message,
                    attempts: attempt,
                };
            }
        }
    }
}

/// Start the child instance. A child that cannot start is reported to the
/// parent as a failed sub-orchestration.
pub(crate) fn spawn_sub_orchestration(
    rt: &Arc<Runtime>,
    parent: ParentLink,
    name: String,
    version: Option<String>,
    child: String,
    input: String,
) {
    let runtime = rt.clone();
    rt.spawn_tracked(async move {
        match runtime
            .start_internal(&child, &name, version.as_deref(), input, Some(parent.clone()))
            .await
        {
            Ok(()) => runtime.report_if_finished(&child, parent).await,
            Err(e) => {
                warn!(parent = %parent.instance, child = %child, error = %e, "failed to start sub-orchestration");
                let kind = EventKind::SubOrchestrationFailed {
                    source_event_id: parent.source_event_id,
                    error: e.to_string(),
                };
                if let Err(e) = runtime
                    .deliver(&parent.instance, Some(parent.execution_id), kind, now_ms())
                    .await
                {
                    warn!(parent = %parent.instance, error = %e, "failed to record sub-orchestration failure");
                }
            }
        }
    });
}
