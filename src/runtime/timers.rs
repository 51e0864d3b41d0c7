use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Runtime, now_ms};
use crate::history::EventKind;

/// Sleep until `fire_at_ms`, then record `TimerFired`. The recorded timestamp is
/// never earlier than the deadline.
pub(crate) fn schedule_timer(rt: &Arc<Runtime>, instance: String, execution_id: u64, event_id: u64, fire_at_ms: u64) {
    let runtime = rt.clone();
    rt.spawn_tracked(async move {
        let delay = fire_at_ms.saturating_sub(now_ms());
        debug!(instance = %instance, event_id, delay_ms = delay, "timer armed");
        tokio::time::sleep(Duration::from_millis(delay)).await;

        let kind = EventKind::TimerFired {
            source_event_id: event_id,
            fire_at_ms,
        };
        let fired_at = now_ms().max(fire_at_ms);
        if let Err(e) = runtime.deliver(&instance, Some(execution_id), kind, fired_at).await {
            warn!(instance = %instance, event_id, error = %e, "failed to record timer");
        }
    });
}
