#![allow(dead_code)]

use durable_replay::history::{self, Event, EventKind};
use durable_replay::providers::HistoryStore;
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(10);

/// Execution history holding only `OrchestratorStarted` at logical time 1000.
pub fn started(name: &str, input: &str) -> Vec<Event> {
    let mut h = Vec::new();
    history::append(
        &mut h,
        1_000,
        EventKind::OrchestratorStarted {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            input: input.to_string(),
            parent: None,
        },
    );
    h
}

pub fn complete_task(history: &mut Vec<Event>, source_event_id: u64, result: &str) -> u64 {
    history::append(
        history,
        2_000,
        EventKind::TaskCompleted {
            source_event_id,
            result: result.to_string(),
        },
    )
}

pub fn kind_names(history: &[Event]) -> Vec<&'static str> {
    history.iter().map(Event::kind_name).collect()
}

/// Poll the latest execution's history until `pred` holds or `timeout_ms` passes.
pub async fn wait_for_history<F>(store: Arc<dyn HistoryStore>, instance: &str, pred: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(h) = store.read(instance).await
            && pred(&h)
        {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn has_subscription(history: &[Event], name: &str) -> bool {
    history
        .iter()
        .any(|e| matches!(&e.kind, EventKind::ExternalSubscribed { name: n } if n == name))
}
