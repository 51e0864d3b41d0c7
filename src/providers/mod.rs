use std::collections::HashSet;

use crate::history::{self, Event, EventKind};

pub mod error;
pub mod fs;
pub mod in_memory;

pub use error::{ProviderError, ProviderErrorKind};

/// Default per-execution history cap.
pub const DEFAULT_HISTORY_CAP: usize = 1024;

/// Durable storage for instance histories.
///
/// An instance owns one or more executions (generations separated by
/// continue-as-new). Appends are all-or-nothing and must satisfy
/// [`validate_append`].
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create the instance with execution 1 holding `started`.
    /// Returns `Conflict` if the instance already exists.
    async fn create_instance(&self, instance: &str, started: Event) -> Result<(), ProviderError>;

    /// Full history of the latest execution; empty if the instance is unknown.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    async fn read_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError>;

    async fn append(&self, instance: &str, execution_id: u64, events: Vec<Event>) -> Result<(), ProviderError>;

    async fn latest_execution_id(&self, instance: &str) -> Option<u64>;

    async fn list_executions(&self, instance: &str) -> Vec<u64>;

    /// Atomically close `execution_id` with `closing` and open the next execution
    /// holding only `started`. Returns the new execution id.
    async fn continue_as_new(
        &self,
        instance: &str,
        execution_id: u64,
        closing: Event,
        started: Event,
    ) -> Result<u64, ProviderError>;

    async fn list_instances(&self) -> Vec<String>;

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError>;

    async fn set_custom_status(&self, instance: &str, status: Option<String>) -> Result<(), ProviderError>;

    async fn custom_status(&self, instance: &str) -> Option<String>;

    /// Human-readable dump of every execution, for debugging.
    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for inst in self.list_instances().await {
            out.push_str(&format!("instance={inst}\n"));
            for exec in self.list_executions(&inst).await {
                for ev in self.read_execution(&inst, exec).await.unwrap_or_default() {
                    out.push_str(&format!("  exec#{exec} {ev:?}\n"));
                }
            }
        }
        out
    }
}

/// Append rules shared by every store.
///
/// - the execution exists and is not closed
/// - ids continue the sequence without gaps; a reused id is a `Conflict`
/// - at most one completion per scheduling event; a second one is a `Conflict`
/// - a terminal event may only be the last of the batch
/// - the execution stays within `cap` events, not counting its terminal event
pub fn validate_append(existing: &[Event], new_events: &[Event], cap: usize) -> Result<(), ProviderError> {
    const OP: &str = "append";
    if existing.is_empty() {
        return Err(ProviderError::permanent(OP, "execution not found"));
    }
    if existing.last().is_some_and(Event::is_terminal) {
        return Err(ProviderError::permanent(OP, "execution is closed"));
    }
    // a terminal event always fits so a capped execution can still be closed
    let growth = new_events.iter().filter(|e| !e.is_terminal()).count();
    if existing.len() + growth > cap {
        return Err(ProviderError::permanent(
            OP,
            format!(
                "history cap exceeded (cap={cap}, have={}, append={})",
                existing.len(),
                growth
            ),
        ));
    }

    let mut completed: HashSet<u64> = existing.iter().filter_map(Event::source_event_id).collect();
    let mut expected = history::next_event_id(existing);
    for (i, ev) in new_events.iter().enumerate() {
        if ev.event_id < expected {
            return Err(ProviderError::conflict(OP, format!("event_id {} already used", ev.event_id)));
        }
        if ev.event_id > expected {
            return Err(ProviderError::permanent(
                OP,
                format!("event_id {} leaves a gap (expected {expected})", ev.event_id),
            ));
        }
        if let Some(source) = ev.source_event_id()
            && !completed.insert(source)
        {
            return Err(ProviderError::conflict(
                OP,
                format!("completion for event {source} already recorded"),
            ));
        }
        if matches!(ev.kind, EventKind::OrchestratorStarted { .. }) {
            return Err(ProviderError::permanent(OP, "OrchestratorStarted may only open an execution"));
        }
        if ev.is_terminal() && i + 1 != new_events.len() {
            return Err(ProviderError::permanent(OP, "terminal event must be last"));
        }
        expected += 1;
    }
    Ok(())
}

/// Checks for the first event of a new execution.
pub(crate) fn validate_started(started: &Event) -> Result<(), ProviderError> {
    if started.event_id != 1 || !matches!(started.kind, EventKind::OrchestratorStarted { .. }) {
        return Err(ProviderError::permanent(
            "create_instance",
            "an execution must open with OrchestratorStarted as event 1",
        ));
    }
    Ok(())
}

/// Checks for the event that closes an execution on continue-as-new.
pub(crate) fn validate_closing(existing: &[Event], closing: &Event, cap: usize) -> Result<(), ProviderError> {
    if !matches!(closing.kind, EventKind::ContinuedAsNew { .. }) {
        return Err(ProviderError::permanent("continue_as_new", "closing event must be ContinuedAsNew"));
    }
    validate_append(existing, std::slice::from_ref(closing), cap)
}
