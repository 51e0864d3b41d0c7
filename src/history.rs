//! Append-only history model.
//!
//! Every execution of an instance owns one ordered sequence of [`Event`]s. The
//! `event_id` is the sequence number: it starts at 1 and increases by exactly one per
//! appended event. Completion events point back at the scheduling event they resolve
//! through `source_event_id`, so results are matched by sequence number and never by
//! arrival order.

use serde::{Deserialize, Serialize};

use crate::error::OrchestrationError;
use crate::retry::RetryPolicy;
use crate::saga::CompensationReport;

/// Link from a child orchestration back to the parent step that started it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub instance: String,
    pub execution_id: u64,
    pub source_event_id: u64,
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    Completed {
        output: String,
    },
    Failed {
        error: OrchestrationError,
        /// Present when the failure was unwound by a saga.
        compensation: Option<CompensationReport>,
    },
    Terminated {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// First event of every execution.
    OrchestratorStarted {
        name: String,
        version: String,
        input: String,
        parent: Option<ParentLink>,
    },
    TaskScheduled {
        name: String,
        input: String,
        retry: Option<RetryPolicy>,
    },
    TaskCompleted {
        source_event_id: u64,
        result: String,
    },
    TaskFailed {
        source_event_id: u64,
        error: String,
        attempts: u32,
    },
    TimerCreated {
        fire_at_ms: u64,
    },
    TimerFired {
        source_event_id: u64,
        fire_at_ms: u64,
    },
    SubOrchestrationScheduled {
        name: String,
        version: Option<String>,
        instance: String,
        input: String,
    },
    SubOrchestrationCompleted {
        source_event_id: u64,
        result: String,
    },
    SubOrchestrationFailed {
        source_event_id: u64,
        error: String,
    },
    /// The orchestrator started waiting for an external event by name.
    ExternalSubscribed {
        name: String,
    },
    /// An external event was raised. Buffered until a matching subscription claims it.
    ExternalEventReceived {
        name: String,
        data: String,
    },
    /// Terminal for this execution; the next execution starts with the given input.
    ContinuedAsNew {
        input: String,
    },
    OrchestratorCompleted {
        outcome: ExecutionOutcome,
    },
}

/// One immutable history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: u64,
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

impl Event {
    pub fn new(event_id: u64, timestamp_ms: u64, kind: EventKind) -> Self {
        Self {
            event_id,
            timestamp_ms,
            kind,
        }
    }

    /// Events produced by orchestrator code that later receive a completion.
    pub fn is_scheduling(&self) -> bool {
        matches!(
            self.kind,
            EventKind::TaskScheduled { .. }
                | EventKind::TimerCreated { .. }
                | EventKind::SubOrchestrationScheduled { .. }
                | EventKind::ExternalSubscribed { .. }
        )
    }

    /// The scheduling event this completion resolves, if it is a correlated completion.
    pub fn source_event_id(&self) -> Option<u64> {
        match &self.kind {
            EventKind::TaskCompleted { source_event_id, .. }
            | EventKind::TaskFailed { source_event_id, .. }
            | EventKind::TimerFired { source_event_id, .. }
            | EventKind::SubOrchestrationCompleted { source_event_id, .. }
            | EventKind::SubOrchestrationFailed { source_event_id, .. } => Some(*source_event_id),
            _ => None,
        }
    }

    /// Ends the execution: nothing may be appended after it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::ContinuedAsNew { .. } | EventKind::OrchestratorCompleted { .. }
        )
    }

    /// Short kind label used in logs and nondeterminism messages.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EventKind::OrchestratorStarted { .. } => "OrchestratorStarted",
            EventKind::TaskScheduled { .. } => "TaskScheduled",
            EventKind::TaskCompleted { .. } => "TaskCompleted",
            EventKind::TaskFailed { .. } => "TaskFailed",
            EventKind::TimerCreated { .. } => "TimerCreated",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::SubOrchestrationScheduled { .. } => "SubOrchestrationScheduled",
            EventKind::SubOrchestrationCompleted { .. } => "SubOrchestrationCompleted",
            EventKind::SubOrchestrationFailed { .. } => "SubOrchestrationFailed",
            EventKind::ExternalSubscribed { .. } => "ExternalSubscribed",
            EventKind::ExternalEventReceived { .. } => "ExternalEventReceived",
            EventKind::ContinuedAsNew { .. } => "ContinuedAsNew",
            EventKind::OrchestratorCompleted { .. } => "OrchestratorCompleted",
        }
    }
}

/// Sequence number the next appended event must carry.
pub fn next_event_id(history: &[Event]) -> u64 {
    history.last().map(|e| e.event_id + 1).unwrap_or(1)
}

/// Append `kind` with the next sequence number and return that number.
pub fn append(history: &mut Vec<Event>, timestamp_ms: u64, kind: EventKind) -> u64 {
    let id = next_event_id(history);
    history.push(Event::new(id, timestamp_ms, kind));
    id
}

/// The `OrchestratorStarted` record of this execution.
pub fn started(history: &[Event]) -> Option<(&str, &str, &str, Option<&ParentLink>)> {
    history.first().and_then(|e| match &e.kind {
        EventKind::OrchestratorStarted {
            name,
            version,
            input,
            parent,
        } => Some((name.as_str(), version.as_str(), input.as_str(), parent.as_ref())),
        _ => None,
    })
}

/// Check the ordering invariants of a full execution history.
pub fn validate(history: &[Event]) -> Result<(), String> {
    match history.first() {
        None => return Ok(()),
        Some(e) if !matches!(e.kind, EventKind::OrchestratorStarted { .. }) => {
            return Err(format!("history must start with OrchestratorStarted, found {}", e.kind_name()));
        }
        _ => {}
    }
    for (expected, e) in (1u64..).zip(history.iter()) {
        if e.event_id != expected {
            return Err(format!("event_id {} at position {} (expected {expected})", e.event_id, expected - 1));
        }
    }
    if let Some(pos) = history.iter().position(Event::is_terminal)
        && pos + 1 != history.len()
    {
        return Err(format!("{} events after terminal event", history.len() - pos - 1));
    }
    Ok(())
}
