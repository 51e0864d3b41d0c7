use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::logging::LogLevel;
use crate::runtime::OrchestrationHandler;
use crate::saga::{CompensationReport, SagaStatus};
use crate::{Action, Event, OrchestrationContext, OrchestrationError, TurnInfo};

/// How a replay pass ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnDecision {
    /// Waiting on outstanding work.
    Suspended,
    Completed {
        output: String,
    },
    Failed {
        error: OrchestrationError,
        compensation: Option<CompensationReport>,
    },
    ContinueAsNew {
        input: String,
        version: Option<String>,
    },
    /// Code and history disagree; the pass must not be persisted.
    NonDeterministic {
        message: String,
    },
}

#[derive(Debug)]
pub struct TurnResult {
    /// Scheduling events appended by this pass.
    pub new_events: Vec<Event>,
    /// Work to dispatch for `new_events`.
    pub actions: Vec<Action>,
    pub logs: Vec<(LogLevel, String)>,
    pub custom_status: Option<String>,
    pub decision: TurnDecision,
}

pub trait ReplayEngine: Send + Sync {
    /// Run one pass of `handler` over `history`.
    fn replay(
        &self,
        info: TurnInfo,
        history: Vec<Event>,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> TurnResult;
}

#[derive(Default)]
pub struct DefaultReplayEngine;

impl DefaultReplayEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ReplayEngine for DefaultReplayEngine {
    fn replay(
        &self,
        info: TurnInfo,
        history: Vec<Event>,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> TurnResult {
        let orchestrator = |ctx: OrchestrationContext| {
            let h = handler.clone();
            let inp = input.clone();
            async move { h.invoke(ctx, inp).await }
        };
        let turn = match catch_unwind(AssertUnwindSafe(|| crate::run_turn_with(info, history, orchestrator))) {
            Ok(turn) => turn,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                return TurnResult {
                    new_events: Vec::new(),
                    actions: Vec::new(),
                    logs: Vec::new(),
                    custom_status: None,
                    decision: TurnDecision::Failed {
                        error: OrchestrationError::application(format!("orchestrator panicked: {message}")),
                        compensation: None,
                    },
                };
            }
        };

        let decision = if let Some(message) = turn.nondeterminism.clone() {
            TurnDecision::NonDeterministic { message }
        } else if let Some((input, version)) = turn.continue_as_new() {
            TurnDecision::ContinueAsNew {
                input: input.to_string(),
                version: version.map(str::to_string),
            }
        } else {
            match turn.output.clone() {
                None => TurnDecision::Suspended,
                Some(Ok(output)) => TurnDecision::Completed { output },
                Some(Err(message)) => {
                    let compensation = turn
                        .compensation
                        .clone()
                        .filter(|r| r.status != SagaStatus::Completed);
                    let error = match &compensation {
                        Some(r) if r.status == SagaStatus::CompensationFailed => {
                            OrchestrationError::CompensationFailure { message }
                        }
                        _ => OrchestrationError::application(message),
                    };
                    TurnDecision::Failed { error, compensation }
                }
            }
        };

        TurnResult {
            new_events: turn.new_events,
            actions: turn
                .actions
                .into_iter()
                .filter(|a| !matches!(a, Action::ContinueAsNew { .. }))
                .collect(),
            logs: turn.logs,
            custom_status: turn.custom_status,
            decision,
        }
    }
}
