//! Saga compensation.
//!
//! A [`Saga`] runs forward steps as activities and remembers, for each successful
//! step, the activity that undoes it. When a step fails (or the saga is aborted) the
//! remembered compensations run one at a time in strict reverse order. Every
//! compensation is itself a durable activity call, so an unwind interrupted by a crash
//! resumes from history where it stopped.
//!
//! ```ignore
//! let mut saga = Saga::new(&ctx);
//! saga.step("validate", "ValidateOrder", order.clone(), None).await?;
//! saga.step("reserve", "ReserveInventory", order.clone(), Some(Compensation::new("ReleaseReservation"))).await?;
//! saga.step("charge", "ChargePayment", order.clone(), Some(Compensation::new("RefundPayment"))).await?;
//! saga.step("ship", "ShipOrder", order, None).await?;
//! Ok(saga.complete().status.to_string())
//! ```

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::{OrchestrationContext, durable_info, durable_warn};

/// Final status of a saga run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaStatus {
    /// Every forward step succeeded.
    Completed,
    /// A step failed and every compensation succeeded.
    Compensated,
    /// A step failed and at least one compensation failed too.
    CompensationFailed,
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SagaStatus::Completed => "Completed",
            SagaStatus::Compensated => "Compensated",
            SagaStatus::CompensationFailed => "CompensationFailed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaState {
    Idle,
    /// Running the forward step with this zero-based index.
    Executing { step: usize },
    Compensating,
    Completed,
    Compensated,
    CompensationFailed,
}

impl SagaState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Compensated | SagaState::CompensationFailed
        )
    }
}

/// What to do when a compensation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnwindPolicy {
    /// Log the failure and keep unwinding the remaining steps.
    #[default]
    BestEffort,
    /// Stop at the first failing compensation.
    FailFast,
}

/// Undo action for a forward step.
#[derive(Debug, Clone, PartialEq)]
pub struct Compensation {
    pub activity: String,
    /// Defaults to the forward step's result.
    pub input: Option<String>,
    pub retry: Option<RetryPolicy>,
}

impl Compensation {
    pub fn new(activity: impl Into<String>) -> Self {
        Self {
            activity: activity.into(),
            input: None,
            retry: None,
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// A registered undo, in forward order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationEntry {
    pub step_id: String,
    pub activity: String,
    pub input: String,
    pub retry: Option<RetryPolicy>,
}

/// Stack of compensations for the steps that succeeded so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompensationRecord {
    entries: Vec<CompensationEntry>,
}

impl CompensationRecord {
    pub fn push(&mut self, entry: CompensationEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in forward order.
    pub fn entries(&self) -> &[CompensationEntry] {
        &self.entries
    }

    /// Take every entry, most recent first.
    pub fn drain_reverse(&mut self) -> Vec<CompensationEntry> {
        let mut out = std::mem::take(&mut self.entries);
        out.reverse();
        out
    }
}

/// One executed compensation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationResult {
    pub step_id: String,
    pub activity: String,
    pub outcome: Result<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationReport {
    pub status: SagaStatus,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    /// Compensations in the order they ran.
    pub compensations: Vec<CompensationResult>,
}

impl CompensationReport {
    /// Step ids of the compensations that ran, in execution order.
    pub fn order(&self) -> Vec<&str> {
        self.compensations.iter().map(|c| c.step_id.as_str()).collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &CompensationResult> {
        self.compensations.iter().filter(|c| c.outcome.is_err())
    }
}

/// A failed saga, carrying the unwind report.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaError {
    pub report: CompensationReport,
}

impl std::fmt::Display for SagaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let step = self.report.failed_step.as_deref().unwrap_or("?");
        let error = self.report.error.as_deref().unwrap_or("unknown error");
        write!(f, "saga step '{step}' failed: {error} ({})", self.report.status)
    }
}

impl std::error::Error for SagaError {}

impl From<SagaError> for String {
    fn from(e: SagaError) -> Self {
        e.to_string()
    }
}

pub struct Saga {
    ctx: OrchestrationContext,
    record: CompensationRecord,
    state: SagaState,
    policy: UnwindPolicy,
    steps: usize,
}

impl Saga {
    pub fn new(ctx: &OrchestrationContext) -> Self {
        Self {
            ctx: ctx.clone(),
            record: CompensationRecord::default(),
            state: SagaState::Idle,
            policy: UnwindPolicy::default(),
            steps: 0,
        }
    }

    pub fn with_policy(mut self, policy: UnwindPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> &SagaState {
        &self.state
    }

    pub fn record(&self) -> &CompensationRecord {
        &self.record
    }

    /// Run one forward step. On failure the saga unwinds before returning.
    pub async fn step(
        &mut self,
        step_id: impl Into<String>,
        activity: impl Into<String>,
        input: impl Into<String>,
        compensation: Option<Compensation>,
    ) -> Result<String, SagaError> {
        self.run_step(step_id.into(), activity.into(), input.into(), None, compensation)
            .await
    }

    /// Like `step`, with a retry policy for the forward activity.
    pub async fn step_with_retry(
        &mut self,
        step_id: impl Into<String>,
        activity: impl Into<String>,
        input: impl Into<String>,
        retry: RetryPolicy,
        compensation: Option<Compensation>,
    ) -> Result<String, SagaError> {
        self.run_step(step_id.into(), activity.into(), input.into(), Some(retry), compensation)
            .await
    }

    async fn run_step(
        &mut self,
        step_id: String,
        activity: String,
        input: String,
        retry: Option<RetryPolicy>,
        compensation: Option<Compensation>,
    ) -> Result<String, SagaError> {
        if self.state.is_finished() || self.state == SagaState::Compensating {
            return Err(self.finished_error(&step_id));
        }
        self.state = SagaState::Executing { step: self.steps };
        self.steps += 1;

        let fut = match retry {
            Some(policy) => self.ctx.schedule_activity_with_retry(&activity, input, policy),
            None => self.ctx.schedule_activity(&activity, input),
        };
        match fut.into_activity().await {
            Ok(result) => {
                if let Some(c) = compensation {
                    self.record.push(CompensationEntry {
                        step_id,
                        activity: c.activity,
                        input: c.input.unwrap_or_else(|| result.clone()),
                        retry: c.retry,
                    });
                }
                Ok(result)
            }
            Err(error) => {
                durable_warn!(self.ctx, step = %step_id, activity = %activity, error = %error, "saga step failed, compensating");
                Err(self.compensate(step_id, error).await)
            }
        }
    }

    /// Unwind every completed step without running further forward steps.
    pub async fn abort(&mut self, reason: impl Into<String>) -> SagaError {
        let reason = reason.into();
        if self.state.is_finished() || self.state == SagaState::Compensating {
            return self.finished_error("abort");
        }
        durable_info!(self.ctx, reason = %reason, "saga aborted, compensating");
        self.compensate("abort".to_string(), reason).await
    }

    /// Mark every step done and record a `Completed` report.
    pub fn complete(mut self) -> CompensationReport {
        self.state = SagaState::Completed;
        let report = CompensationReport {
            status: SagaStatus::Completed,
            failed_step: None,
            error: None,
            compensations: Vec::new(),
        };
        self.ctx.record_compensation(report.clone());
        report
    }

    async fn compensate(&mut self, failed_step: String, error: String) -> SagaError {
        self.state = SagaState::Compensating;
        let mut compensations = Vec::with_capacity(self.record.len());
        let mut failed = false;
        for entry in self.record.drain_reverse() {
            let fut = match entry.retry {
                Some(policy) => self.ctx.schedule_activity_with_retry(&entry.activity, entry.input, policy),
                None => self.ctx.schedule_activity(&entry.activity, entry.input),
            };
            let outcome = fut.into_activity().await;
            if let Err(e) = &outcome {
                failed = true;
                durable_warn!(self.ctx, step = %entry.step_id, activity = %entry.activity, error = %e, "compensation failed");
            }
            compensations.push(CompensationResult {
                step_id: entry.step_id,
                activity: entry.activity,
                outcome,
            });
            if failed && self.policy == UnwindPolicy::FailFast {
                break;
            }
        }
        let status = if failed {
            self.state = SagaState::CompensationFailed;
            SagaStatus::CompensationFailed
        } else {
            self.state = SagaState::Compensated;
            SagaStatus::Compensated
        };
        let report = CompensationReport {
            status,
            failed_step: Some(failed_step),
            error: Some(error),
            compensations,
        };
        self.ctx.record_compensation(report.clone());
        SagaError { report }
    }

    fn finished_error(&self, step_id: &str) -> SagaError {
        let status = match self.state {
            SagaState::CompensationFailed => SagaStatus::CompensationFailed,
            SagaState::Completed => SagaStatus::Completed,
            _ => SagaStatus::Compensated,
        };
        SagaError {
            report: CompensationReport {
                status,
                failed_step: Some(step_id.to_string()),
                error: Some("saga already finished".to_string()),
                compensations: Vec::new(),
            },
        }
    }
}
