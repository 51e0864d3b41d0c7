use serde::{Deserialize, Serialize};

use super::Runtime;
use crate::history::{self, Event, EventKind, ExecutionOutcome};
use crate::saga::{CompensationReport, SagaStatus};
use crate::{OrchestrationError, decode_json};

/// Lifecycle state of an execution, derived from its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Created; no pass has recorded anything yet.
    Pending,
    Running,
    Completed,
    Failed,
    /// Closed by continue-as-new. Only ever reported for a non-latest execution.
    ContinuedAsNew,
    Terminated,
    /// Failed, and a saga unwound every completed step.
    Compensated,
    /// Failed, and at least one compensation failed.
    CompensationFailed,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InstanceStatus::Pending | InstanceStatus::Running)
    }
}

/// Status snapshot returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub name: String,
    pub version: String,
    pub execution_id: u64,
    pub status: InstanceStatus,
    pub input: String,
    pub output: Option<String>,
    pub error: Option<OrchestrationError>,
    pub compensation: Option<CompensationReport>,
    pub custom_status: Option<String>,
    pub parent_instance: Option<String>,
    pub created_at_ms: u64,
    pub last_updated_ms: u64,
}

impl Instance {
    /// Build a snapshot from one execution's history. `None` for an empty history.
    pub fn from_history(
        instance_id: &str,
        execution_id: u64,
        history: &[Event],
        custom_status: Option<String>,
    ) -> Option<Self> {
        let (name, version, input, parent) = history::started(history)?;
        let first = history.first()?;
        let last = history.last()?;
        let mut snapshot = Instance {
            instance_id: instance_id.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            execution_id,
            status: if history.len() == 1 {
                InstanceStatus::Pending
            } else {
                InstanceStatus::Running
            },
            input: input.to_string(),
            output: None,
            error: None,
            compensation: None,
            custom_status,
            parent_instance: parent.map(|p| p.instance.clone()),
            created_at_ms: first.timestamp_ms,
            last_updated_ms: last.timestamp_ms,
        };
        match &last.kind {
            EventKind::ContinuedAsNew { .. } => snapshot.status = InstanceStatus::ContinuedAsNew,
            EventKind::OrchestratorCompleted { outcome } => match outcome {
                ExecutionOutcome::Completed { output } => {
                    snapshot.status = InstanceStatus::Completed;
                    snapshot.output = Some(output.clone());
                }
                ExecutionOutcome::Failed { error, compensation } => {
                    snapshot.status = match compensation.as_ref().map(|c| c.status) {
                        Some(SagaStatus::Compensated) => InstanceStatus::Compensated,
                        Some(SagaStatus::CompensationFailed) => InstanceStatus::CompensationFailed,
                        _ => InstanceStatus::Failed,
                    };
                    snapshot.error = Some(error.clone());
                    snapshot.compensation = compensation.clone();
                }
                ExecutionOutcome::Terminated { reason } => {
                    snapshot.status = InstanceStatus::Terminated;
                    snapshot.error = Some(OrchestrationError::application(format!("terminated: {reason}")));
                }
            },
            _ => {}
        }
        Some(snapshot)
    }

    /// Decode the output of a completed instance.
    pub fn output_typed<T: serde::de::DeserializeOwned>(&self) -> Option<Result<T, String>> {
        self.output.as_deref().map(decode_json::<T>)
    }
}

impl Runtime {
    /// Status of the latest execution.
    pub async fn get_status(&self, instance: &str) -> Result<Instance, OrchestrationError> {
        let execution_id =
            self.store
                .latest_execution_id(instance)
                .await
                .ok_or_else(|| OrchestrationError::InstanceNotFound {
                    instance: instance.to_string(),
                })?;
        self.get_execution_status(instance, execution_id).await
    }

    pub async fn get_execution_status(&self, instance: &str, execution_id: u64) -> Result<Instance, OrchestrationError> {
        let history = self.store.read_execution(instance, execution_id).await?;
        let custom_status = self.store.custom_status(instance).await;
        let mut snapshot = Instance::from_history(instance, execution_id, &history, custom_status).ok_or_else(|| {
            OrchestrationError::InstanceNotFound {
                instance: instance.to_string(),
            }
        })?;
        if !snapshot.status.is_terminal()
            && let Some(error) = self.unrecorded_failure(instance, execution_id)
        {
            snapshot.status = InstanceStatus::Failed;
            snapshot.error = Some(error);
        }
        Ok(snapshot)
    }

    pub async fn get_history(&self, instance: &str) -> Result<Vec<Event>, OrchestrationError> {
        Ok(self.store.read(instance).await?)
    }

    pub async fn get_execution_history(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, OrchestrationError> {
        Ok(self.store.read_execution(instance, execution_id).await?)
    }

    pub async fn list_executions(&self, instance: &str) -> Vec<u64> {
        self.store.list_executions(instance).await
    }

    pub async fn list_instances(&self) -> Vec<String> {
        self.store.list_instances().await
    }
}
