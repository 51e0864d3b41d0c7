//! Caller-facing handle for starting, signalling and observing instances.

use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use std::time::Duration;

use crate::history::Event;
use crate::runtime::{Instance, Runtime};
use crate::{OrchestrationError, WaitError};

#[derive(Clone)]
pub struct Client {
    runtime: Arc<Runtime>,
}

impl Client {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    /// Start under a generated instance id and return it.
    pub async fn schedule_new_orchestration(
        &self,
        name: &str,
        input: impl Into<String>,
    ) -> Result<String, OrchestrationError> {
        self.runtime.schedule_new_orchestration(name, input).await
    }

    pub async fn schedule_new_orchestration_typed<In: Serialize>(
        &self,
        name: &str,
        input: &In,
    ) -> Result<String, OrchestrationError> {
        let payload = crate::encode_json(input).map_err(|e| OrchestrationError::application(format!("encode: {e}")))?;
        self.runtime.schedule_new_orchestration(name, payload).await
    }

    pub async fn start_orchestration(
        &self,
        instance: &str,
        name: &str,
        input: impl Into<String>,
    ) -> Result<(), OrchestrationError> {
        self.runtime.start_orchestration(instance, name, input).await
    }

    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        instance: &str,
        name: &str,
        input: &In,
    ) -> Result<(), OrchestrationError> {
        self.runtime.start_orchestration_typed(instance, name, input).await
    }

    pub async fn start_orchestration_versioned(
        &self,
        instance: &str,
        name: &str,
        version: impl AsRef<str>,
        input: impl Into<String>,
    ) -> Result<(), OrchestrationError> {
        self.runtime
            .start_orchestration_versioned(instance, name, version, input)
            .await
    }

    pub async fn get_status(&self, instance: &str) -> Result<Instance, OrchestrationError> {
        self.runtime.get_status(instance).await
    }

    pub async fn wait_for_completion(&self, instance: &str, timeout: Duration) -> Result<Instance, WaitError> {
        self.runtime.wait_for_completion(instance, timeout).await
    }

    pub async fn wait_for_completion_typed<Out: DeserializeOwned>(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<Result<Out, String>, WaitError> {
        self.runtime.wait_for_completion_typed(instance, timeout).await
    }

    pub async fn raise_event(
        &self,
        instance: &str,
        name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), OrchestrationError> {
        self.runtime.raise_event(instance, name, data).await
    }

    pub async fn terminate_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), OrchestrationError> {
        self.runtime.terminate_instance(instance, reason).await
    }

    /// History of the latest execution.
    pub async fn get_history(&self, instance: &str) -> Result<Vec<Event>, OrchestrationError> {
        self.runtime.get_history(instance).await
    }

    pub async fn list_executions(&self, instance: &str) -> Vec<u64> {
        self.runtime.list_executions(instance).await
    }
}
