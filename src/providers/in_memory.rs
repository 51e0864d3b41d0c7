use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{DEFAULT_HISTORY_CAP, HistoryStore, ProviderError, validate_append, validate_closing, validate_started};
use crate::Event;

#[derive(Debug, Default)]
struct InstanceRecord {
    // execution_id N lives at index N-1
    executions: Vec<Vec<Event>>,
    custom_status: Option<String>,
}

/// Process-local store. Everything is lost when it is dropped.
pub struct InMemoryHistoryStore {
    inner: Mutex<HashMap<String, InstanceRecord>>,
    cap: usize,
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::with_cap(DEFAULT_HISTORY_CAP)
    }
}

impl InMemoryHistoryStore {
    pub fn with_cap(cap: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            cap,
        }
    }
}

fn not_found(operation: &str, instance: &str) -> ProviderError {
    ProviderError::permanent(operation, format!("instance not found: {instance}"))
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(&self, instance: &str, started: Event) -> Result<(), ProviderError> {
        validate_started(&started)?;
        let mut g = self.inner.lock().await;
        if g.contains_key(instance) {
            return Err(ProviderError::conflict(
                "create_instance",
                format!("instance already exists: {instance}"),
            ));
        }
        g.insert(
            instance.to_string(),
            InstanceRecord {
                executions: vec![vec![started]],
                custom_status: None,
            },
        );
        Ok(())
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let g = self.inner.lock().await;
        Ok(g
            .get(instance)
            .and_then(|r| r.executions.last().cloned())
            .unwrap_or_default())
    }

    async fn read_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError> {
        let g = self.inner.lock().await;
        let idx = execution_id.saturating_sub(1) as usize;
        Ok(g
            .get(instance)
            .and_then(|r| r.executions.get(idx).cloned())
            .unwrap_or_default())
    }

    async fn append(&self, instance: &str, execution_id: u64, events: Vec<Event>) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        let record = g.get_mut(instance).ok_or_else(|| not_found("append", instance))?;
        let idx = execution_id.saturating_sub(1) as usize;
        let current = record.executions.get_mut(idx).ok_or_else(|| {
            ProviderError::permanent("append", format!("execution not found: {instance}#{execution_id}"))
        })?;
        validate_append(current, &events, self.cap)?;
        current.extend(events);
        Ok(())
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let g = self.inner.lock().await;
        g.get(instance)
            .map(|r| r.executions.len() as u64)
            .filter(|n| *n > 0)
    }

    async fn list_executions(&self, instance: &str) -> Vec<u64> {
        let g = self.inner.lock().await;
        match g.get(instance) {
            Some(r) => (1..=r.executions.len() as u64).collect(),
            None => Vec::new(),
        }
    }

    async fn continue_as_new(
        &self,
        instance: &str,
        execution_id: u64,
        closing: Event,
        started: Event,
    ) -> Result<u64, ProviderError> {
        validate_started(&started)?;
        let mut g = self.inner.lock().await;
        let record = g
            .get_mut(instance)
            .ok_or_else(|| not_found("continue_as_new", instance))?;
        if record.executions.len() as u64 != execution_id {
            return Err(ProviderError::conflict(
                "continue_as_new",
                format!("execution {execution_id} is not the latest of {instance}"),
            ));
        }
        let current = record
            .executions
            .last_mut()
            .ok_or_else(|| not_found("continue_as_new", instance))?;
        validate_closing(current, &closing, self.cap)?;
        current.push(closing);
        record.executions.push(vec![started]);
        record.custom_status = None;
        Ok(record.executions.len() as u64)
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut out: Vec<String> = self.inner.lock().await.keys().cloned().collect();
        out.sort();
        out
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        g.remove(instance)
            .map(|_| ())
            .ok_or_else(|| not_found("remove_instance", instance))
    }

    async fn set_custom_status(&self, instance: &str, status: Option<String>) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        let record = g
            .get_mut(instance)
            .ok_or_else(|| not_found("set_custom_status", instance))?;
        record.custom_status = status;
        Ok(())
    }

    async fn custom_status(&self, instance: &str) -> Option<String> {
        let g = self.inner.lock().await;
        g.get(instance).and_then(|r| r.custom_status.clone())
    }
}
