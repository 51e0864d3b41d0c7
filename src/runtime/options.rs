use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::providers::DEFAULT_HISTORY_CAP;
use crate::retry::RetryPolicy;

/// Runtime configuration. Every field has a default, so a partial JSON document
/// (or `{}`) is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Upper bound on activity attempts running at the same time.
    pub max_concurrent_activities: usize,
    /// Used for activities scheduled without an explicit policy. `None` means one attempt.
    pub default_retry_policy: Option<RetryPolicy>,
    /// Fallback polling interval for `wait_for_completion`.
    pub status_poll_interval_ms: u64,
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub log_filter: String,
    /// Per-execution history cap for the default in-memory store.
    pub history_cap: usize,
    /// Re-dispatch outstanding work for non-terminal instances on start.
    pub resume_on_start: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_concurrent_activities: 64,
            default_retry_policy: None,
            status_poll_interval_ms: 50,
            log_filter: "info".to_string(),
            history_cap: DEFAULT_HISTORY_CAP,
            resume_on_start: true,
        }
    }
}

impl RuntimeOptions {
    pub fn from_json(s: &str) -> Result<Self, String> {
        let opts: Self = serde_json::from_str(s).map_err(|e| format!("invalid runtime options: {e}"))?;
        if opts.max_concurrent_activities == 0 {
            return Err("invalid runtime options: max_concurrent_activities must be at least 1".to_string());
        }
        Ok(opts)
    }

    pub fn with_max_concurrent_activities(mut self, n: usize) -> Self {
        self.max_concurrent_activities = n.max(1);
        self
    }

    pub fn with_default_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = Some(policy);
        self
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms.max(1))
    }
}
