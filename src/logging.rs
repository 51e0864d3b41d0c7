use serde::{Deserialize, Serialize};

/// Level attached to buffered orchestration log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Install a global fmt subscriber. `RUST_LOG` wins over `default_filter`.
/// Safe to call many times; only the first call installs anything.
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .try_init();
}

// Replay-safe logging: emit only when the orchestration is executing new code,
// never while it is replaying recorded history.

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::info!(instance = %$ctx.instance_id(), turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::warn!(instance = %$ctx.instance_id(), turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::error!(instance = %$ctx.instance_id(), turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::debug!(instance = %$ctx.instance_id(), turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}
