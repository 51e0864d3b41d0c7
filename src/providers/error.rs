/// Error classification returned by history stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Transient; the same call may succeed later (busy file, I/O hiccup).
    Retryable,
    /// Will not succeed on retry: missing instance, closed execution, cap exceeded.
    Permanent,
    /// The write was already made by someone else: reused sequence number or a
    /// second completion for the same scheduling event.
    Conflict,
}

/// Store error with the failing operation attached.
///
/// ```rust
/// use durable_replay::providers::ProviderError;
///
/// let e = ProviderError::conflict("append", "event_id 4 already used");
/// assert!(e.is_conflict());
/// assert_eq!(e.to_string(), "append: event_id 4 already used");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub operation: String,
    pub message: String,
    pub kind: ProviderErrorKind,
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, message, ProviderErrorKind::Retryable)
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, message, ProviderErrorKind::Permanent)
    }

    pub fn conflict(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, message, ProviderErrorKind::Conflict)
    }

    fn new(operation: impl Into<String>, message: impl Into<String>, kind: ProviderErrorKind) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ProviderErrorKind::Retryable
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == ProviderErrorKind::Conflict
    }

    /// Wrap an I/O error; I/O failures are treated as transient.
    pub(crate) fn io(operation: &str, e: std::io::Error) -> Self {
        Self::retryable(operation, e.to_string())
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}
