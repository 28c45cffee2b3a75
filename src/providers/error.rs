use thiserror::Error;

/// Error returned by a `HistoryStore`, with retry classification.
///
/// The coordinator uses `is_retryable()` to decide whether to re-read and
/// redo a turn. `ConcurrencyConflict` is always retryable: another writer
/// won the race and the decision must be recomputed against the new history.
///
/// ```rust
/// use duraflow::providers::ProviderError;
///
/// let busy = ProviderError::retryable("append", "file locked");
/// assert!(busy.is_retryable());
///
/// let corrupt = ProviderError::permanent("read", "unparseable instance record");
/// assert!(!corrupt.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("concurrency conflict on {instance}: expected version {expected}, found {actual}")]
    ConcurrencyConflict { instance: String, expected: u64, actual: u64 },

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("instance already exists: {0}")]
    InstanceAlreadyExists(String),

    #[error("{operation}: {message}")]
    Storage {
        /// Operation that failed (e.g. "append", "read")
        operation: String,
        message: String,
        retryable: bool,
    },
}

impl ProviderError {
    pub fn storage(operation: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        ProviderError::Storage {
            operation: operation.into(),
            message: message.into(),
            retryable,
        }
    }

    /// Transient storage failure (busy, timeout, interrupted I/O).
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::storage(operation, message, true)
    }

    /// Storage failure that will not succeed on retry (corruption, bad input).
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::storage(operation, message, false)
    }

    pub(crate) fn io(operation: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let retryable = matches!(
            err.kind(),
            ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
        );
        Self::storage(operation, err.to_string(), retryable)
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::ConcurrencyConflict { .. } => true,
            ProviderError::Storage { retryable, .. } => *retryable,
            ProviderError::InstanceNotFound(_) | ProviderError::InstanceAlreadyExists(_) => false,
        }
    }
}
