//! Error types for the invocation core.

use switchboard_notify::NotifyError;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the invocation manager and stores.
///
/// Expected races — double claims, double completions, unknown ids — are not
/// errors at all: those come back as `Ok(None)` or a no-op outcome. What's
/// left splits into caller mistakes (`InvalidInput`, `UnknownAgent`), server
/// faults (`CorruptRecord`, `Storage`, `Serialization`), shutdown (`Closed`
/// and closed notify-layer errors), and infrastructure trouble (`Notify`).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The caller supplied unusable input (e.g. empty metadata)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The target agent is not registered
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    /// A stored document failed to decode; the row is damaged, not the caller
    #[error("stored record is corrupt: {0}")]
    CorruptRecord(String),

    /// Marshalling a caller-supplied document failed
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database-level failure
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Failure in the notify layer
    #[error(transparent)]
    Notify(#[from] NotifyError),

    /// The manager has been closed
    #[error("invocation manager is closed")]
    Closed,
}

impl CoreError {
    /// Whether the HTTP collaborator should map this to a 4xx.
    pub fn is_client_error(&self) -> bool {
        matches!(self, CoreError::InvalidInput(_) | CoreError::UnknownAgent(_))
    }

    /// Whether this reports a shut-down component rather than a fault.
    pub fn is_closed(&self) -> bool {
        match self {
            CoreError::Closed => true,
            CoreError::Notify(e) => e.is_closed(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_classification() {
        assert!(CoreError::InvalidInput("meta".into()).is_client_error());
        assert!(CoreError::UnknownAgent("a".into()).is_client_error());
        assert!(!CoreError::CorruptRecord("bad state".into()).is_client_error());
        assert!(!CoreError::Closed.is_client_error());
    }

    #[test]
    fn closed_classification() {
        assert!(CoreError::Closed.is_closed());
        assert!(CoreError::Notify(NotifyError::DispatcherClosed).is_closed());
        assert!(!CoreError::Notify(NotifyError::NotConnected).is_closed());
    }
}
