//! Error types for the notify layer.

/// Result type for notify-layer operations
pub type Result<T> = std::result::Result<T, NotifyError>;

/// Errors surfaced by the listener, notifier, and dispatcher.
///
/// Transient connection problems (`ConnectionLost`, `Database`) are retried
/// internally by the [`Notifier`](crate::Notifier) loop and only reach callers
/// of synchronous registration paths. `DispatcherClosed`/`NotifierStopped` are
/// terminal: the component has shut down and every subsequent call reports it.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The listener has no active connection
    #[error("listener is not connected")]
    NotConnected,

    /// The dedicated LISTEN connection dropped mid-wait; subscriptions must
    /// be re-registered before delivery resumes
    #[error("listener connection lost")]
    ConnectionLost,

    /// A blocking wait was cancelled by shutdown
    #[error("wait cancelled")]
    Cancelled,

    /// The dispatcher has been closed
    #[error("dispatcher is closed")]
    DispatcherClosed,

    /// The notifier has been stopped and cannot accept work
    #[error("notifier is stopped")]
    NotifierStopped,

    /// Failed to establish the dedicated listener connection
    #[error("listener connection failed: {0}")]
    Connection(String),

    /// A LISTEN registration failed for a specific topic
    #[error("failed to listen on topic '{topic}': {reason}")]
    Listen { topic: String, reason: String },

    /// Any other database-level failure on the listener connection
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl NotifyError {
    /// Whether the error indicates the component was shut down, as opposed to
    /// a transient or topic-scoped failure.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            NotifyError::DispatcherClosed | NotifyError::NotifierStopped
        )
    }
}
