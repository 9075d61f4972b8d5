use thiserror::Error;

/// A convenience `Result` alias using [`MaestroError`].
pub type MaestroResult<T> = Result<T, MaestroError>;

/// Top-level error type for Maestro.
///
/// Task-level handler failures are *not* reported through this type; they are
/// captured as values in a run's result map. What surfaces here is limited to
/// rejected submissions, coordinator misuse, internal invariant violations and
/// storage trouble.
#[derive(Error, Debug)]
pub enum MaestroError {
    /// A workflow specification was rejected before any task was created.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A handler could not be resolved or invoked.
    #[error("Handler error: {0}")]
    Handler(String),

    /// An internal queue invariant was violated (e.g. a double dequeue).
    #[error("Queue contention error: {0}")]
    QueueContention(String),

    /// The state backing store failed to load or flush.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A run, task, or key that the caller referenced does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A bounded wait elapsed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The operation was abandoned because its run was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Configuration parsing or validation failed.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_display_prefixes() {
        assert_eq!(
            MaestroError::Validation("empty steps".into()).to_string(),
            "Validation error: empty steps"
        );
        assert_eq!(
            MaestroError::QueueContention("double dequeue".into()).to_string(),
            "Queue contention error: double dequeue"
        );
        assert_eq!(
            MaestroError::NotFound("run 42".into()).to_string(),
            "Not found: run 42"
        );
    }

    #[test]
    fn test_from_serde_json() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: MaestroError = err.into();
        assert!(err.to_string().starts_with("JSON error:"));
    }

    #[test]
    fn test_from_io() {
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err: MaestroError = err.into();
        assert!(matches!(err, MaestroError::Io(_)));
    }
}
