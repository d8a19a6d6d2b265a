use thiserror::Error;

/// Errors surfaced by the pipeline and the trace reservoir subsystem.
///
/// Malformed datapoints are never an error: stages skip them silently and
/// keep going. Everything here is either a startup-time configuration
/// problem, a storage fault, or a cancellation.
#[derive(Error, Debug)]
pub enum SiftError {
    /// Invalid configuration, raised at component creation only.
    #[error("configuration error: {0}")]
    Config(String),

    /// Writing a checkpoint snapshot failed. The reservoir keeps operating
    /// from in-memory state; callers may retry.
    #[error("checkpoint write failed: {0}")]
    CheckpointWrite(String),

    /// Reading the last committed checkpoint failed.
    #[error("checkpoint read failed: {0}")]
    CheckpointRead(String),

    /// The batch was cancelled at a stage boundary.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid span data (bad trace/span identifier, empty name).
    #[error("invalid span data: {0}")]
    InvalidSpan(String),

    /// Checkpoint snapshot could not be encoded or decoded.
    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error from checkpoint storage.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for procsift operations.
pub type Result<T> = std::result::Result<T, SiftError>;

impl SiftError {
    /// Creates a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new checkpoint-write error.
    pub fn checkpoint_write<S: Into<String>>(msg: S) -> Self {
        Self::CheckpointWrite(msg.into())
    }

    /// Creates a new checkpoint-read error.
    pub fn checkpoint_read<S: Into<String>>(msg: S) -> Self {
        Self::CheckpointRead(msg.into())
    }

    /// Returns true if the caller can reasonably retry the operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CheckpointWrite(_) | Self::CheckpointRead(_) | Self::Io(_)
        )
    }

    /// Returns the error category for metrics and log labels.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::CheckpointWrite(_) | Self::CheckpointRead(_) => "checkpoint",
            Self::Cancelled => "cancelled",
            Self::InvalidSpan(_) => "validation",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = SiftError::config("k_value must be positive");
        assert_eq!(err.to_string(), "configuration error: k_value must be positive");
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_error_recoverability() {
        assert!(SiftError::checkpoint_write("disk full").is_recoverable());
        assert!(SiftError::checkpoint_read("truncated").is_recoverable());
        assert!(!SiftError::config("bad").is_recoverable());
        assert!(!SiftError::Cancelled.is_recoverable());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: SiftError = io.into();
        assert_eq!(err.category(), "io");
    }
}
