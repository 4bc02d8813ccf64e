use thiserror::Error;

/// Result type for job queue operations
pub type JobsResult<T> = Result<T, JobsError>;

/// Infrastructure errors surfaced to producers, operators and the service lifecycle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobsError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown broker kind: {0}")]
    UnknownBrokerKind(String),

    #[error("Pipeline already registered: {0}")]
    DuplicatePipeline(String),

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Pipeline {pipeline} is full (capacity: {capacity})")]
    QueueFull { pipeline: String, capacity: usize },

    #[error("Reservation failed: {0}")]
    Reservation(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobsError {
    /// Transport-level failures that a reconnect or a later retry may cure
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BrokerUnavailable(_) | Self::Reservation(_))
    }
}

impl From<serde_json::Error> for JobsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Handler-side failure - determines retry behavior
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Retryable error - the job is requeued while attempts remain
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// Permanent error - dead-lettered immediately, no retry
    #[error("Permanent error: {0}")]
    Permanent(String),
}

impl JobError {
    /// Create a retryable error
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) => msg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_transport_failures() {
        assert!(JobsError::BrokerUnavailable("down".into()).is_transient());
        assert!(JobsError::Reservation("reset".into()).is_transient());
        assert!(!JobsError::InvalidPayload("too big".into()).is_transient());
        assert!(!JobsError::PipelineNotFound("emails".into()).is_transient());
    }

    #[test]
    fn job_error_keeps_message() {
        let err = JobError::retryable("smtp timeout");
        assert!(err.is_retryable());
        assert_eq!(err.message(), "smtp timeout");
        assert!(!JobError::permanent("bad address").is_retryable());
    }

    #[test]
    fn serde_errors_convert() {
        let err: JobsError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, JobsError::Serialization(_)));
    }
}
