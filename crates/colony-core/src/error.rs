use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A convenience `Result` alias using [`ColonyError`].
pub type ColonyResult<T> = Result<T, ColonyError>;

/// Top-level error type for the Colony swarm.
///
/// Each variant corresponds to one class of failure. Components classify
/// failures locally and surface them through this type instead of letting a
/// single task, message, or subscriber bring down the owning component.
#[derive(Error, Debug)]
pub enum ColonyError {
    /// Malformed task or message. Rejected synchronously, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A bounded structure (queue, inbox) is full.
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// Unknown agent, task, or recipient. Fails immediately.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A deadline elapsed. Treated as a delivery failure for retry purposes.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Recipient temporarily unreachable.
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Task logic failed while running on an agent.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Invalid or unreadable configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// The component has been stopped.
    #[error("Shutdown: {0}")]
    Shutdown(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`ColonyError`], suitable for reporting in
/// typed result objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Capacity,
    NotFound,
    Timeout,
    Delivery,
    Execution,
    Config,
    Shutdown,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Capacity => "capacity",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Delivery => "delivery",
            ErrorKind::Execution => "execution",
            ErrorKind::Config => "config",
            ErrorKind::Shutdown => "shutdown",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl ColonyError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ColonyError::Validation(_) => ErrorKind::Validation,
            ColonyError::Capacity(_) => ErrorKind::Capacity,
            ColonyError::NotFound(_) => ErrorKind::NotFound,
            ColonyError::Timeout(_) => ErrorKind::Timeout,
            ColonyError::Delivery(_) => ErrorKind::Delivery,
            ColonyError::Execution(_) => ErrorKind::Execution,
            ColonyError::Config(_) => ErrorKind::Config,
            ColonyError::Shutdown(_) => ErrorKind::Shutdown,
            ColonyError::Json(_) | ColonyError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the failed operation may succeed.
    ///
    /// Transient delivery, timeout, and execution failures are retryable.
    /// Validation, not-found, capacity, config, and shutdown failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Delivery | ErrorKind::Timeout | ErrorKind::Execution
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            ColonyError::Validation("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(ColonyError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(ColonyError::from(io).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_retryable() {
        assert!(ColonyError::Delivery("busy".into()).is_retryable());
        assert!(ColonyError::Timeout("slow".into()).is_retryable());
        assert!(ColonyError::Execution("boom".into()).is_retryable());
        assert!(!ColonyError::NotFound("agent-9".into()).is_retryable());
        assert!(!ColonyError::Validation("empty".into()).is_retryable());
        assert!(!ColonyError::Capacity("full".into()).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = ColonyError::Capacity("queue full (10/10)".into());
        assert_eq!(err.to_string(), "Capacity error: queue full (10/10)");
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
    }
}
