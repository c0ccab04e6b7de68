//! Error types for gangplank

use thiserror::Error;

/// Main error type for gangplank
#[derive(Error, Debug)]
pub enum SchedError {
    /// A required input was missing or empty
    #[error("Argument error: {0}")]
    Argument(String),

    /// The node or topology cannot satisfy the request
    #[error("Infeasible: {0}")]
    Infeasible(String),

    /// The requested device count is not allowed for the accelerator family
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A placement filter rejected the node
    #[error("Predicate failed: {0}")]
    Predicate(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Queue not found
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Node not found
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Binding a task to a node failed
    #[error("Bind error: {0}")]
    Bind(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for gangplank operations
pub type SchedResult<T> = Result<T, SchedError>;

impl SchedError {
    /// Whether this error means "does not fit" rather than "called wrongly".
    ///
    /// Infeasibility is the expected, frequent outcome that drives the
    /// dequeue strategy; everything else points at bad input.
    pub fn is_infeasible(&self) -> bool {
        matches!(
            self,
            SchedError::Infeasible(_) | SchedError::Predicate(_) | SchedError::InvalidRequest(_)
        )
    }
}

impl From<serde_json::Error> for SchedError {
    fn from(err: serde_json::Error) -> Self {
        SchedError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for SchedError {
    fn from(err: toml::de::Error) -> Self {
        SchedError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedError::Infeasible("node n1 has 2 free, task needs 4".to_string());
        assert_eq!(err.to_string(), "Infeasible: node n1 has 2 free, task needs 4");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SchedError = io_err.into();
        assert!(matches!(err, SchedError::Io(_)));
    }

    #[test]
    fn test_is_infeasible() {
        assert!(SchedError::Predicate("cpu".to_string()).is_infeasible());
        assert!(SchedError::InvalidRequest("3".to_string()).is_infeasible());
        assert!(!SchedError::Argument("nil task".to_string()).is_infeasible());
    }
}
