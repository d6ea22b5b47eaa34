//! Execution layer error types.

use thiserror::Error;

/// Errors that can occur in the dispatch fabric.
#[derive(Debug, Error)]
pub enum ExecError {
    /// A message broke the internal protocol (closed queue outside shutdown,
    /// malformed request). Fatal to the receiving task.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid pool configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A worker task panicked or was aborted
    #[error("Worker failed: {0}")]
    Worker(String),

    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] msq_domain::DomainError),
}

impl ExecError {
    /// Create a protocol violation error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }
}

/// Result type for execution operations.
pub type ExecResult<T> = Result<T, ExecError>;
