//! Error types for the jobs client

use crate::model::RejectedErrorResponse;
use thiserror::Error;

/// Errors that can occur when using the jobs client
#[derive(Error, Debug)]
pub enum JobsError {
    /// A request parameter is missing or invalid; nothing was sent
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The transport failed to establish a needed subscription; the request
    /// was never published
    #[error("Subscription failed: {0}")]
    Subscription(String),

    /// No correlated response arrived within the operation timeout
    #[error("Operation timed out")]
    Timeout,

    /// The transport became unusable (publish failed or connection lost)
    #[error("Transport error: {0}")]
    Transport(String),

    /// A response arrived but could not be decoded for the operation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The service rejected the request
    #[error("Request rejected: {0}")]
    Rejected(RejectedErrorResponse),

    /// The client has been closed
    #[error("Client closed")]
    ClientClosed,
}

/// Result type for jobs client operations
pub type Result<T> = std::result::Result<T, JobsError>;
