//! Membership error types

use std::net::SocketAddr;

/// Result type for membership operations
pub type Result<T> = std::result::Result<T, MembershipError>;

/// Membership-specific error types
#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Membership protocol not started")]
    NotStarted,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Address unreachable: {0}")]
    Unreachable(SocketAddr),

    #[error("No handler registered for message type: {0}")]
    HandlerNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Membership protocol is shutting down")]
    Shutdown,
}

impl MembershipError {
    pub fn configuration<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn network<T: Into<String>>(msg: T) -> Self {
        Self::Network(msg.into())
    }

    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn handler_not_found<T: Into<String>>(message_type: T) -> Self {
        Self::HandlerNotFound(message_type.into())
    }

    /// Whether the error is a transient transport failure that should feed
    /// failure detection rather than be reported.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::Unreachable(_) | Self::HandlerNotFound(_)
        )
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MembershipError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Shutdown
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for MembershipError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::Shutdown
    }
}

impl From<tokio::time::error::Elapsed> for MembershipError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::timeout(err.to_string())
    }
}
