//! Common error types for Tether components.

use thiserror::Error;

/// Error classes shared by the coordinator, the agents and their RPC surface
#[derive(Debug, Error)]
pub enum TetherError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed identity strings, undecryptable payloads, bad JSON
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown signer, signer not the designated coordinator, signer not local
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Request understood but refused in the current state
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Nothing matched the request
    #[error("Not found: {0}")]
    NotFound(String),

    /// Peer unreachable or refused the connection
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Local persistence (checkpoint files, registry database)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Key material or symmetric encryption failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl TetherError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Config(_) => 500,
            Self::InvalidArgument(_) => 400,
            Self::Unauthenticated(_) => 401,
            Self::FailedPrecondition(_) => 412,
            Self::NotFound(_) => 404,
            Self::Unavailable(_) => 503,
            Self::Storage(_) => 500,
            Self::Crypto(_) => 500,
            Self::Internal(_) => 500,
            Self::Timeout(_) => 504,
        }
    }

    /// Returns true if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }

    /// Rebuild an error class from a status code returned by a peer
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            400 => Self::InvalidArgument(message),
            401 | 403 => Self::Unauthenticated(message),
            404 => Self::NotFound(message),
            412 => Self::FailedPrecondition(message),
            502 | 503 => Self::Unavailable(message),
            504 => Self::Timeout(message),
            _ => Self::Internal(message),
        }
    }

    /// True for rejections that will not succeed on retry
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::InvalidArgument(_) | Self::Unauthenticated(_))
    }
}

pub type Result<T> = std::result::Result<T, TetherError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_keeps_class() {
        let errors = [
            TetherError::InvalidArgument("x".into()),
            TetherError::Unauthenticated("x".into()),
            TetherError::FailedPrecondition("x".into()),
            TetherError::NotFound("x".into()),
            TetherError::Unavailable("x".into()),
            TetherError::Timeout("x".into()),
        ];
        for err in errors {
            let back = TetherError::from_status(err.status_code(), "x".into());
            assert_eq!(back.status_code(), err.status_code());
        }
    }

    #[test]
    fn test_retryable_classes() {
        assert!(TetherError::Unavailable("peer".into()).is_retryable());
        assert!(!TetherError::InvalidArgument("bad".into()).is_retryable());
        assert!(TetherError::Unauthenticated("who".into()).is_rejection());
    }
}
