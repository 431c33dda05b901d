//! Application error model
//!
//! Defines a typed error hierarchy using `thiserror` for internal error
//! handling. Variants are grouped by recovery class: authorization errors
//! halt an agent until new credentials arrive, while transport, protocol,
//! and timeout errors are retryable through the backoff ladder.

use thiserror::Error;

/// Application error type
///
/// Covers all error cases the sync core may encounter. Recovery behavior
/// is driven by [`AppError::is_retryable`].
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input or configuration (validation failed, malformed value)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Resource not found (account, mailbox, message)
    #[error("not found: {0}")]
    NotFound(String),
    /// Authorization failure (no credential, refresh rejected, IMAP auth denied)
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Credential refresh transport failure (retryable)
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
    /// Operation timeout (TCP connect, TLS handshake, IMAP response, fetch)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Transient network or transport failure (connect, read, write, IDLE drop)
    #[error("transport error: {0}")]
    Transport(String),
    /// Malformed or unexpected IMAP response (treated as transient)
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether the failure is recoverable through reconnect-with-backoff
    ///
    /// Authorization failures are not: the agent parks in `Error` until a
    /// new credential is stored and it is restarted.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout(_) | Self::Transport(_) | Self::Protocol(_)
        )
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn retryability_follows_recovery_class() {
        assert!(AppError::Transport("connection reset".to_owned()).is_retryable());
        assert!(AppError::Timeout("fetch".to_owned()).is_retryable());
        assert!(AppError::Protocol("bad untagged response".to_owned()).is_retryable());
        assert!(AppError::Unavailable("refresh endpoint 503".to_owned()).is_retryable());

        assert!(!AppError::Unauthorized("refresh rejected".to_owned()).is_retryable());
        assert!(!AppError::InvalidInput("bad config".to_owned()).is_retryable());
        assert!(!AppError::Internal("bug".to_owned()).is_retryable());
    }
}
