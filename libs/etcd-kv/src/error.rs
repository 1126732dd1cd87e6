//! Error types for store gateway operations.

use thiserror::Error;

use crate::LeaseId;

/// Top-level error type for the etcd-kv crate.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection or RPC-level failure talking to the store.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Bad client configuration (unreadable PEM, empty endpoint list, …).
    #[error("configuration error: {0}")]
    Config(String),

    /// Stored bytes were not valid UTF-8 text.
    #[error("codec error: {0}")]
    Codec(String),

    /// A write referenced a lease the store does not know (revoked or
    /// expired).
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),
}

impl StoreError {
    /// Whether the failure is transient and the operation may succeed on
    /// retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transport(_) | StoreError::Timeout(_))
    }
}

/// Shorthand result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(StoreError::Transport("conn reset".into()).is_retryable());
        assert!(StoreError::Timeout("deadline".into()).is_retryable());
        assert!(!StoreError::Config("bad pem".into()).is_retryable());
        assert!(!StoreError::Codec("not utf-8".into()).is_retryable());
        assert!(!StoreError::LeaseNotFound(LeaseId::new(7)).is_retryable());
    }
}
