//! Error types for the wallet manager.

use hd_wallet::ErrorKind;
use thiserror::Error;

/// Failures reported by an [`Indexer`](crate::indexer::Indexer).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IndexerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Malformed indexer response: {0}")]
    Protocol(String),

    #[error("Broadcast rejected: {0}")]
    Broadcast(String),
}

impl IndexerError {
    /// Connectivity failures are worth retrying, bad data is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexerError::ConnectionFailed(_) | IndexerError::Timeout)
    }
}

impl From<IndexerError> for hd_wallet::Error {
    fn from(err: IndexerError) -> Self {
        match err {
            IndexerError::ConnectionFailed(_) | IndexerError::Timeout => hd_wallet::Error::Network(err.to_string()),
            IndexerError::Protocol(msg) | IndexerError::Broadcast(msg) => hd_wallet::Error::Protocol(msg),
        }
    }
}

/// Logging setup errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Subscriber initialization failed: {0}")]
    SubscriberInit(String),
}

/// Errors surfaced by wallet operations.
#[derive(Debug, Error)]
pub enum WalletError {
    #[error(transparent)]
    Core(#[from] hd_wallet::Error),

    #[error("Indexer error: {0}")]
    Indexer(#[from] IndexerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    #[error("Operation cancelled")]
    Cancelled,
}

impl WalletError {
    /// Coarse category, shared with the core crate's errors.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WalletError::Core(err) => err.kind(),
            WalletError::Indexer(err) if err.is_transient() => ErrorKind::Network,
            WalletError::Indexer(_) => ErrorKind::Protocol,
            WalletError::Serialization(_) => ErrorKind::Input,
            WalletError::Logging(_) | WalletError::Cancelled => ErrorKind::State,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Network
    }
}

pub type IndexerResult<T> = std::result::Result<T, IndexerError>;
pub type LoggingResult<T> = std::result::Result<T, LoggingError>;
pub type Result<T> = std::result::Result<T, WalletError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert!(WalletError::from(IndexerError::Timeout).is_retryable());
        assert_eq!(WalletError::from(IndexerError::Protocol("x".into())).kind(), ErrorKind::Protocol);
        assert_eq!(WalletError::Cancelled.kind(), ErrorKind::State);

        let core: hd_wallet::Error = IndexerError::ConnectionFailed("refused".into()).into();
        assert_eq!(core.kind(), ErrorKind::Network);
        assert_eq!(
            WalletError::from(hd_wallet::Error::InsufficientFunds {
                available: 1,
                required: 2
            })
            .kind(),
            ErrorKind::InsufficientFunds
        );
    }
}
