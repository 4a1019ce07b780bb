//! Error types for the hd-wallet library

use thiserror::Error;

/// Result type alias for hd-wallet operations
pub type Result<T> = core::result::Result<T, Error>;

/// Broad category of an [`Error`], used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed user input (mnemonic, path, key, address, fee rate). User must re-enter.
    Input,
    /// The wallet is not in a state that allows the operation (watch-only, data not fetched).
    State,
    /// Coin selection could not cover the requested outputs.
    InsufficientFunds,
    /// Fee bump refused because an input cannot be traced back to the wallet.
    UnknownInput,
    /// The indexer returned malformed or incomplete data.
    Protocol,
    /// Transient transport failure, retryable by the caller.
    Network,
}

/// Errors that can occur in hd-wallet operations
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("Invalid derivation path: {0}")]
    InvalidDerivationPath(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Unsupported script type: {0}")]
    UnsupportedScriptType(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("New fee rate {requested} sat/vB must be higher than current {current} sat/vB")]
    FeeRateTooLow {
        current: u64,
        requested: u64,
    },

    #[error("Wallet holds no secret")]
    NoSecret,

    #[error("Missing data: {0}")]
    MissingData(String),

    #[error("Change address required")]
    ChangeAddressRequired,

    #[error("Signing key not found for {0}")]
    SigningKeyNotFound(String),

    #[error("Transaction does not signal replaceability")]
    NotReplaceable,

    #[error("Transaction has no outputs to third parties and cannot be cancelled")]
    CannotCancel,

    #[error("Combined fee rate {reached} sat/vB did not reach the requested {requested} sat/vB")]
    FeeTargetUnreachable {
        reached: u64,
        requested: u64,
    },

    #[error("Insufficient funds: available {available}, required {required}")]
    InsufficientFunds {
        available: u64,
        required: u64,
    },

    #[error("Unknown input: {0}")]
    UnknownInput(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("BIP32 error: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),

    #[error("PSBT error: {0}")]
    Psbt(#[from] bitcoin::psbt::Error),

    #[error("Signing failed: {0}")]
    Signing(String),
}

impl Error {
    /// The category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidMnemonic(_)
            | Error::InvalidDerivationPath(_)
            | Error::InvalidKey(_)
            | Error::InvalidAddress(_)
            | Error::UnsupportedScriptType(_)
            | Error::DuplicateKey(_)
            | Error::Config(_)
            | Error::FeeRateTooLow {
                ..
            }
            | Error::ChangeAddressRequired
            | Error::Bip32(_) => ErrorKind::Input,
            Error::NoSecret
            | Error::MissingData(_)
            | Error::SigningKeyNotFound(_)
            | Error::NotReplaceable
            | Error::CannotCancel
            | Error::FeeTargetUnreachable {
                ..
            }
            | Error::Psbt(_)
            | Error::Signing(_) => ErrorKind::State,
            Error::InsufficientFunds {
                ..
            } => ErrorKind::InsufficientFunds,
            Error::UnknownInput(_) => ErrorKind::UnknownInput,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Network(_) => ErrorKind::Network,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Network
    }
}

impl From<bip39::Error> for Error {
    fn from(e: bip39::Error) -> Self {
        Error::InvalidMnemonic(e.to_string())
    }
}

impl From<bitcoin::key::FromWifError> for Error {
    fn from(e: bitcoin::key::FromWifError) -> Self {
        Error::InvalidKey(e.to_string())
    }
}

impl From<bitcoin::address::ParseError> for Error {
    fn from(e: bitcoin::address::ParseError) -> Self {
        Error::InvalidAddress(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::NoSecret.kind(), ErrorKind::State);
        assert_eq!(Error::InvalidDerivationPath("m/x".into()).kind(), ErrorKind::Input);
        assert_eq!(
            Error::InsufficientFunds {
                available: 1,
                required: 2
            }
            .kind(),
            ErrorKind::InsufficientFunds
        );
        assert!(Error::Network("timeout".into()).is_retryable());
        assert!(!Error::Protocol("short batch".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::FeeRateTooLow {
            current: 10,
            requested: 5,
        };
        assert_eq!(err.to_string(), "New fee rate 5 sat/vB must be higher than current 10 sat/vB");
    }
}
