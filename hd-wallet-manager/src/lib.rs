//! Wallet management on top of `hd-wallet`
//!
//! This crate connects the synchronous primitives of `hd-wallet` to a
//! blockchain indexer.
//!
//! ## Features
//!
//! - Gap-limit address discovery
//! - Balance, transaction and UTXO refresh with atomic commit
//! - Spending with coin selection, signing or unsigned PSBT export
//! - RBF bump, RBF cancel and CPFP
//! - Import of mnemonics, keys and multisig setups
//! - JSON persistence of wallet state

pub mod cancel;
pub mod discovery;
pub mod error;
pub mod fee_bump;
pub mod import;
pub mod indexer;
pub mod logging;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod wallet;

pub use hd_wallet;

pub use cancel::CancellationFlag;
pub use error::{IndexerError, IndexerResult, LoggingError, Result, WalletError};
pub use fee_bump::{BumpState, FeeBumpEngine, FeeBumpInfo};
pub use import::{ImportMode, ImportProgress, Importer};
pub use indexer::Indexer;
pub use logging::{init_console_logging, init_logging, LoggingConfig, LoggingGuard};
pub use wallet::{HdWallet, SendRequest, WalletState};

pub use tracing::level_filters::LevelFilter;
