//! HD Wallet Library
//!
//! Synchronous building blocks of a non-custodial Bitcoin wallet: BIP32/39/44/49/84
//! key derivation, extended key format conversion, address caching, gap-limit
//! discovery state, balance and transaction bookkeeping, UTXO tracking, coin
//! selection, PSBT assembly and signing, and multisig quorums.
//!
//! Everything that talks to a blockchain indexer lives in `hd-wallet-manager`.

pub mod address_cache;
pub mod coin_selection;
pub mod config;
pub mod derivation;
pub mod error;
pub mod ext_key;
pub mod fee;
pub mod gap_limit;
pub mod import;
pub mod keys;
pub mod ledger;
pub mod mnemonic;
pub mod multisig;
pub mod script_type;
pub mod signing;
pub mod single_key;
pub mod transaction;
pub mod transaction_builder;
pub mod utxo;

pub use bitcoin;

pub use address_cache::{AddressCache, AddressSource};
pub use coin_selection::{CoinSelector, SelectionResult, SelectionStrategy};
pub use config::WalletConfig;
pub use derivation::{Chain, HdKeyChain};
pub use error::{Error, ErrorKind, Result};
pub use ext_key::{KeyFamily, KeyVersion};
pub use fee::{FeePolicy, FeeRate};
pub use gap_limit::{DiscoveryScan, LagScan};
pub use import::{ImportOptions, Strategy};
pub use keys::WalletKeys;
pub use ledger::{BalanceEntry, BalanceLedger};
pub use multisig::{CosignerKey, MultisigFormat, Quorum};
pub use script_type::ScriptType;
pub use single_key::SingleKey;
pub use transaction::{RawTransaction, TransactionRecord};
pub use transaction_builder::{CreatedTransaction, KeyProvider, Recipient, TransactionBuilder};
pub use utxo::{KeyRef, Utxo, UtxoSet};

/// Re-export commonly used types
pub mod prelude {
    pub use super::{
        Chain, CreatedTransaction, Error, FeeRate, HdKeyChain, Quorum, Recipient, Result, ScriptType,
        TransactionBuilder, Utxo, WalletConfig, WalletKeys,
    };
}
