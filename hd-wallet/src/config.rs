//! Engine configuration.
//!
//! Every tunable that a wallet instance depends on lives here and is passed in at
//! construction, so two wallets never share mutable defaults.

use bitcoin::Network;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gap_limit::{DEFAULT_GAP_LIMIT, MAX_GAP_LIMIT};

/// Default sequence for new transactions: RBF-enabled, relative locktime disabled.
pub const DEFAULT_RBF_SEQUENCE: u32 = 0x8000_0000;

/// Standard dust threshold in satoshis.
pub const DEFAULT_DUST_THRESHOLD: u64 = 546;

/// Configuration for a wallet engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WalletConfig {
    /// Network addresses and keys are rendered for.
    pub network: Network,

    /// Number of consecutive unused addresses scanned before assuming no further usage.
    pub gap_limit: u32,

    /// Sequence used for inputs when the caller does not supply one.
    pub rbf_sequence: u32,

    /// Upper bound for the forward discovery scan.
    pub discovery_max_index: u32,

    /// Transactions with fewer confirmations than this are re-fetched on every refresh.
    pub refetch_confirmations: u32,

    /// Unconfirmed transactions get `now - offset` as their received time.
    pub unconfirmed_received_offset_secs: i64,

    /// Change below this value is folded into the fee.
    pub dust_threshold: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            gap_limit: DEFAULT_GAP_LIMIT,
            rbf_sequence: DEFAULT_RBF_SEQUENCE,
            discovery_max_index: 1000,
            refetch_confirmations: 7,
            unconfirmed_received_offset_secs: 30,
            dust_threshold: DEFAULT_DUST_THRESHOLD,
        }
    }
}

impl WalletConfig {
    /// Create a configuration for the given network with default values.
    pub fn new(network: Network) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    /// Mainnet defaults.
    pub fn mainnet() -> Self {
        Self::new(Network::Bitcoin)
    }

    /// Testnet defaults.
    pub fn testnet() -> Self {
        Self::new(Network::Testnet)
    }

    /// Set the gap limit.
    pub fn with_gap_limit(mut self, gap_limit: u32) -> Self {
        self.gap_limit = gap_limit;
        self
    }

    /// Set the default input sequence.
    pub fn with_rbf_sequence(mut self, sequence: u32) -> Self {
        self.rbf_sequence = sequence;
        self
    }

    /// Set the discovery scan bound.
    pub fn with_discovery_max_index(mut self, max_index: u32) -> Self {
        self.discovery_max_index = max_index;
        self
    }

    /// Set the confirmation depth below which transactions are re-fetched.
    pub fn with_refetch_confirmations(mut self, confirmations: u32) -> Self {
        self.refetch_confirmations = confirmations;
        self
    }

    /// Set the dust threshold.
    pub fn with_dust_threshold(mut self, threshold: u64) -> Self {
        self.dust_threshold = threshold;
        self
    }

    /// Check the configuration for values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.gap_limit == 0 || self.gap_limit > MAX_GAP_LIMIT {
            return Err(Error::Config(format!(
                "gap limit must be between 1 and {}, got {}",
                MAX_GAP_LIMIT, self.gap_limit
            )));
        }
        if self.discovery_max_index < self.gap_limit {
            return Err(Error::Config(format!(
                "discovery bound {} is smaller than the gap limit {}",
                self.discovery_max_index, self.gap_limit
            )));
        }
        Ok(())
    }
}
