//! Indexer-backed wallet
//!
//! [`HdWallet`] pairs key material with the state learned from an [`Indexer`].
//! Refresh methods take `&mut self`, so refreshes of one wallet are serialized
//! by the borrow checker while separate wallets refresh independently.

mod refresh;
mod spend;
mod state;

use std::sync::Arc;

use hd_wallet::bitcoin::bip32::{ChildNumber, DerivationPath};
use hd_wallet::bitcoin::Txid;
use hd_wallet::transaction::TransactionRecord;
use hd_wallet::utxo::{Utxo, UtxoMetadata};
use hd_wallet::{Chain, KeyRef, WalletConfig, WalletKeys};
use tracing::{debug, info, warn};

use crate::discovery;
use crate::error::{Result, WalletError};
use crate::indexer::Indexer;

pub use spend::SendRequest;
pub use state::WalletState;

/// A wallet: keys, configuration, cached chain state and the indexer it syncs from.
pub struct HdWallet {
    keys: WalletKeys,
    config: WalletConfig,
    indexer: Arc<dyn Indexer>,
    state: WalletState,
}

impl std::fmt::Debug for HdWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HdWallet")
            .field("keys", &self.keys)
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl HdWallet {
    /// Create a wallet with empty state.
    pub fn new(keys: WalletKeys, config: WalletConfig, indexer: Arc<dyn Indexer>) -> Result<Self> {
        Self::with_state(keys, config, indexer, WalletState::default())
    }

    /// Create a wallet around previously saved state.
    pub fn with_state(
        keys: WalletKeys,
        config: WalletConfig,
        indexer: Arc<dyn Indexer>,
        state: WalletState,
    ) -> Result<Self> {
        config.validate()?;
        if keys.network() != config.network {
            return Err(hd_wallet::Error::Config(format!(
                "keys are for {} but the wallet is configured for {}",
                keys.network(),
                config.network
            ))
            .into());
        }
        Ok(Self {
            keys,
            config,
            indexer,
            state,
        })
    }

    /// Restore a wallet from [`to_json`](Self::to_json) output.
    pub fn from_json(keys: WalletKeys, config: WalletConfig, indexer: Arc<dyn Indexer>, json: &str) -> Result<Self> {
        let state: WalletState = serde_json::from_str(json)?;
        Self::with_state(keys, config, indexer, state)
    }

    /// Serialize the wallet state. Keys are not included.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.state)?)
    }

    pub fn keys(&self) -> &WalletKeys {
        &self.keys
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn state(&self) -> &WalletState {
        &self.state
    }

    pub fn indexer(&self) -> &Arc<dyn Indexer> {
        &self.indexer
    }

    /// Confirmed plus unconfirmed balance, in satoshis.
    pub fn get_balance(&self) -> i64 {
        self.state.ledger.total_balance()
    }

    pub fn get_confirmed_balance(&self) -> i64 {
        self.state.ledger.confirmed_balance()
    }

    /// Pending mempool delta, negative while a spend is unconfirmed.
    pub fn get_unconfirmed_balance(&self) -> i64 {
        self.state.ledger.unconfirmed_balance()
    }

    /// Every known transaction, one entry per txid, newest first.
    pub fn get_transactions(&self) -> Vec<TransactionRecord> {
        let now = chrono::Utc::now().timestamp();
        self.state.ledger.transactions(
            |address| self.we_own_address(address),
            now,
            self.config.unconfirmed_received_offset_secs,
        )
    }

    /// Unspent outputs from the last UTXO refresh.
    pub fn get_utxos(&self, include_frozen: bool) -> Vec<Utxo> {
        self.state.utxos.spendable(include_frozen)
    }

    pub fn utxo_metadata(&self, txid: &Txid, vout: u32) -> UtxoMetadata {
        self.state.utxos.metadata(txid, vout)
    }

    pub fn set_utxo_frozen(&mut self, txid: &Txid, vout: u32, frozen: bool) {
        self.state.utxos.set_frozen(txid, vout, frozen);
    }

    pub fn set_utxo_memo(&mut self, txid: &Txid, vout: u32, memo: Option<String>) {
        self.state.utxos.set_memo(txid, vout, memo);
    }

    /// Chain and index of an address this wallet derived, searching up to
    /// `gap_limit` past each cursor.
    pub fn locate(&self, address: &str) -> Option<(Chain, u32)> {
        if let WalletKeys::Single(key) = &self.keys {
            return key.owns(address).then_some((Chain::External, 0));
        }
        if let Some(found) = self.state.addresses.find(address) {
            return Some(found);
        }
        Chain::BOTH.into_iter().find_map(|chain| {
            let end = self.state.cursor(chain).saturating_add(self.config.gap_limit);
            (0..end).filter(|i| self.state.addresses.get(chain, *i).is_none()).find_map(|index| {
                let derived = self.keys.derive_address(chain, index).ok()?;
                hd_wallet::address_cache::addresses_equal(&derived.to_string(), address).then_some((chain, index))
            })
        })
    }

    pub fn we_own_address(&self, address: &str) -> bool {
        self.locate(address).is_some()
    }

    pub fn address_is_change(&self, address: &str) -> bool {
        !self.keys.is_single_address() && matches!(self.locate(address), Some((Chain::Internal, _)))
    }

    /// Full derivation path of an owned address. Imported keys have none.
    pub fn address_path(&self, address: &str) -> Option<DerivationPath> {
        let (chain, index) = self.locate(address)?;
        self.path_of(chain, index)
    }

    pub(crate) fn path_of(&self, chain: Chain, index: u32) -> Option<DerivationPath> {
        match &self.keys {
            WalletKeys::Hd(keychain) => keychain.full_path(chain, index).ok(),
            WalletKeys::Multisig(quorum) => {
                let steps = [ChildNumber::from_normal_idx(chain.index()).ok()?, ChildNumber::from_normal_idx(index).ok()?];
                Some(quorum.derivation_path().extend(steps))
            }
            WalletKeys::Single(_) => None,
        }
    }

    /// Key reference and derivation path of an owned address.
    pub(crate) fn key_of(&self, address: &str) -> Option<(KeyRef, Option<DerivationPath>)> {
        let (chain, index) = self.locate(address)?;
        Some((self.keys.key_ref(chain, index), self.path_of(chain, index)))
    }

    /// Address at the chain cursor, without asking the indexer whether it is still unused.
    pub fn current_address(&self, chain: Chain) -> Result<String> {
        let index = if self.keys.is_single_address() {
            0
        } else {
            self.state.cursor(chain)
        };
        match self.state.addresses.get(chain, index) {
            Some(address) => Ok(address.to_string()),
            None => Ok(self.keys.derive_address(chain, index)?.to_string()),
        }
    }

    /// First receive address without history.
    pub async fn get_address(&mut self) -> Result<String> {
        self.next_unused(Chain::External).await
    }

    /// First change address without history.
    pub async fn get_change_address(&mut self) -> Result<String> {
        self.next_unused(Chain::Internal).await
    }

    /// Check up to `gap_limit + 1` addresses from the cursor and move the cursor
    /// to the first unused one. If all have history the cursor jumps past them.
    /// An unreachable indexer leaves the cursor where it is.
    async fn next_unused(&mut self, chain: Chain) -> Result<String> {
        if self.keys.is_single_address() {
            return self.current_address(Chain::External);
        }
        let cursor = self.state.cursor(chain);
        let window = cursor..cursor.saturating_add(self.config.gap_limit + 1);
        let used = match discovery::used_indices(
            self.indexer.as_ref(),
            &self.keys,
            &mut self.state.addresses,
            chain,
            window.clone(),
        )
        .await
        {
            Ok(used) => used,
            Err(WalletError::Indexer(err)) => {
                warn!("Could not check {:?} addresses for usage, using index {}: {}", chain, cursor, err);
                return self.current_address(chain);
            }
            Err(err) => return Err(err),
        };
        let free = window.clone().find(|i| !used.contains(i)).unwrap_or(window.end);
        if free != cursor {
            debug!("{:?} cursor {} -> {}", chain, cursor, free);
        }
        self.state.advance_cursor(chain, free);
        Ok(self.state.addresses.get_or_derive(&self.keys, chain, free)?)
    }

    /// Whether the wallet's first receive addresses have any history.
    pub async fn was_ever_used(&mut self) -> Result<bool> {
        discovery::was_ever_used(self.indexer.as_ref(), &self.keys, &mut self.state.addresses, &self.config).await
    }

    /// Submit a signed transaction.
    pub async fn broadcast(&self, tx_hex: &str) -> Result<Txid> {
        let txid = self.indexer.broadcast(tx_hex).await?;
        info!("Broadcast {}", txid);
        Ok(txid)
    }
}
