//! Persisted wallet state.

use hd_wallet::address_cache::AddressCache;
use hd_wallet::ledger::BalanceLedger;
use hd_wallet::utxo::UtxoSet;
use hd_wallet::Chain;
use serde::{Deserialize, Serialize};

/// Everything a wallet learns from the indexer, plus its address cursors.
///
/// Key material is not part of the state: it is supplied again when the
/// wallet is restored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletState {
    /// First unused receive index
    pub next_free_index: u32,
    /// First unused change index
    pub next_free_change_index: u32,
    /// Whether the initial gap-limit discovery ran
    #[serde(default)]
    pub discovered: bool,
    pub addresses: AddressCache,
    pub ledger: BalanceLedger,
    pub utxos: UtxoSet,
    /// Unix time of the last successful balance refresh
    #[serde(default)]
    pub last_balance_fetch: Option<i64>,
    /// Unix time of the last successful transaction refresh
    #[serde(default)]
    pub last_transactions_fetch: Option<i64>,
}

impl WalletState {
    pub fn cursor(&self, chain: Chain) -> u32 {
        match chain {
            Chain::External => self.next_free_index,
            Chain::Internal => self.next_free_change_index,
        }
    }

    pub(crate) fn set_cursor(&mut self, chain: Chain, cursor: u32) {
        match chain {
            Chain::External => self.next_free_index = cursor,
            Chain::Internal => self.next_free_change_index = cursor,
        }
    }

    /// Cursors only ever move forward.
    pub(crate) fn advance_cursor(&mut self, chain: Chain, cursor: u32) {
        if cursor > self.cursor(chain) {
            self.set_cursor(chain, cursor);
        }
    }
}
