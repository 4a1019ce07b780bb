//! Per-index balance and transaction bookkeeping
//!
//! Balances are kept per (chain, index). Whenever a fetched balance differs from
//! the cached one, the cached transactions of that index are dropped so the next
//! transaction refresh has to re-fetch them.

use std::collections::{BTreeMap, HashSet};
use std::ops::Range;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address_cache::addresses_equal;
use crate::derivation::Chain;
use crate::transaction::TransactionRecord;

/// Confirmed and unconfirmed balance of one address, in satoshis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BalanceEntry {
    pub confirmed: i64,
    /// Mempool delta, negative while an outgoing spend is pending
    pub unconfirmed: i64,
}

impl BalanceEntry {
    pub fn new(confirmed: i64, unconfirmed: i64) -> Self {
        Self {
            confirmed,
            unconfirmed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
struct ChainLedger {
    balances: BTreeMap<u32, BalanceEntry>,
    transactions: BTreeMap<u32, Vec<TransactionRecord>>,
}

/// Balances and transactions of both chains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BalanceLedger {
    external: ChainLedger,
    internal: ChainLedger,
}

impl BalanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn chain(&self, chain: Chain) -> &ChainLedger {
        match chain {
            Chain::External => &self.external,
            Chain::Internal => &self.internal,
        }
    }

    fn chain_mut(&mut self, chain: Chain) -> &mut ChainLedger {
        match chain {
            Chain::External => &mut self.external,
            Chain::Internal => &mut self.internal,
        }
    }

    /// Cached balance of an index.
    pub fn balance(&self, chain: Chain, index: u32) -> Option<BalanceEntry> {
        self.chain(chain).balances.get(&index).copied()
    }

    /// Store a freshly fetched balance. Returns `true` if it differed from the
    /// cached one, in which case the index's transactions were invalidated.
    ///
    /// Transactions cached without any balance to compare against count as stale.
    pub fn apply_balance(&mut self, chain: Chain, index: u32, entry: BalanceEntry) -> bool {
        let ledger = self.chain_mut(chain);
        let changed = match ledger.balances.get(&index) {
            Some(old) => *old != entry,
            None => ledger.transactions.get(&index).is_some_and(|txs| !txs.is_empty()),
        };
        if changed {
            debug!("balance of {:?}/{} changed, dropping cached transactions", chain, index);
            ledger.transactions.remove(&index);
        }
        ledger.balances.insert(index, entry);
        changed
    }

    /// Cached transactions of an index.
    pub fn cached_transactions(&self, chain: Chain, index: u32) -> &[TransactionRecord] {
        self.chain(chain).transactions.get(&index).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether the transactions of an index must be re-fetched: nothing cached,
    /// a cached transaction below `refetch_confirmations`, or a pending balance.
    pub fn needs_transaction_refresh(&self, chain: Chain, index: u32, refetch_confirmations: u32) -> bool {
        let cached = self.cached_transactions(chain, index);
        cached.is_empty()
            || cached.iter().any(|tx| tx.confirmations < refetch_confirmations)
            || self.balance(chain, index).is_some_and(|b| b.unconfirmed != 0)
    }

    /// Drop every unconfirmed transaction in `range`. They may have been evicted
    /// from the mempool or replaced; the refresh that follows re-inserts the live ones.
    pub fn purge_unconfirmed(&mut self, chain: Chain, range: Range<u32>) {
        let ledger = self.chain_mut(chain);
        for index in range {
            if let Some(txs) = ledger.transactions.get_mut(&index) {
                txs.retain(TransactionRecord::is_confirmed);
            }
        }
    }

    /// Insert a record for an index, replacing any record with the same txid.
    pub fn upsert_transaction(&mut self, chain: Chain, index: u32, record: TransactionRecord) {
        let txs = self.chain_mut(chain).transactions.entry(index).or_default();
        match txs.iter_mut().find(|tx| tx.txid == record.txid) {
            Some(existing) => *existing = record,
            None => txs.push(record),
        }
    }

    /// File each fetched record under every address in `addresses` it touches.
    pub fn reconcile(&mut self, chain: Chain, addresses: &[(u32, String)], records: &[TransactionRecord]) {
        for (index, address) in addresses {
            for record in records.iter().filter(|r| r.touches(address)) {
                self.upsert_transaction(chain, *index, record.clone());
            }
        }
    }

    /// Mark an index as fetched even if it has no history, so it is not
    /// considered missing on the next pass.
    pub fn ensure_index(&mut self, chain: Chain, index: u32) {
        self.chain_mut(chain).transactions.entry(index).or_default();
    }

    /// Indices with a strictly positive confirmed balance.
    pub fn funded_indices(&self, chain: Chain) -> Vec<u32> {
        self.chain(chain)
            .balances
            .iter()
            .filter(|(_, b)| b.confirmed > 0)
            .map(|(index, _)| *index)
            .collect()
    }

    /// Confirmed plus unconfirmed over every index.
    pub fn total_balance(&self) -> i64 {
        self.entries().map(|b| b.confirmed + b.unconfirmed).sum()
    }

    pub fn confirmed_balance(&self) -> i64 {
        self.entries().map(|b| b.confirmed).sum()
    }

    pub fn unconfirmed_balance(&self) -> i64 {
        self.entries().map(|b| b.unconfirmed).sum()
    }

    fn entries(&self) -> impl Iterator<Item = &BalanceEntry> {
        self.external.balances.values().chain(self.internal.balances.values())
    }

    /// Every cached transaction, deduplicated by txid, with net value and received
    /// time filled in, newest first.
    pub fn transactions<F: Fn(&str) -> bool>(&self, owns: F, now: i64, unconfirmed_offset: i64) -> Vec<TransactionRecord> {
        let mut seen = HashSet::new();
        let mut out: Vec<TransactionRecord> = self
            .external
            .transactions
            .values()
            .chain(self.internal.transactions.values())
            .flatten()
            .filter(|tx| seen.insert(tx.txid))
            .map(|tx| {
                let mut tx = tx.clone();
                tx.value = tx.net_value(&owns);
                tx.received = tx.received_at(now, unconfirmed_offset);
                tx
            })
            .collect();
        out.sort_by(|a, b| b.received.cmp(&a.received));
        out
    }

    /// Whether `address` shows up in any cached transaction.
    pub fn address_seen(&self, address: &str) -> bool {
        self.external
            .transactions
            .values()
            .chain(self.internal.transactions.values())
            .flatten()
            .any(|tx| tx.outputs.iter().any(|o| o.address.as_deref().is_some_and(|a| addresses_equal(a, address))))
    }
}
