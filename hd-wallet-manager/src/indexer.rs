//! Blockchain indexer interface
//!
//! The wallet never talks to the network directly. Every query goes through
//! an [`Indexer`], which answers batched per-address and per-txid lookups the
//! way an Electrum server does.

use std::collections::HashMap;

use async_trait::async_trait;
use hd_wallet::bitcoin::Txid;
use hd_wallet::ledger::BalanceEntry;
use hd_wallet::transaction::{HistoryItem, RawTransaction};
use hd_wallet::utxo::UnspentOutput;

use crate::error::{IndexerError, IndexerResult};

/// Batched blockchain queries used by the wallet.
///
/// Implementations may omit addresses without history or unspent outputs from
/// the returned maps. Balance and transaction lookups are expected to answer
/// every key that was asked for.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Confirmed and unconfirmed balance of each address.
    async fn multi_get_balance_by_address(
        &self,
        addresses: &[String],
    ) -> IndexerResult<HashMap<String, BalanceEntry>>;

    /// Transaction history of each address.
    async fn multi_get_history_by_address(
        &self,
        addresses: &[String],
    ) -> IndexerResult<HashMap<String, Vec<HistoryItem>>>;

    /// Decoded transactions with indexer-side metadata.
    async fn multi_get_transaction_by_txid(&self, txids: &[Txid]) -> IndexerResult<HashMap<Txid, RawTransaction>>;

    /// Unspent outputs of each address.
    async fn multi_get_utxo_by_address(
        &self,
        addresses: &[String],
    ) -> IndexerResult<HashMap<String, Vec<UnspentOutput>>>;

    /// Submit a serialized transaction, returning its txid.
    async fn broadcast(&self, raw_tx_hex: &str) -> IndexerResult<Txid>;
}

/// Look up every requested key, failing on the first one the indexer left out.
pub(crate) fn require_all<'a, K, V, Q>(map: &'a HashMap<K, V>, keys: &'a [Q]) -> IndexerResult<Vec<(&'a Q, &'a V)>>
where
    K: std::hash::Hash + Eq + std::borrow::Borrow<Q>,
    Q: std::hash::Hash + Eq + std::fmt::Display,
{
    keys.iter()
        .map(|key| {
            map.get(key)
                .map(|value| (key, value))
                .ok_or_else(|| IndexerError::Protocol(format!("no answer for {}", key)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_all() {
        let mut map = HashMap::new();
        map.insert("a".to_string(), 1);
        map.insert("b".to_string(), 2);

        let keys = vec!["a".to_string(), "b".to_string()];
        let found = require_all(&map, &keys).unwrap();
        assert_eq!(found.iter().map(|(_, v)| **v).sum::<i32>(), 3);

        let keys = vec!["a".to_string(), "c".to_string()];
        assert_eq!(require_all(&map, &keys), Err(IndexerError::Protocol("no answer for c".into())));
    }
}
