//! In-memory indexer for tests.
//!
//! Balances, histories and unspent outputs are computed from the transactions
//! the mock holds, so they always agree with each other. Broadcast transactions
//! enter the mock's mempool and show up in later queries.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use async_trait::async_trait;
use hd_wallet::bitcoin::consensus::deserialize;
use hd_wallet::bitcoin::consensus::encode::serialize_hex;
use hd_wallet::bitcoin::hashes::Hash;
use hd_wallet::bitcoin::transaction::Version;
use hd_wallet::bitcoin::{
    absolute, Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use hd_wallet::ledger::BalanceEntry;
use hd_wallet::transaction::{HistoryItem, RawInput, RawOutput, RawTransaction};
use hd_wallet::utxo::UnspentOutput;
use tokio::sync::Mutex;

use crate::error::{IndexerError, IndexerResult};
use crate::indexer::Indexer;

/// Height of the mock chain tip.
pub const MOCK_TIP_HEIGHT: u32 = 800_000;
const GENESIS_TIME: i64 = 1_700_000_000;

/// Number of calls made to each indexer method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCalls {
    pub balance: usize,
    pub history: usize,
    pub transactions: usize,
    pub utxos: usize,
    pub broadcast: usize,
}

#[derive(Default)]
struct MockState {
    transactions: HashMap<Txid, RawTransaction>,
    // insertion order, for stable results
    order: Vec<Txid>,
    counter: u64,
    offline: bool,
    fail_next: usize,
    reject_broadcasts: Option<String>,
    broadcasts: Vec<String>,
    calls: MockCalls,
}

impl MockState {
    fn insert(&mut self, tx: RawTransaction) {
        if !self.transactions.contains_key(&tx.txid) {
            self.order.push(tx.txid);
        }
        self.transactions.insert(tx.txid, tx);
    }

    fn check_online(&mut self) -> IndexerResult<()> {
        if self.offline {
            return Err(IndexerError::ConnectionFailed("mock indexer is offline".into()));
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(IndexerError::Timeout);
        }
        Ok(())
    }

    fn ordered(&self) -> impl Iterator<Item = &RawTransaction> {
        self.order.iter().filter_map(|txid| self.transactions.get(txid))
    }

    /// Outpoints spent by any known transaction, split by whether the spender is confirmed.
    fn spent(&self) -> (HashSet<OutPoint>, HashSet<OutPoint>) {
        let mut confirmed = HashSet::new();
        let mut mempool = HashSet::new();
        for tx in self.ordered() {
            let target = if is_confirmed(tx) {
                &mut confirmed
            } else {
                &mut mempool
            };
            target.extend(tx.vin.iter().map(|i| OutPoint::new(i.txid, i.vout)));
        }
        (confirmed, mempool)
    }

    fn pays(&self, outpoint: &OutPoint, address: &str) -> Option<u64> {
        let output = self.transactions.get(&outpoint.txid)?.output(outpoint.vout)?;
        (output.address.as_deref() == Some(address)).then_some(output.value)
    }

    fn balance(&self, address: &str) -> BalanceEntry {
        let (spent_confirmed, spent_mempool) = self.spent();
        let mut entry = BalanceEntry::default();
        for tx in self.ordered() {
            for output in tx.vout.iter().filter(|o| o.address.as_deref() == Some(address)) {
                let outpoint = OutPoint::new(tx.txid, output.n);
                if is_confirmed(tx) {
                    if !spent_confirmed.contains(&outpoint) {
                        entry.confirmed += output.value as i64;
                    }
                } else {
                    entry.unconfirmed += output.value as i64;
                }
            }
        }
        for outpoint in &spent_mempool {
            if let Some(value) = self.pays(outpoint, address) {
                entry.unconfirmed -= value as i64;
            }
        }
        entry
    }

    fn history(&self, address: &str) -> Vec<HistoryItem> {
        self.ordered()
            .filter(|tx| {
                tx.vout.iter().any(|o| o.address.as_deref() == Some(address))
                    || tx.vin.iter().any(|i| self.pays(&OutPoint::new(i.txid, i.vout), address).is_some())
            })
            .map(|tx| HistoryItem {
                txid: tx.txid,
                height: height_of(tx).map(|h| h as i32).unwrap_or(0),
            })
            .collect()
    }

    fn unspent(&self, address: &str) -> Vec<UnspentOutput> {
        let (spent_confirmed, spent_mempool) = self.spent();
        self.ordered()
            .flat_map(|tx| {
                tx.vout
                    .iter()
                    .filter(|o| o.address.as_deref() == Some(address))
                    .map(move |o| (tx, o))
            })
            .filter(|(tx, o)| {
                let outpoint = OutPoint::new(tx.txid, o.n);
                !spent_confirmed.contains(&outpoint) && !spent_mempool.contains(&outpoint)
            })
            .map(|(tx, o)| UnspentOutput {
                txid: tx.txid,
                vout: o.n,
                value: o.value,
                height: height_of(tx),
            })
            .collect()
    }
}

fn is_confirmed(tx: &RawTransaction) -> bool {
    tx.confirmations.unwrap_or(0) > 0
}

fn height_of(tx: &RawTransaction) -> Option<u32> {
    tx.confirmations.filter(|c| *c > 0).map(|c| MOCK_TIP_HEIGHT + 1 - c)
}

/// Decode a transaction into the indexer's view of it.
pub fn raw_from_transaction(tx: &Transaction, network: Network) -> RawTransaction {
    RawTransaction {
        txid: tx.compute_txid(),
        vin: tx
            .input
            .iter()
            .map(|i| RawInput {
                txid: i.previous_output.txid,
                vout: i.previous_output.vout,
                sequence: i.sequence.0,
            })
            .collect(),
        vout: tx
            .output
            .iter()
            .enumerate()
            .map(|(n, o)| RawOutput {
                n: n as u32,
                value: o.value.to_sat(),
                address: Address::from_script(&o.script_pubkey, network).ok().map(|a| a.to_string()),
                script_pubkey: o.script_pubkey.clone(),
            })
            .collect(),
        confirmations: None,
        blocktime: None,
        vsize: Some(tx.vsize() as u64),
        hex: Some(serialize_hex(tx)),
    }
}

/// Scriptable in-memory [`Indexer`].
pub struct MockIndexer {
    network: Network,
    state: Mutex<MockState>,
}

impl MockIndexer {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Add (or replace) a transaction.
    pub async fn add_transaction(&self, tx: RawTransaction) {
        self.state.lock().await.insert(tx);
    }

    /// Pay `value` to `address` from an unknown sender. `confirmations == 0` leaves it in the mempool.
    pub async fn fund(&self, address: &str, value: u64, confirmations: u32) -> Txid {
        let mut state = self.state.lock().await;
        state.counter += 1;
        let n = state.counter;
        let script_pubkey = Address::from_str(address)
            .map(|a| a.assume_checked().script_pubkey())
            .unwrap_or_default();
        let funding = Transaction {
            version: Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::hash(format!("mock sender {}", n).as_bytes()), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence(0xffff_fffe),
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey,
            }],
        };
        let mut tx = raw_from_transaction(&funding, self.network);
        // keep the address as given, even when it does not parse
        tx.vout[0].address = Some(address.to_string());
        tx.confirmations = Some(confirmations);
        tx.blocktime = (confirmations > 0).then_some(GENESIS_TIME + n as i64 * 600);
        let txid = tx.txid;
        state.insert(tx);
        txid
    }

    /// Set the confirmation count of a known transaction.
    pub async fn confirm(&self, txid: &Txid, confirmations: u32) {
        let mut state = self.state.lock().await;
        state.counter += 1;
        let blocktime = GENESIS_TIME + state.counter as i64 * 600;
        if let Some(tx) = state.transactions.get_mut(txid) {
            tx.confirmations = Some(confirmations);
            tx.blocktime = (confirmations > 0).then_some(blocktime);
        }
    }

    /// Fail every call until switched back online.
    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    /// Time out the next `n` calls.
    pub async fn fail_next(&self, n: usize) {
        self.state.lock().await.fail_next = n;
    }

    /// Reject broadcasts with `reason`, or accept them again with `None`.
    pub async fn reject_broadcasts(&self, reason: Option<String>) {
        self.state.lock().await.reject_broadcasts = reason;
    }

    pub async fn calls(&self) -> MockCalls {
        self.state.lock().await.calls
    }

    /// Hex of every accepted broadcast, oldest first.
    pub async fn broadcasts(&self) -> Vec<String> {
        self.state.lock().await.broadcasts.clone()
    }
}

#[async_trait]
impl Indexer for MockIndexer {
    async fn multi_get_balance_by_address(
        &self,
        addresses: &[String],
    ) -> IndexerResult<HashMap<String, BalanceEntry>> {
        let mut state = self.state.lock().await;
        state.calls.balance += 1;
        state.check_online()?;
        Ok(addresses.iter().map(|a| (a.clone(), state.balance(a))).collect())
    }

    async fn multi_get_history_by_address(
        &self,
        addresses: &[String],
    ) -> IndexerResult<HashMap<String, Vec<HistoryItem>>> {
        let mut state = self.state.lock().await;
        state.calls.history += 1;
        state.check_online()?;
        Ok(addresses
            .iter()
            .map(|a| (a.clone(), state.history(a)))
            .filter(|(_, history)| !history.is_empty())
            .collect())
    }

    async fn multi_get_transaction_by_txid(&self, txids: &[Txid]) -> IndexerResult<HashMap<Txid, RawTransaction>> {
        let mut state = self.state.lock().await;
        state.calls.transactions += 1;
        state.check_online()?;
        Ok(txids.iter().filter_map(|txid| state.transactions.get(txid).map(|tx| (*txid, tx.clone()))).collect())
    }

    async fn multi_get_utxo_by_address(
        &self,
        addresses: &[String],
    ) -> IndexerResult<HashMap<String, Vec<UnspentOutput>>> {
        let mut state = self.state.lock().await;
        state.calls.utxos += 1;
        state.check_online()?;
        Ok(addresses
            .iter()
            .map(|a| (a.clone(), state.unspent(a)))
            .filter(|(_, unspent)| !unspent.is_empty())
            .collect())
    }

    async fn broadcast(&self, raw_tx_hex: &str) -> IndexerResult<Txid> {
        let mut state = self.state.lock().await;
        state.calls.broadcast += 1;
        state.check_online()?;
        if let Some(reason) = &state.reject_broadcasts {
            return Err(IndexerError::Broadcast(reason.clone()));
        }
        let bytes = hex::decode(raw_tx_hex).map_err(|e| IndexerError::Broadcast(e.to_string()))?;
        let tx: Transaction = deserialize(&bytes).map_err(|e| IndexerError::Broadcast(e.to_string()))?;
        let raw = raw_from_transaction(&tx, self.network);
        let txid = raw.txid;
        state.insert(raw);
        state.broadcasts.push(raw_tx_hex.to_string());
        Ok(txid)
    }
}
