//! Balance, transaction and UTXO refresh.
//!
//! Each refresh works on a copy of the wallet state and swaps it in only when
//! every indexer round trip succeeded. A failed or cancelled refresh is logged
//! and leaves the previous state untouched.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use hd_wallet::bitcoin::Txid;
use hd_wallet::transaction::{RawTransaction, TransactionRecord};
use hd_wallet::utxo::Utxo;
use hd_wallet::Chain;
use tracing::{debug, info, warn};

use super::{HdWallet, WalletState};
use crate::cancel::CancellationFlag;
use crate::discovery;
use crate::error::Result;
use crate::indexer::require_all;

impl HdWallet {
    /// Refresh per-address balances, running gap-limit discovery first for a
    /// wallet that has never been synced.
    pub async fn fetch_balance(&mut self) -> Result<()> {
        self.fetch_balance_cancellable(&CancellationFlag::new()).await
    }

    pub async fn fetch_balance_cancellable(&mut self, cancel: &CancellationFlag) -> Result<()> {
        let mut work = self.state.clone();
        let result = self.refresh_balances(&mut work, cancel).await;
        work.last_balance_fetch = Some(chrono::Utc::now().timestamp());
        self.commit("balance", work, result)
    }

    /// Refresh the transaction history of every address that may have changed.
    pub async fn fetch_transactions(&mut self) -> Result<()> {
        self.fetch_transactions_cancellable(&CancellationFlag::new()).await
    }

    pub async fn fetch_transactions_cancellable(&mut self, cancel: &CancellationFlag) -> Result<()> {
        let mut work = self.state.clone();
        let result = self.refresh_transactions(&mut work, cancel).await;
        work.last_transactions_fetch = Some(chrono::Utc::now().timestamp());
        self.commit("transaction", work, result)
    }

    /// Refresh unspent outputs of every address with a confirmed balance.
    pub async fn fetch_utxo(&mut self) -> Result<()> {
        self.fetch_utxo_cancellable(&CancellationFlag::new()).await
    }

    pub async fn fetch_utxo_cancellable(&mut self, cancel: &CancellationFlag) -> Result<()> {
        let mut work = self.state.clone();
        let result = self.refresh_utxos(&mut work, cancel).await;
        self.commit("utxo", work, result)
    }

    fn commit(&mut self, what: &str, work: WalletState, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                self.state = work;
                Ok(())
            }
            Err(err) => {
                warn!("{} refresh of {} wallet failed, keeping cached state: {}", what, self.keys.kind(), err);
                Err(err)
            }
        }
    }

    /// Index ranges a refresh covers: the single address of an imported key,
    /// otherwise everything up to `gap_limit` past each cursor.
    fn scan_ranges(&self, state: &WalletState) -> Vec<(Chain, Range<u32>)> {
        if self.keys.is_single_address() {
            return vec![(Chain::External, 0..1)];
        }
        Chain::BOTH
            .into_iter()
            .map(|chain| (chain, 0..state.cursor(chain).saturating_add(self.config.gap_limit)))
            .collect()
    }

    async fn refresh_balances(&self, work: &mut WalletState, cancel: &CancellationFlag) -> Result<()> {
        let indexer = self.indexer.as_ref();

        if !self.keys.is_single_address() {
            if !work.discovered && work.next_free_index == 0 && work.next_free_change_index == 0 {
                for chain in Chain::BOTH {
                    let next = discovery::discover_next_free_index(
                        indexer,
                        &self.keys,
                        &mut work.addresses,
                        chain,
                        &self.config,
                        cancel,
                    )
                    .await?;
                    work.advance_cursor(chain, next);
                }
            } else {
                for chain in Chain::BOTH {
                    let cursor = work.cursor(chain);
                    let cursor = discovery::advance_lagging_cursor(
                        indexer,
                        &self.keys,
                        &mut work.addresses,
                        chain,
                        cursor,
                        &self.config,
                        cancel,
                    )
                    .await?;
                    work.advance_cursor(chain, cursor);
                }
            }
            work.discovered = true;
        }

        for (chain, range) in self.scan_ranges(work) {
            cancel.check()?;
            let addresses = work.addresses.ensure_range(&self.keys, chain, range)?;
            let query: Vec<String> = addresses.iter().map(|(_, a)| a.clone()).collect();
            let balances = indexer.multi_get_balance_by_address(&query).await?;
            let mut changed = 0;
            for ((index, _), (_, entry)) in addresses.iter().zip(require_all(&balances, &query)?) {
                if work.ledger.apply_balance(chain, *index, *entry) {
                    changed += 1;
                }
            }
            debug!("{:?}: {} balances fetched, {} changed", chain, query.len(), changed);
        }
        info!(
            "{} wallet balance {} sat ({} unconfirmed)",
            self.keys.kind(),
            work.ledger.total_balance(),
            work.ledger.unconfirmed_balance()
        );
        Ok(())
    }

    async fn refresh_transactions(&self, work: &mut WalletState, cancel: &CancellationFlag) -> Result<()> {
        let indexer = self.indexer.as_ref();

        let mut targets: Vec<(Chain, u32, String)> = Vec::new();
        for (chain, range) in self.scan_ranges(work) {
            for (index, address) in work.addresses.ensure_range(&self.keys, chain, range)? {
                if work.ledger.needs_transaction_refresh(chain, index, self.config.refetch_confirmations) {
                    targets.push((chain, index, address));
                }
            }
        }
        if targets.is_empty() {
            return Ok(());
        }

        cancel.check()?;
        let query: Vec<String> = targets.iter().map(|(_, _, a)| a.clone()).collect();
        let history = indexer.multi_get_history_by_address(&query).await?;

        let mut seen = HashSet::new();
        let txids: Vec<Txid> =
            history.values().flatten().map(|item| item.txid).filter(|txid| seen.insert(*txid)).collect();

        cancel.check()?;
        let bodies = if txids.is_empty() {
            HashMap::new()
        } else {
            indexer.multi_get_transaction_by_txid(&txids).await?
        };
        require_all(&bodies, &txids)?;

        // previous transactions give each input its address and value
        let mut seen = HashSet::new();
        let parent_ids: Vec<Txid> = bodies
            .values()
            .flat_map(|tx| tx.vin.iter().map(|input| input.txid))
            .filter(|txid| !bodies.contains_key(txid) && seen.insert(*txid))
            .collect();
        cancel.check()?;
        let mut parents: HashMap<Txid, RawTransaction> = if parent_ids.is_empty() {
            HashMap::new()
        } else {
            indexer.multi_get_transaction_by_txid(&parent_ids).await?
        };
        parents.extend(bodies.iter().map(|(txid, tx)| (*txid, tx.clone())));

        let records: HashMap<Txid, TransactionRecord> =
            bodies.iter().map(|(txid, raw)| (*txid, TransactionRecord::resolve(raw, &parents))).collect();

        for (chain, index, address) in &targets {
            work.ledger.purge_unconfirmed(*chain, *index..*index + 1);
            work.ledger.ensure_index(*chain, *index);
            let listed: Vec<TransactionRecord> = history
                .get(address)
                .into_iter()
                .flatten()
                .filter_map(|item| records.get(&item.txid).cloned())
                .collect();
            work.ledger.reconcile(*chain, &[(*index, address.clone())], &listed);
        }
        info!("{} wallet: {} addresses refreshed, {} transactions", self.keys.kind(), targets.len(), records.len());
        Ok(())
    }

    async fn refresh_utxos(&self, work: &mut WalletState, cancel: &CancellationFlag) -> Result<()> {
        let mut owners: Vec<(Chain, u32, String)> = Vec::new();
        for chain in Chain::BOTH {
            for index in work.ledger.funded_indices(chain) {
                let address = work.addresses.get_or_derive(&self.keys, chain, index)?;
                owners.push((chain, index, address));
            }
        }

        cancel.check()?;
        let query: Vec<String> = owners.iter().map(|(_, _, a)| a.clone()).collect();
        let unspent = if query.is_empty() {
            HashMap::new()
        } else {
            self.indexer.multi_get_utxo_by_address(&query).await?
        };

        let mut utxos = Vec::new();
        for (chain, index, address) in &owners {
            let known: HashMap<Txid, u32> = work
                .ledger
                .cached_transactions(*chain, *index)
                .iter()
                .map(|tx| (tx.txid, tx.confirmations))
                .collect();
            for output in unspent.get(address).into_iter().flatten() {
                let confirmations = known
                    .get(&output.txid)
                    .copied()
                    .unwrap_or(u32::from(output.height.is_some_and(|h| h > 0)));
                let mut utxo = Utxo::new(output.txid, output.vout, output.value, address.clone())
                    .with_key(self.keys.key_ref(*chain, *index), self.path_of(*chain, *index))
                    .with_confirmations(confirmations);
                utxo.height = output.height;
                utxos.push(utxo);
            }
        }
        // pre-segwit inputs carry their parent transaction in a PSBT
        if !self.keys.is_segwit() && !utxos.is_empty() {
            let mut seen = HashSet::new();
            let txids: Vec<Txid> = utxos.iter().map(|u| u.txid).filter(|txid| seen.insert(*txid)).collect();
            cancel.check()?;
            let bodies = self.indexer.multi_get_transaction_by_txid(&txids).await?;
            for utxo in &mut utxos {
                utxo.prev_tx = bodies.get(&utxo.txid).and_then(RawTransaction::transaction);
            }
        }
        debug!("{} unspent outputs across {} funded addresses", utxos.len(), owners.len());
        work.utxos.replace(utxos);
        Ok(())
    }
}
