//! UTXO tracking
//!
//! The spendable set is rebuilt on every fetch cycle from the indexer's unspent
//! lists. User metadata (frozen flag, memo) is kept separately, keyed by
//! `"txid:vout"`, so it survives rebuilds.

use std::collections::{BTreeMap, HashSet};

use bitcoin::bip32::DerivationPath;
use bitcoin::{OutPoint, Transaction, Txid};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::derivation::Chain;
use crate::transaction::TransactionRecord;

/// An unspent output as the indexer reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UnspentOutput {
    pub txid: Txid,
    pub vout: u32,
    pub value: u64,
    /// Confirmation height, `None` or 0 while unconfirmed
    pub height: Option<u32>,
}

/// How the key for an output can be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum KeyRef {
    /// HD key at `chain/index` below the account
    Derived {
        chain: Chain,
        index: u32,
    },
    /// The wallet's single imported key
    Imported,
}

/// Unspent transaction output owned by the wallet
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    /// Value in satoshis
    pub value: u64,
    /// Address the output pays to
    pub address: String,
    /// Full derivation path, when known
    pub path: Option<DerivationPath>,
    /// Where the signing key comes from. `None` means the output can be shown but not spent.
    pub key: Option<KeyRef>,
    pub height: Option<u32>,
    pub confirmations: u32,
    /// Transaction that created the output. Pre-segwit inputs need it in a PSBT.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub prev_tx: Option<Transaction>,
}

impl Utxo {
    /// Create a UTXO with no key provenance
    pub fn new(txid: Txid, vout: u32, value: u64, address: impl Into<String>) -> Self {
        Self {
            txid,
            vout,
            value,
            address: address.into(),
            path: None,
            key: None,
            height: None,
            confirmations: 0,
            prev_tx: None,
        }
    }

    pub fn with_key(mut self, key: KeyRef, path: Option<DerivationPath>) -> Self {
        self.key = Some(key);
        self.path = path;
        self
    }

    pub fn with_confirmations(mut self, confirmations: u32) -> Self {
        self.confirmations = confirmations;
        self
    }

    pub fn with_prev_tx(mut self, tx: Transaction) -> Self {
        self.prev_tx = Some(tx);
        self
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmations > 0
    }

    /// Whether a signing key reference was resolved.
    pub fn is_signable(&self) -> bool {
        self.key.is_some()
    }
}

/// Metadata key of an outpoint, `"txid:vout"`.
pub fn outpoint_key(txid: &Txid, vout: u32) -> String {
    format!("{}:{}", txid, vout)
}

/// User-assigned metadata of an output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UtxoMetadata {
    /// Frozen outputs are left out of coin selection
    pub frozen: bool,
    pub memo: Option<String>,
}

/// UTXO set management
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UtxoSet {
    utxos: Vec<Utxo>,
    metadata: BTreeMap<String, UtxoMetadata>,
}

impl UtxoSet {
    /// Create a new empty UTXO set
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the outputs with a freshly fetched list. Metadata is kept.
    pub fn replace(&mut self, mut utxos: Vec<Utxo>) {
        let mut seen = HashSet::new();
        utxos.retain(|u| seen.insert(u.outpoint()));
        // deterministic order keeps built transactions stable
        utxos.sort_by(|a, b| a.value.cmp(&b.value).then_with(|| a.outpoint().cmp(&b.outpoint())));
        self.utxos = utxos;
    }

    /// Add a UTXO to the set
    pub fn add(&mut self, utxo: Utxo) {
        if !self.contains(&utxo.outpoint()) {
            self.utxos.push(utxo);
        }
    }

    /// Remove a UTXO from the set
    pub fn remove(&mut self, outpoint: &OutPoint) -> Option<Utxo> {
        let position = self.utxos.iter().position(|u| u.outpoint() == *outpoint)?;
        Some(self.utxos.remove(position))
    }

    /// Get a UTXO by outpoint
    pub fn get(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.utxos.iter().find(|u| u.outpoint() == *outpoint)
    }

    /// Check if a UTXO exists
    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.get(outpoint).is_some()
    }

    /// Get all UTXOs, frozen ones included
    pub fn all(&self) -> &[Utxo] {
        &self.utxos
    }

    /// UTXOs available to coin selection. Frozen outputs are included only on request.
    pub fn spendable(&self, include_frozen: bool) -> Vec<Utxo> {
        self.utxos.iter().filter(|u| include_frozen || !self.is_frozen(&u.txid, u.vout)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    /// Sum of all output values
    pub fn total_value(&self) -> u64 {
        self.utxos.iter().map(|u| u.value).sum()
    }

    pub fn metadata(&self, txid: &Txid, vout: u32) -> UtxoMetadata {
        self.metadata.get(&outpoint_key(txid, vout)).cloned().unwrap_or_default()
    }

    pub fn set_frozen(&mut self, txid: &Txid, vout: u32, frozen: bool) {
        self.metadata.entry(outpoint_key(txid, vout)).or_default().frozen = frozen;
    }

    pub fn is_frozen(&self, txid: &Txid, vout: u32) -> bool {
        self.metadata.get(&outpoint_key(txid, vout)).is_some_and(|m| m.frozen)
    }

    pub fn set_memo(&mut self, txid: &Txid, vout: u32, memo: Option<String>) {
        self.metadata.entry(outpoint_key(txid, vout)).or_default().memo = memo;
    }
}

/// Reconstruct unspent outputs from cached transactions: every owned output that
/// no cached transaction spends. Used when no unspent list has been fetched yet.
pub fn derive_from_transactions<F: Fn(&str) -> bool>(transactions: &[TransactionRecord], owns: F) -> Vec<Utxo> {
    let spent: HashSet<OutPoint> =
        transactions.iter().flat_map(|tx| tx.inputs.iter().map(|i| OutPoint::new(i.txid, i.vout))).collect();
    transactions
        .iter()
        .flat_map(|tx| {
            tx.outputs.iter().filter_map(move |output| {
                let address = output.address.as_deref()?;
                Some(
                    Utxo::new(tx.txid, output.n, output.value, address)
                        .with_confirmations(tx.confirmations),
                )
            })
        })
        .filter(|u| owns(&u.address) && !spent.contains(&u.outpoint()))
        .collect()
}
