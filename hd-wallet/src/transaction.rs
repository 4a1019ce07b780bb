//! Transaction records
//!
//! Indexers return transactions without input provenance: an input only names the
//! outpoint it spends. [`TransactionRecord::resolve`] fills in the source address
//! and value of each input from the previous transactions, which lets the wallet
//! compute its net value per transaction.

use std::collections::HashMap;

use bitcoin::consensus::deserialize;
use bitcoin::{ScriptBuf, Transaction, Txid};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One entry of an address history.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HistoryItem {
    pub txid: Txid,
    /// Block height, 0 or negative while in the mempool
    pub height: i32,
}

/// Input of a transaction as the indexer reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RawInput {
    /// Transaction being spent
    pub txid: Txid,
    /// Output index being spent
    pub vout: u32,
    pub sequence: u32,
}

/// Output of a transaction as the indexer reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RawOutput {
    pub n: u32,
    /// Value in satoshis
    pub value: u64,
    /// Address the script pays to, if it has a standard form
    pub address: Option<String>,
    pub script_pubkey: ScriptBuf,
}

/// A transaction body returned by the indexer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RawTransaction {
    pub txid: Txid,
    pub vin: Vec<RawInput>,
    pub vout: Vec<RawOutput>,
    pub confirmations: Option<u32>,
    /// Block time, unix seconds
    pub blocktime: Option<i64>,
    /// Virtual size in vbytes
    pub vsize: Option<u64>,
    /// Serialized transaction, when the indexer returns it
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub hex: Option<String>,
}

impl RawTransaction {
    /// Output `n`, looked up by its index field.
    pub fn output(&self, n: u32) -> Option<&RawOutput> {
        self.vout.iter().find(|o| o.n == n)
    }

    /// Decode the serialized body. `None` if it is missing, malformed or hashes
    /// to a different txid.
    pub fn transaction(&self) -> Option<Transaction> {
        let bytes = hex::decode(self.hex.as_deref()?).ok()?;
        let tx: Transaction = deserialize(&bytes).ok()?;
        (tx.compute_txid() == self.txid).then_some(tx)
    }
}

/// Transaction input with its provenance when known.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InputRecord {
    pub txid: Txid,
    pub vout: u32,
    pub sequence: u32,
    /// Address of the spent output, `None` if the parent was not fetched
    pub address: Option<String>,
    /// Value of the spent output, `None` if the parent was not fetched
    pub value: Option<u64>,
}

/// A transaction touching the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TransactionRecord {
    pub txid: Txid,
    /// 0 while unconfirmed
    pub confirmations: u32,
    pub blocktime: Option<i64>,
    /// Unix seconds. Filled in when the record is exposed.
    pub received: i64,
    /// Net effect on the wallet in satoshis. Filled in when the record is exposed.
    pub value: i64,
    pub inputs: Vec<InputRecord>,
    pub outputs: Vec<RawOutput>,
}

impl TransactionRecord {
    /// Build a record from an indexer body, resolving inputs against `parents`.
    pub fn resolve(raw: &RawTransaction, parents: &HashMap<Txid, RawTransaction>) -> Self {
        let inputs = raw
            .vin
            .iter()
            .map(|input| {
                let spent = parents.get(&input.txid).and_then(|parent| parent.output(input.vout));
                InputRecord {
                    txid: input.txid,
                    vout: input.vout,
                    sequence: input.sequence,
                    address: spent.and_then(|o| o.address.clone()),
                    value: spent.map(|o| o.value),
                }
            })
            .collect();
        Self {
            txid: raw.txid,
            confirmations: raw.confirmations.unwrap_or(0),
            blocktime: raw.blocktime,
            received: raw.blocktime.unwrap_or(0),
            value: 0,
            inputs,
            outputs: raw.vout.clone(),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmations > 0
    }

    /// Whether any input or output involves `address`.
    pub fn touches(&self, address: &str) -> bool {
        use crate::address_cache::addresses_equal;
        self.inputs.iter().any(|i| i.address.as_deref().is_some_and(|a| addresses_equal(a, address)))
            || self
                .outputs
                .iter()
                .any(|o| o.address.as_deref().is_some_and(|a| addresses_equal(a, address)))
    }

    /// Net value: minus every owned input, plus every owned output. Unresolved
    /// inputs count as zero.
    pub fn net_value<F: Fn(&str) -> bool>(&self, owns: F) -> i64 {
        let spent: u64 = self
            .inputs
            .iter()
            .filter(|i| i.address.as_deref().is_some_and(&owns))
            .map(|i| i.value.unwrap_or(0))
            .sum();
        let received: u64 = self
            .outputs
            .iter()
            .filter(|o| o.address.as_deref().is_some_and(&owns))
            .map(|o| o.value)
            .sum();
        received as i64 - spent as i64
    }

    /// Received time: the block time, or `now - offset` while unconfirmed.
    pub fn received_at(&self, now: i64, unconfirmed_offset: i64) -> i64 {
        match self.blocktime {
            Some(time) if time > 0 => time,
            _ => now - unconfirmed_offset,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    pub(crate) fn txid(n: u8) -> Txid {
        Txid::from_byte_array([n; 32])
    }

    pub(crate) fn output(n: u32, value: u64, address: &str) -> RawOutput {
        RawOutput {
            n,
            value,
            address: Some(address.to_string()),
            script_pubkey: ScriptBuf::new(),
        }
    }

    pub(crate) fn raw_tx(id: u8, vin: Vec<(Txid, u32)>, vout: Vec<RawOutput>, confirmations: Option<u32>) -> RawTransaction {
        RawTransaction {
            txid: txid(id),
            vin: vin
                .into_iter()
                .map(|(txid, vout)| RawInput {
                    txid,
                    vout,
                    sequence: 0xffff_fffd,
                })
                .collect(),
            vout,
            confirmations,
            blocktime: confirmations.filter(|c| *c > 0).map(|_| 1_600_000_000 + id as i64),
            vsize: None,
            hex: None,
        }
    }

    #[test]
    fn test_resolve_inputs_and_net_value() {
        let parent = raw_tx(1, vec![], vec![output(0, 50_000, "mine"), output(1, 7_000, "theirs")], Some(10));
        let child = raw_tx(
            2,
            vec![(txid(1), 0), (txid(1), 1), (txid(9), 0)],
            vec![output(0, 30_000, "elsewhere"), output(1, 19_000, "mine-change")],
            None,
        );
        let parents = HashMap::from([(parent.txid, parent)]);
        let record = TransactionRecord::resolve(&child, &parents);

        assert_eq!(record.confirmations, 0);
        assert_eq!(record.inputs[0].address.as_deref(), Some("mine"));
        assert_eq!(record.inputs[1].value, Some(7_000));
        assert_eq!(record.inputs[2].address, None);

        let owns = |a: &str| a.starts_with("mine");
        assert_eq!(record.net_value(owns), 19_000 - 50_000);
        assert!(record.touches("mine-change"));
        assert!(!record.touches("nobody"));
    }

    #[test]
    fn test_received_time_fallback() {
        let confirmed = TransactionRecord::resolve(&raw_tx(3, vec![], vec![], Some(2)), &HashMap::new());
        assert_eq!(confirmed.received_at(2_000_000_000, 30), 1_600_000_003);
        let pending = TransactionRecord::resolve(&raw_tx(4, vec![], vec![], None), &HashMap::new());
        assert_eq!(pending.received_at(2_000_000_000, 30), 1_999_999_970);
    }
}
