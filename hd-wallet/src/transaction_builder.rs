//! Transaction assembly
//!
//! The builder runs coin selection over the given UTXOs, lays the result out as a
//! PSBT carrying the BIP32 origin of every owned input and change output, and
//! either signs and finalizes it or hands the unsigned PSBT back for an external
//! signer.
//!
//! Inputs keep the order coin selection picked them in and outputs are recipients
//! followed by change, unless BIP-69 ordering is requested.

use core::cmp::Ordering;
use core::fmt;
use core::str::FromStr;

use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::transaction::Version;
use bitcoin::{
    absolute, Address, Amount, CompressedPublicKey, Network, PrivateKey, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Witness,
};
use tracing::{debug, info};

use crate::coin_selection::{CoinSelector, OutputSpec, SelectionStrategy};
use crate::config::{DEFAULT_DUST_THRESHOLD, DEFAULT_RBF_SEQUENCE};
use crate::error::{Error, Result};
use crate::fee::{output_script_len, FeePolicy};
use crate::script_type::ScriptType;
use crate::signing;
use crate::utxo::{KeyRef, Utxo};

/// Public key material of an owned output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyInfo {
    pub script_type: ScriptType,
    pub pubkey: CompressedPublicKey,
    /// Master fingerprint and full path, when the key is part of an HD tree
    pub origin: Option<(Fingerprint, DerivationPath)>,
}

/// Resolves key references of a wallet into keys.
pub trait KeyProvider {
    /// Script type of the outputs this wallet spends.
    fn script_type(&self) -> ScriptType;

    fn public_key(&self, key: KeyRef) -> Result<PublicKeyInfo>;

    /// Fails with [`Error::NoSecret`] for watch-only wallets.
    fn private_key(&self, key: KeyRef) -> Result<PrivateKey>;
}

/// A payment. `value: None` on a single recipient sends everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub address: Address,
    pub value: Option<u64>,
}

impl Recipient {
    pub fn new(address: Address, value: u64) -> Self {
        Self {
            address,
            value: Some(value),
        }
    }

    /// Recipient of everything left after the fee.
    pub fn send_max(address: Address) -> Self {
        Self {
            address,
            value: None,
        }
    }
}

/// An output of a created transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedOutput {
    pub address: Address,
    pub value: u64,
    pub is_change: bool,
}

/// Result of [`TransactionBuilder::build`].
#[derive(Debug, Clone)]
pub struct CreatedTransaction {
    /// Finalized transaction, `None` when signing was skipped
    pub tx: Option<Transaction>,
    /// The PSBT, signed and finalized unless signing was skipped
    pub psbt: Psbt,
    pub inputs: Vec<Utxo>,
    pub outputs: Vec<CreatedOutput>,
    pub fee: u64,
    /// Real virtual size when signed, the estimate otherwise
    pub vsize: usize,
}

impl CreatedTransaction {
    /// Fee rate in sat/vB, rounded down.
    pub fn fee_rate(&self) -> u64 {
        if self.vsize == 0 {
            return 0;
        }
        self.fee / self.vsize as u64
    }

    /// Raw transaction hex of the signed transaction.
    pub fn to_hex(&self) -> Option<String> {
        self.tx.as_ref().map(bitcoin::consensus::encode::serialize_hex)
    }

    pub fn change(&self) -> Option<&CreatedOutput> {
        self.outputs.iter().find(|o| o.is_change)
    }
}

/// Coin selection laid out as an unsigned PSBT.
pub(crate) struct Layout {
    pub psbt: Psbt,
    pub inputs: Vec<Utxo>,
    pub outputs: Vec<CreatedOutput>,
    pub fee: u64,
    pub estimated_size: usize,
}

/// Transaction builder
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    network: Network,
    recipients: Vec<Recipient>,
    change: Option<(Address, Option<KeyRef>)>,
    fee: FeePolicy,
    sequence: u32,
    strategy: SelectionStrategy,
    dust_threshold: u64,
    bip69: bool,
    skip_signing: bool,
    master_fingerprint: Option<Fingerprint>,
}

impl TransactionBuilder {
    /// Create a new transaction builder
    pub fn new(network: Network, fee: FeePolicy) -> Self {
        Self {
            network,
            recipients: Vec::new(),
            change: None,
            fee,
            sequence: DEFAULT_RBF_SEQUENCE,
            strategy: SelectionStrategy::default(),
            dust_threshold: DEFAULT_DUST_THRESHOLD,
            bip69: false,
            skip_signing: false,
            master_fingerprint: None,
        }
    }

    pub fn add_recipient(mut self, recipient: Recipient) -> Self {
        self.recipients.push(recipient);
        self
    }

    pub fn add_recipients(mut self, recipients: impl IntoIterator<Item = Recipient>) -> Self {
        self.recipients.extend(recipients);
        self
    }

    /// Where excess value goes. `key` lets the PSBT carry the change origin.
    pub fn set_change_address(mut self, address: Address, key: Option<KeyRef>) -> Self {
        self.change = Some((address, key));
        self
    }

    /// Input sequence. Defaults to an RBF-enabling value.
    pub fn set_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn set_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn set_dust_threshold(mut self, threshold: u64) -> Self {
        self.dust_threshold = threshold;
        self
    }

    /// Sort inputs and outputs lexicographically (BIP-69).
    pub fn set_bip69(mut self, enabled: bool) -> Self {
        self.bip69 = enabled;
        self
    }

    /// Return the unsigned PSBT instead of signing.
    pub fn skip_signing(mut self, skip: bool) -> Self {
        self.skip_signing = skip;
        self
    }

    /// Fingerprint written into BIP32 origins, overriding what the key provider knows.
    pub fn set_master_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.master_fingerprint = Some(fingerprint);
        self
    }

    pub(crate) fn origin_fingerprint(&self, known: Option<Fingerprint>) -> Fingerprint {
        // zero when the root is unknown, e.g. for an imported account xpub
        self.master_fingerprint.or(known).unwrap_or_else(|| Fingerprint::from([0u8; 4]))
    }

    /// Run coin selection for inputs carrying `script_len` bytes of script data
    /// and lay the result out as an unsigned PSBT.
    pub(crate) fn layout(&self, utxos: &[Utxo], script_len: usize) -> Result<Layout> {
        if self.recipients.is_empty() {
            return Err(Error::MissingData("no destination provided".into()));
        }
        let specs: Vec<OutputSpec> = self
            .recipients
            .iter()
            .map(|r| OutputSpec::new(r.value, output_script_len(&r.address.script_pubkey())))
            .collect();
        let selection = CoinSelector::new(self.strategy)
            .with_dust_threshold(self.dust_threshold)
            .select(utxos, |_| script_len, &specs, self.fee)?;

        let mut outputs: Vec<CreatedOutput> = self
            .recipients
            .iter()
            .zip(&selection.output_values)
            .map(|(r, value)| CreatedOutput {
                address: r.address.clone(),
                value: *value,
                is_change: false,
            })
            .collect();
        if let Some(change) = selection.change {
            let (address, _) = self.change.as_ref().ok_or(Error::ChangeAddressRequired)?;
            outputs.push(CreatedOutput {
                address: address.clone(),
                value: change,
                is_change: true,
            });
        }

        let mut inputs = selection.selected;
        if self.bip69 {
            sort_inputs_bip69(&mut inputs);
            sort_outputs_bip69(&mut outputs);
        }
        debug!(
            "assembling transaction: {} inputs, {} outputs, fee {} sat",
            inputs.len(),
            outputs.len(),
            selection.fee
        );

        let psbt = Psbt::from_unsigned_tx(unsigned_transaction(
            inputs.iter().map(|u| (u.outpoint(), self.sequence)),
            outputs.iter().map(|o| txout(&o.address.script_pubkey(), o.value)),
        ))?;
        Ok(Layout {
            psbt,
            inputs,
            outputs,
            fee: selection.fee,
            estimated_size: selection.estimated_size,
        })
    }

    pub(crate) fn network(&self) -> Network {
        self.network
    }

    pub(crate) fn change_key(&self) -> Option<KeyRef> {
        self.change.as_ref().and_then(|(_, key)| *key)
    }

    pub(crate) fn signing_skipped(&self) -> bool {
        self.skip_signing
    }

    /// Select coins from `utxos`, assemble, and sign unless signing is skipped.
    pub fn build(&self, utxos: &[Utxo], keys: &dyn KeyProvider) -> Result<CreatedTransaction> {
        let Layout {
            mut psbt,
            inputs,
            outputs,
            fee,
            estimated_size,
        } = self.layout(utxos, keys.script_type().input_script_len())?;

        let mut input_keys = Vec::with_capacity(inputs.len());
        for (index, utxo) in inputs.iter().enumerate() {
            let info = utxo.key.map(|k| keys.public_key(k)).transpose()?;
            if info.is_none() && !self.skip_signing {
                return Err(Error::SigningKeyNotFound(format!("{}:{}", utxo.txid, utxo.vout)));
            }
            let script_pubkey = Address::from_str(&utxo.address)?.require_network(self.network)?.script_pubkey();
            self.describe_input(&mut psbt.inputs[index], utxo, script_pubkey, info.as_ref())?;
            input_keys.push(info);
        }

        if let Some(key) = self.change_key() {
            if let Some(position) = outputs.iter().position(|o| o.is_change) {
                if let Ok(info) = keys.public_key(key) {
                    if let Some((fingerprint, path)) = info.origin {
                        psbt.outputs[position]
                            .bip32_derivation
                            .insert(info.pubkey.0, (self.origin_fingerprint(Some(fingerprint)), path));
                    }
                }
            }
        }

        if self.skip_signing {
            return Ok(CreatedTransaction {
                tx: None,
                psbt,
                inputs,
                outputs,
                fee,
                vsize: estimated_size,
            });
        }

        let secp = Secp256k1::new();
        for (index, (utxo, info)) in inputs.iter().zip(&input_keys).enumerate() {
            let (Some(key_ref), Some(info)) = (utxo.key, info) else {
                return Err(Error::SigningKeyNotFound(format!("{}:{}", utxo.txid, utxo.vout)));
            };
            let key = keys.private_key(key_ref)?;
            signing::sign_single_sig_input(&mut psbt, index, info.script_type, &key, &secp)?;
            signing::finalize_single_sig_input(&mut psbt, index, info.script_type)?;
        }
        let tx = psbt.clone().extract_tx_unchecked_fee_rate();
        let vsize = tx.vsize();
        info!("signed transaction {} ({} vB, fee {} sat)", tx.compute_txid(), vsize, fee);

        Ok(CreatedTransaction {
            tx: Some(tx),
            psbt,
            inputs,
            outputs,
            fee,
            vsize,
        })
    }

    fn describe_input(
        &self,
        input: &mut bitcoin::psbt::Input,
        utxo: &Utxo,
        script_pubkey: ScriptBuf,
        info: Option<&PublicKeyInfo>,
    ) -> Result<()> {
        let segwit = info.map(|i| i.script_type.is_segwit()).unwrap_or_else(|| !script_pubkey.is_p2pkh());
        if segwit {
            input.witness_utxo = Some(TxOut {
                value: Amount::from_sat(utxo.value),
                script_pubkey,
            });
        } else {
            attach_prev_tx(input, utxo, self.skip_signing)?;
        }
        let Some(info) = info else {
            return Ok(());
        };
        input.redeem_script = info.script_type.redeem_script(&info.pubkey);
        if let Some((fingerprint, path)) = &info.origin {
            input.bip32_derivation.insert(info.pubkey.0, (self.origin_fingerprint(Some(*fingerprint)), path.clone()));
        }
        Ok(())
    }
}

/// Put the transaction that created `utxo` on a pre-segwit input. An external
/// signer cannot verify the amount without it, so it is `required` whenever the
/// PSBT leaves this wallet unsigned.
pub(crate) fn attach_prev_tx(input: &mut bitcoin::psbt::Input, utxo: &Utxo, required: bool) -> Result<()> {
    match &utxo.prev_tx {
        Some(prev) if prev.compute_txid() == utxo.txid => {
            input.non_witness_utxo = Some(prev.clone());
            Ok(())
        }
        Some(prev) => Err(Error::Protocol(format!(
            "previous transaction {} does not create {}:{}",
            prev.compute_txid(),
            utxo.txid,
            utxo.vout
        ))),
        None if required => {
            Err(Error::MissingData(format!("previous transaction of {}:{} is needed for an unsigned input", utxo.txid, utxo.vout)))
        }
        None => Ok(()),
    }
}

impl fmt::Display for TransactionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionBuilder({} recipients, {:?}, sequence {:#x})", self.recipients.len(), self.fee, self.sequence)
    }
}

pub(crate) fn txout(script_pubkey: &bitcoin::Script, value: u64) -> TxOut {
    TxOut {
        value: Amount::from_sat(value),
        script_pubkey: script_pubkey.to_owned(),
    }
}

/// Version 2 transaction with empty scripts.
pub(crate) fn unsigned_transaction(
    inputs: impl IntoIterator<Item = (bitcoin::OutPoint, u32)>,
    outputs: impl IntoIterator<Item = TxOut>,
) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: inputs
            .into_iter()
            .map(|(previous_output, sequence)| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence(sequence),
                witness: Witness::new(),
            })
            .collect(),
        output: outputs.into_iter().collect(),
    }
}

/// BIP-69: previous txid in reversed byte order, then output index.
pub fn sort_inputs_bip69(inputs: &mut [Utxo]) {
    inputs.sort_by(|a, b| {
        let mut hash_a = a.txid.to_byte_array();
        let mut hash_b = b.txid.to_byte_array();
        hash_a.reverse();
        hash_b.reverse();
        match hash_a.cmp(&hash_b) {
            Ordering::Equal => a.vout.cmp(&b.vout),
            other => other,
        }
    })
}

/// BIP-69: amount, then script pubkey bytes.
pub fn sort_outputs_bip69(outputs: &mut [CreatedOutput]) {
    outputs.sort_by(|a, b| match a.value.cmp(&b.value) {
        Ordering::Equal => a.address.script_pubkey().as_bytes().cmp(b.address.script_pubkey().as_bytes()),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivation::{Chain, HdKeyChain};
    use crate::fee::FeeRate;
    use crate::transaction::tests::txid;

    const MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    struct TestKeys(HdKeyChain);

    impl KeyProvider for TestKeys {
        fn script_type(&self) -> ScriptType {
            self.0.script_type()
        }

        fn public_key(&self, key: KeyRef) -> Result<PublicKeyInfo> {
            let KeyRef::Derived {
                chain,
                index,
            } = key
            else {
                return Err(Error::SigningKeyNotFound("imported".into()));
            };
            Ok(PublicKeyInfo {
                script_type: self.0.script_type(),
                pubkey: self.0.derive_public_key(chain, index)?,
                origin: Some((self.0.master_fingerprint().unwrap_or(Fingerprint::from([0u8; 4])), self.0.full_path(chain, index)?)),
            })
        }

        fn private_key(&self, key: KeyRef) -> Result<PrivateKey> {
            match key {
                KeyRef::Derived {
                    chain,
                    index,
                } => self.0.derive_private_key(chain, index),
                KeyRef::Imported => Err(Error::NoSecret),
            }
        }
    }

    fn keys() -> TestKeys {
        TestKeys(HdKeyChain::from_mnemonic(MNEMONIC, "", ScriptType::P2wpkh, Network::Bitcoin).unwrap())
    }

    fn utxo(keys: &TestKeys, id: u8, index: u32, value: u64) -> Utxo {
        let address = keys.0.derive_address(Chain::External, index).unwrap().to_string();
        Utxo::new(txid(id), 0, value, address)
            .with_key(
                KeyRef::Derived {
                    chain: Chain::External,
                    index,
                },
                None,
            )
            .with_confirmations(3)
    }

    fn destination() -> Address {
        Address::from_str("1GX36PGBUrF8XahZEGQqHqnJGW2vCZteoB").unwrap().assume_checked()
    }

    fn change(keys: &TestKeys) -> Address {
        keys.0.derive_address(Chain::Internal, 0).unwrap()
    }

    #[test]
    fn test_build_and_sign_with_change() {
        let keys = keys();
        let utxos = vec![utxo(&keys, 1, 0, 70_000), utxo(&keys, 2, 1, 40_000)];
        let created = TransactionBuilder::new(Network::Bitcoin, FeeRate::from_sat_per_vb(5).into())
            .add_recipient(Recipient::new(destination(), 50_000))
            .set_change_address(
                change(&keys),
                Some(KeyRef::Derived {
                    chain: Chain::Internal,
                    index: 0,
                }),
            )
            .build(&utxos, &keys)
            .unwrap();

        let tx = created.tx.as_ref().unwrap();
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].sequence, Sequence(DEFAULT_RBF_SEQUENCE));
        assert_eq!(tx.output.len(), 2);
        assert!(tx.input[0].witness.len() == 2);
        let change = created.change().unwrap();
        assert_eq!(change.value + 50_000 + created.fee, 70_000);
        assert_eq!(created.psbt.outputs[1].bip32_derivation.len(), 1);
        assert!(created.fee_rate() >= 4);
    }

    #[test]
    fn test_skip_signing_returns_psbt_with_origins() {
        let keys = keys();
        let utxos = vec![utxo(&keys, 1, 3, 100_000)];
        let created = TransactionBuilder::new(Network::Bitcoin, FeeRate::from_sat_per_vb(2).into())
            .add_recipient(Recipient::send_max(destination()))
            .skip_signing(true)
            .build(&utxos, &keys)
            .unwrap();

        assert!(created.tx.is_none());
        let input = &created.psbt.inputs[0];
        assert!(input.witness_utxo.is_some());
        let (fingerprint, path) = input.bip32_derivation.values().next().unwrap();
        assert_eq!(fingerprint.to_string(), "73c5da0a");
        assert_eq!(*path, "m/84'/0'/0'/0/3".parse::<DerivationPath>().unwrap());
        assert_eq!(created.outputs[0].value + created.fee, 100_000);
    }

    #[test]
    fn test_legacy_inputs_carry_the_previous_transaction() {
        let keys = TestKeys(HdKeyChain::from_mnemonic(MNEMONIC, "", ScriptType::P2pkh, Network::Bitcoin).unwrap());
        let address = keys.0.derive_address(Chain::External, 0).unwrap();
        let funding = unsigned_transaction(
            [(bitcoin::OutPoint::new(txid(40), 1), 0xffff_ffff)],
            [txout(&destination().script_pubkey(), 5_000), txout(&address.script_pubkey(), 100_000)],
        );
        let key = KeyRef::Derived {
            chain: Chain::External,
            index: 0,
        };
        let bare = Utxo::new(funding.compute_txid(), 1, 100_000, address.to_string()).with_key(key, None);
        let builder = TransactionBuilder::new(Network::Bitcoin, FeePolicy::Absolute(10_000))
            .add_recipient(Recipient::send_max(destination()))
            .skip_signing(true);

        let created = builder.build(&[bare.clone().with_prev_tx(funding.clone())], &keys).unwrap();
        let input = &created.psbt.inputs[0];
        assert!(input.witness_utxo.is_none());
        let prev = input.non_witness_utxo.as_ref().unwrap();
        assert_eq!(prev.compute_txid(), created.psbt.unsigned_tx.input[0].previous_output.txid);
        assert_eq!(prev.output[1].value.to_sat(), 100_000);
        assert_eq!(input.bip32_derivation.len(), 1);

        assert!(matches!(builder.build(&[bare.clone()], &keys), Err(Error::MissingData(_))));
        let other = unsigned_transaction([(bitcoin::OutPoint::new(txid(41), 0), 0)], [txout(&address.script_pubkey(), 1)]);
        assert!(matches!(builder.build(&[bare.clone().with_prev_tx(other)], &keys), Err(Error::Protocol(_))));

        // signing locally does not need it
        let signed = builder.clone().skip_signing(false).build(&[bare], &keys).unwrap();
        assert!(signed.tx.is_some());
    }

    #[test]
    fn test_change_address_required() {
        let keys = keys();
        let utxos = vec![utxo(&keys, 1, 0, 100_000)];
        let result = TransactionBuilder::new(Network::Bitcoin, FeeRate::from_sat_per_vb(1).into())
            .add_recipient(Recipient::new(destination(), 10_000))
            .build(&utxos, &keys);
        assert!(matches!(result, Err(Error::ChangeAddressRequired)));
    }

    #[test]
    fn test_unresolved_key_blocks_signing() {
        let keys = keys();
        let mut unsignable = utxo(&keys, 1, 0, 100_000);
        unsignable.key = None;
        let result = TransactionBuilder::new(Network::Bitcoin, FeeRate::from_sat_per_vb(1).into())
            .add_recipient(Recipient::send_max(destination()))
            .build(&[unsignable], &keys);
        assert!(matches!(result, Err(Error::SigningKeyNotFound(_))));
    }

    #[test]
    fn test_bip69_ordering() {
        let keys = keys();
        let utxos = vec![utxo(&keys, 9, 0, 30_000), utxo(&keys, 3, 1, 30_000)];
        let created = TransactionBuilder::new(Network::Bitcoin, FeeRate::from_sat_per_vb(1).into())
            .add_recipient(Recipient::new(destination(), 55_000))
            .set_change_address(change(&keys), None)
            .set_bip69(true)
            .build(&utxos, &keys)
            .unwrap();
        assert_eq!(created.inputs[0].txid, txid(3));
        assert!(created.outputs[0].value <= created.outputs[1].value);
    }
}
