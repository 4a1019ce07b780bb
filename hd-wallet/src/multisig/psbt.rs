//! Multisig PSBT flows
//!
//! Building a multisig spend produces a PSBT describing every input's script and
//! the BIP32 origin of every cosigner key. Local cosigners sign right away; the
//! PSBT is finalized once an input holds `m` signatures, otherwise it goes out for
//! the remaining cosigners to sign and comes back through [`signing::combine`].
//!
//! [`signing::combine`]: crate::signing::combine

use std::str::FromStr;

use bitcoin::bip32::{DerivationPath, Fingerprint, Xpriv};
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::opcodes::{Class, ClassifyContext, Opcode};
use bitcoin::psbt::Psbt;
use bitcoin::script::{Builder, Instruction};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, Amount, PrivateKey, PublicKey, Script, ScriptBuf, Transaction, TxOut, Witness};
use tracing::{debug, info};

use super::{MultisigFormat, Quorum};
use crate::derivation::{Chain, HdKeyChain};
use crate::error::{Error, Result};
use crate::signing::{self, push_bytes, ScriptCode};
use crate::transaction_builder::{attach_prev_tx, CreatedTransaction, Layout, TransactionBuilder};
use crate::utxo::{KeyRef, Utxo};

/// Spending scripts of a multisig output.
struct SpendScripts {
    witness_script: Option<ScriptBuf>,
    redeem_script: Option<ScriptBuf>,
}

impl Quorum {
    fn spend_scripts(&self, chain: Chain, index: u32) -> Result<SpendScripts> {
        let multisig = self.multisig_script(chain, index)?;
        Ok(match self.format() {
            MultisigFormat::P2wsh => SpendScripts {
                witness_script: Some(multisig),
                redeem_script: None,
            },
            MultisigFormat::P2shP2wsh => SpendScripts {
                redeem_script: Some(ScriptBuf::new_p2wsh(&multisig.wscript_hash())),
                witness_script: Some(multisig),
            },
            MultisigFormat::P2sh => SpendScripts {
                witness_script: None,
                redeem_script: Some(multisig),
            },
        })
    }

    /// Sign every input of `psbt` with each cosigner this wallet holds a key for.
    /// Returns the number of signatures added.
    pub fn sign_psbt(&self, psbt: &mut Psbt) -> Result<usize> {
        let mut added = 0;
        for cosigner in self.cosigners() {
            if let Some(signer) = cosigner.signer() {
                added += cosign(psbt, signer, cosigner.key.fingerprint, &cosigner.key.path, self.secp())?;
            }
        }
        Ok(added)
    }
}

impl TransactionBuilder {
    /// Build a spend from a multisig wallet. The transaction is returned only when
    /// local cosigners alone reach the threshold.
    pub fn build_multisig(&self, utxos: &[Utxo], quorum: &Quorum) -> Result<CreatedTransaction> {
        quorum.validate()?;
        let Layout {
            mut psbt,
            inputs,
            outputs,
            fee,
            estimated_size,
        } = self.layout(utxos, quorum.input_script_len())?;

        for (position, utxo) in inputs.iter().enumerate() {
            let Some(KeyRef::Derived {
                chain,
                index,
            }) = utxo.key
            else {
                return Err(Error::SigningKeyNotFound(format!("{}:{}", utxo.txid, utxo.vout)));
            };
            let scripts = quorum.spend_scripts(chain, index)?;
            let input = &mut psbt.inputs[position];
            if quorum.format().is_segwit() {
                let script_pubkey =
                    Address::from_str(&utxo.address)?.require_network(self.network())?.script_pubkey();
                input.witness_utxo = Some(TxOut {
                    value: Amount::from_sat(utxo.value),
                    script_pubkey,
                });
            } else {
                attach_prev_tx(input, utxo, false)?;
            }
            input.witness_script = scripts.witness_script;
            input.redeem_script = scripts.redeem_script;
            input.bip32_derivation.extend(quorum.origins(chain, index)?);
        }

        if let Some(KeyRef::Derived {
            chain,
            index,
        }) = self.change_key()
        {
            if let Some(position) = outputs.iter().position(|o| o.is_change) {
                let scripts = quorum.spend_scripts(chain, index)?;
                let output = &mut psbt.outputs[position];
                output.witness_script = scripts.witness_script;
                output.redeem_script = scripts.redeem_script;
                output.bip32_derivation.extend(quorum.origins(chain, index)?);
            }
        }

        let mut tx = None;
        let mut vsize = estimated_size;
        if !self.signing_skipped() {
            let added = quorum.sign_psbt(&mut psbt)?;
            debug!("added {} signatures from local cosigners", added);
            if let Some(signed) = finalize_psbt(&mut psbt)? {
                vsize = signed.vsize();
                info!("multisig transaction {} complete", signed.compute_txid());
                tx = Some(signed);
            }
        }
        if tx.is_none() {
            // cosigners of a P2SH quorum check amounts against the parents
            if let Some(bare) = inputs.iter().zip(&psbt.inputs).find(|(_, input)| {
                input.witness_utxo.is_none() && input.non_witness_utxo.is_none()
            }) {
                return Err(Error::MissingData(format!(
                    "previous transaction of {}:{} is needed by the other cosigners",
                    bare.0.txid, bare.0.vout
                )));
            }
        }

        Ok(CreatedTransaction {
            tx,
            psbt,
            inputs,
            outputs,
            fee,
            vsize,
        })
    }
}

/// Script an input's signature commits to, from what the PSBT says about it.
fn script_code(input: &bitcoin::psbt::Input, pubkey: &PublicKey) -> ScriptBuf {
    if let Some(witness_script) = &input.witness_script {
        return witness_script.clone();
    }
    if let Some(redeem) = &input.redeem_script {
        return redeem.clone();
    }
    if let Some(utxo) = &input.witness_utxo {
        return utxo.script_pubkey.clone();
    }
    ScriptBuf::new_p2pkh(&pubkey.pubkey_hash())
}

fn sign_with(
    psbt: &mut Psbt,
    index: usize,
    key: &PrivateKey,
    pubkey: &PublicKey,
    secp: &Secp256k1<All>,
) -> Result<()> {
    let input = &psbt.inputs[index];
    let script = script_code(input, pubkey);
    if input.witness_script.is_some() {
        signing::sign_input(psbt, index, ScriptCode::P2wsh(&script), key, secp)?;
    } else if script.is_p2wpkh() {
        signing::sign_input(psbt, index, ScriptCode::P2wpkh(&script), key, secp)?;
    } else {
        signing::sign_input(psbt, index, ScriptCode::Legacy(&script), key, secp)?;
    }
    Ok(())
}

/// Sign every input whose BIP32 derivation names a key below `signer`, which sits
/// at `path` under the master key with the given fingerprint. Keys that already
/// signed are skipped. Returns the number of signatures added.
pub fn cosign(
    psbt: &mut Psbt,
    signer: &Xpriv,
    fingerprint: Fingerprint,
    path: &DerivationPath,
    secp: &Secp256k1<All>,
) -> Result<usize> {
    let mut added = 0;
    for index in 0..psbt.inputs.len() {
        let candidates: Vec<_> = psbt.inputs[index]
            .bip32_derivation
            .iter()
            .filter(|(_, (fp, full))| *fp == fingerprint && full.as_ref().starts_with(path.as_ref()))
            .map(|(pk, (_, full))| (*pk, full.clone()))
            .collect();
        for (pubkey, full) in candidates {
            let pubkey = PublicKey::new(pubkey);
            if psbt.inputs[index].partial_sigs.contains_key(&pubkey) {
                continue;
            }
            let remainder = DerivationPath::from(full.as_ref()[path.as_ref().len()..].to_vec());
            let child = signer.derive_priv(secp, &remainder)?;
            if child.private_key.public_key(secp) != pubkey.inner {
                debug!("derivation {} of input {} does not match our key", full, index);
                continue;
            }
            let key = PrivateKey::new(child.private_key, signer.network);
            sign_with(psbt, index, &key, &pubkey, secp)?;
            added += 1;
        }
    }
    Ok(added)
}

/// Cosign with a single-signature HD keychain, matching inputs by the keychain's
/// master fingerprint (zero when unknown) and account path.
pub fn cosign_with_keychain(psbt: &mut Psbt, keychain: &HdKeyChain) -> Result<usize> {
    let signer = keychain.account_xpriv().ok_or(Error::NoSecret)?;
    let fingerprint = keychain.master_fingerprint().unwrap_or_else(|| Fingerprint::from([0u8; 4]));
    cosign(psbt, signer, fingerprint, keychain.account_path(), keychain.secp())
}

/// Threshold and keys of a bare `m`-of-`n` CHECKMULTISIG script.
pub fn parse_multisig_script(script: &Script) -> Option<(usize, Vec<PublicKey>)> {
    let mut instructions = script.instructions();
    let m = match instructions.next()? {
        Ok(Instruction::Op(op)) => small_number(op)?,
        _ => return None,
    };
    let mut keys = Vec::new();
    loop {
        match instructions.next()? {
            Ok(Instruction::PushBytes(bytes)) => keys.push(PublicKey::from_slice(bytes.as_bytes()).ok()?),
            Ok(Instruction::Op(op)) => {
                let n = small_number(op)?;
                if n != keys.len() || m > n {
                    return None;
                }
                break;
            }
            Err(_) => return None,
        }
    }
    match instructions.next() {
        Some(Ok(Instruction::Op(op))) if op == OP_CHECKMULTISIG && instructions.next().is_none() => Some((m, keys)),
        _ => None,
    }
}

fn small_number(op: Opcode) -> Option<usize> {
    match op.classify(ClassifyContext::Legacy) {
        Class::PushNum(n) if n > 0 => usize::try_from(n).ok(),
        _ => None,
    }
}

/// Signatures present on the least-signed input.
pub fn signature_count(psbt: &Psbt) -> usize {
    psbt.inputs.iter().map(|i| i.partial_sigs.len()).min().unwrap_or(0)
}

/// Finalize a multisig input once it holds enough signatures. Returns whether it
/// was finalized.
pub fn finalize_multisig_input(psbt: &mut Psbt, index: usize) -> Result<bool> {
    let input = psbt.inputs.get_mut(index).ok_or_else(|| Error::Signing(format!("no input {}", index)))?;
    let script = input
        .witness_script
        .as_ref()
        .or(input.redeem_script.as_ref())
        .ok_or_else(|| Error::MissingData(format!("input {} has no multisig script", index)))?
        .clone();
    let (m, keys) =
        parse_multisig_script(&script).ok_or_else(|| Error::Signing(format!("input {} is not multisig", index)))?;
    let signatures: Vec<Vec<u8>> =
        keys.iter().filter_map(|k| input.partial_sigs.get(k)).take(m).map(|s| s.to_vec()).collect();
    if signatures.len() < m {
        return Ok(false);
    }

    if input.witness_script.is_some() {
        let mut witness = Witness::new();
        // CHECKMULTISIG pops one element too many
        witness.push([0u8; 0]);
        for signature in &signatures {
            witness.push(signature);
        }
        witness.push(script.as_bytes());
        input.final_script_witness = Some(witness);
        if let Some(redeem) = &input.redeem_script {
            input.final_script_sig = Some(Builder::new().push_slice(push_bytes(redeem.as_bytes())?).into_script());
        }
    } else {
        let mut builder = Builder::new().push_int(0);
        for signature in &signatures {
            builder = builder.push_slice(push_bytes(signature)?);
        }
        input.final_script_sig = Some(builder.push_slice(push_bytes(script.as_bytes())?).into_script());
    }
    signing::clear_signing_fields(input);
    Ok(true)
}

/// Finalize every multisig input that has enough signatures and extract the
/// transaction once all inputs are final.
pub fn finalize_psbt(psbt: &mut Psbt) -> Result<Option<Transaction>> {
    for index in 0..psbt.inputs.len() {
        let input = &psbt.inputs[index];
        if input.final_script_sig.is_some() || input.final_script_witness.is_some() {
            continue;
        }
        finalize_multisig_input(psbt, index)?;
    }
    if !signing::is_finalized(psbt) {
        return Ok(None);
    }
    Ok(Some(psbt.clone().extract_tx_unchecked_fee_rate()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fee::FeeRate;
    use crate::multisig::tests::{legacy_2_of_2, native_2_of_2, MNEMONIC3};
    use crate::transaction::tests::txid;
    use crate::transaction_builder::Recipient;
    use bitcoin::Network;

    fn utxo_for(quorum: &Quorum, index: u32, value: u64) -> Utxo {
        let address = quorum.derive_address(Chain::External, index).unwrap().to_string();
        Utxo::new(txid(7), index, value, address).with_key(
            KeyRef::Derived {
                chain: Chain::External,
                index,
            },
            None,
        )
    }

    fn destination() -> Address {
        Address::from_str("13HaCAB4jf7FYSZexJxoczyDDnutzZigjS").unwrap().assume_checked()
    }

    fn builder(quorum: &Quorum) -> TransactionBuilder {
        TransactionBuilder::new(Network::Bitcoin, FeeRate::from_sat_per_vb(10).into())
            .add_recipient(Recipient::new(destination(), 10_000))
            .set_change_address(
                quorum.derive_address(Chain::Internal, 3).unwrap(),
                Some(KeyRef::Derived {
                    chain: Chain::Internal,
                    index: 3,
                }),
            )
    }

    #[test]
    fn test_watch_only_quorum_returns_unsigned_psbt() {
        let quorum = native_2_of_2();
        let created = builder(&quorum).build_multisig(&[utxo_for(&quorum, 0, 100_000)], &quorum).unwrap();

        assert!(created.tx.is_none());
        assert_eq!(signature_count(&created.psbt), 0);
        let input = &created.psbt.inputs[0];
        assert_eq!(input.bip32_derivation.len(), 2);
        assert!(input.witness_script.is_some());
        assert!(input.redeem_script.is_none());
        assert_eq!(created.psbt.outputs[1].bip32_derivation.len(), 2);
        assert!(created.fee > 0 && created.fee < 3000);
    }

    #[test]
    fn test_legacy_quorum_needs_previous_transactions() {
        let quorum = legacy_2_of_2();
        let address = quorum.derive_address(Chain::External, 1).unwrap();
        let funding = crate::transaction_builder::unsigned_transaction(
            [(bitcoin::OutPoint::new(txid(50), 0), 0xffff_fffe)],
            [crate::transaction_builder::txout(&address.script_pubkey(), 90_000)],
        );
        let bare = Utxo::new(funding.compute_txid(), 0, 90_000, address.to_string()).with_key(
            KeyRef::Derived {
                chain: Chain::External,
                index: 1,
            },
            None,
        );

        assert!(matches!(builder(&quorum).build_multisig(&[bare.clone()], &quorum), Err(Error::MissingData(_))));

        let created = builder(&quorum).build_multisig(&[bare.with_prev_tx(funding.clone())], &quorum).unwrap();
        assert!(created.tx.is_none());
        let input = &created.psbt.inputs[0];
        assert!(input.witness_utxo.is_none());
        assert_eq!(input.non_witness_utxo.as_ref(), Some(&funding));
        assert!(input.redeem_script.is_some());
        assert_eq!(input.bip32_derivation.len(), 2);
    }

    #[test]
    fn test_local_cosigners_sign_and_finalize() {
        let mut quorum = Quorum::new(1, MultisigFormat::P2shP2wsh, Network::Bitcoin);
        quorum.add_cosigner(crate::multisig::tests::cosigner_key(
            "Ypub6kvtvTZpqGuWtQfg9bL5xe4vDWtwsirR8LzDvsY3vgXvyncW1NGXCUJ9Ps7CiizSSLV6NnnXSYyVDnxCu26QChWzWLg5YCAHam6cYjGtzRz",
            "168DD603",
        ))
        .unwrap();
        quorum.add_mnemonic_cosigner(MNEMONIC3, "", None).unwrap();

        let created = builder(&quorum).build_multisig(&[utxo_for(&quorum, 0, 50_000)], &quorum).unwrap();
        let tx = created.tx.expect("one of two is enough");
        assert_eq!(tx.input[0].witness.len(), 3);
        assert!(!tx.input[0].script_sig.is_empty());
        assert!(signing::is_finalized(&created.psbt));
    }

    #[test]
    fn test_partial_signatures_combine_into_final() {
        let mut ours = native_2_of_2();
        ours.add_mnemonic_cosigner(MNEMONIC3, "", None).unwrap();
        let unsigned = builder(&ours).skip_signing(true).build_multisig(&[utxo_for(&ours, 2, 80_000)], &ours).unwrap();

        let mut signed = unsigned.psbt.clone();
        assert_eq!(ours.sign_psbt(&mut signed).unwrap(), 1);
        // signing twice adds nothing
        assert_eq!(ours.sign_psbt(&mut signed).unwrap(), 0);
        assert_eq!(signature_count(&signed), 1);
        assert!(finalize_psbt(&mut signed).unwrap().is_none());

        let combined = signing::combine(unsigned.psbt, signed).unwrap();
        assert_eq!(signature_count(&combined), 1);
    }

    #[test]
    fn test_parse_multisig_script() {
        let quorum = native_2_of_2();
        let script = quorum.multisig_script(Chain::External, 0).unwrap();
        let (m, keys) = parse_multisig_script(&script).unwrap();
        assert_eq!(m, 2);
        assert_eq!(keys.len(), 2);
        assert!(keys[0].inner.serialize() < keys[1].inner.serialize());
        assert!(parse_multisig_script(&ScriptBuf::new_p2pkh(&keys[0].pubkey_hash())).is_none());
    }

    #[test]
    fn test_cosign_with_keychain() {
        let keychain = HdKeyChain::from_mnemonic(MNEMONIC3, "", crate::script_type::ScriptType::P2wpkh, Network::Bitcoin).unwrap();
        let address = keychain.derive_address(Chain::External, 0).unwrap();
        let utxo = Utxo::new(txid(9), 0, 30_000, address.to_string()).with_key(
            KeyRef::Derived {
                chain: Chain::External,
                index: 0,
            },
            None,
        );
        let created = TransactionBuilder::new(Network::Bitcoin, FeeRate::from_sat_per_vb(2).into())
            .add_recipient(Recipient::send_max(destination()))
            .skip_signing(true)
            .build(&[utxo], &keychain)
            .unwrap();

        let mut psbt = created.psbt;
        assert_eq!(cosign_with_keychain(&mut psbt, &keychain).unwrap(), 1);
        assert_eq!(psbt.inputs[0].partial_sigs.len(), 1);
    }
}
