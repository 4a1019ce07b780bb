//! PSBT input signing and finalization
//!
//! Signatures are always SIGHASH_ALL. The signature hash depends on how the input
//! is spent: legacy inputs commit to the script being satisfied, segwit v0 inputs
//! additionally commit to the spent amount taken from `witness_utxo`.

use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Amount, PrivateKey, PublicKey, Script, ScriptBuf, Witness};
use tracing::debug;

use crate::error::{Error, Result};
use crate::script_type::ScriptType;

/// The script an input signature commits to.
#[derive(Debug, Clone, Copy)]
pub enum ScriptCode<'a> {
    /// Pre-segwit spend of a script (P2PKH script pubkey or P2SH redeem script)
    Legacy(&'a Script),
    /// Segwit v0 key hash spend, given the P2WPKH program
    P2wpkh(&'a Script),
    /// Segwit v0 script hash spend, given the witness script
    P2wsh(&'a Script),
}

fn spent_amount(psbt: &Psbt, index: usize) -> Result<Amount> {
    psbt.inputs
        .get(index)
        .and_then(|input| input.witness_utxo.as_ref())
        .map(|txout| txout.value)
        .ok_or_else(|| Error::MissingData(format!("input {} has no witness utxo", index)))
}

/// Sign input `index` and record the signature in its `partial_sigs`.
pub fn sign_input(
    psbt: &mut Psbt,
    index: usize,
    code: ScriptCode<'_>,
    key: &PrivateKey,
    secp: &Secp256k1<All>,
) -> Result<ecdsa::Signature> {
    if index >= psbt.inputs.len() {
        return Err(Error::Signing(format!("no input {}", index)));
    }
    let digest = {
        let mut cache = SighashCache::new(&psbt.unsigned_tx);
        match code {
            ScriptCode::Legacy(script) => cache
                .legacy_signature_hash(index, script, EcdsaSighashType::All.to_u32())
                .map_err(|e| Error::Signing(e.to_string()))?
                .to_byte_array(),
            ScriptCode::P2wpkh(program) => {
                let value = spent_amount(psbt, index)?;
                cache
                    .p2wpkh_signature_hash(index, program, value, EcdsaSighashType::All)
                    .map_err(|e| Error::Signing(e.to_string()))?
                    .to_byte_array()
            }
            ScriptCode::P2wsh(witness_script) => {
                let value = spent_amount(psbt, index)?;
                cache
                    .p2wsh_signature_hash(index, witness_script, value, EcdsaSighashType::All)
                    .map_err(|e| Error::Signing(e.to_string()))?
                    .to_byte_array()
            }
        }
    };

    let message = Message::from_digest(digest);
    let signature = ecdsa::Signature {
        signature: secp.sign_ecdsa(&message, &key.inner),
        sighash_type: EcdsaSighashType::All,
    };
    let pubkey = PublicKey::new(key.inner.public_key(secp));
    psbt.inputs[index].partial_sigs.insert(pubkey, signature);
    debug!("signed input {} with {}", index, pubkey);
    Ok(signature)
}

/// Sign a single-signature input of the given script type.
pub fn sign_single_sig_input(
    psbt: &mut Psbt,
    index: usize,
    script_type: ScriptType,
    key: &PrivateKey,
    secp: &Secp256k1<All>,
) -> Result<ecdsa::Signature> {
    let pubkey = bitcoin::CompressedPublicKey(key.inner.public_key(secp));
    match script_type {
        ScriptType::P2pkh => {
            let script = ScriptBuf::new_p2pkh(&PublicKey::from(pubkey).pubkey_hash());
            sign_input(psbt, index, ScriptCode::Legacy(&script), key, secp)
        }
        ScriptType::P2shP2wpkh | ScriptType::P2wpkh => {
            let program = ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash());
            sign_input(psbt, index, ScriptCode::P2wpkh(&program), key, secp)
        }
    }
}

pub(crate) fn push_bytes(bytes: &[u8]) -> Result<PushBytesBuf> {
    PushBytesBuf::try_from(bytes.to_vec()).map_err(|e| Error::Signing(e.to_string()))
}

/// Turn the signature of a single-signature input into its final scriptSig and witness.
pub fn finalize_single_sig_input(psbt: &mut Psbt, index: usize, script_type: ScriptType) -> Result<()> {
    let input = psbt.inputs.get_mut(index).ok_or_else(|| Error::Signing(format!("no input {}", index)))?;
    let (pubkey, signature) = input
        .partial_sigs
        .iter()
        .next()
        .map(|(pk, sig)| (*pk, *sig))
        .ok_or_else(|| Error::Signing(format!("input {} is not signed", index)))?;

    match script_type {
        ScriptType::P2pkh => {
            let script_sig =
                Builder::new().push_slice(push_bytes(&signature.to_vec())?).push_key(&pubkey).into_script();
            input.final_script_sig = Some(script_sig);
        }
        ScriptType::P2wpkh => {
            input.final_script_witness = Some(Witness::p2wpkh(&signature, &pubkey.inner));
        }
        ScriptType::P2shP2wpkh => {
            let redeem = bitcoin::CompressedPublicKey::try_from(pubkey)
                .map(|pk| ScriptBuf::new_p2wpkh(&pk.wpubkey_hash()))
                .map_err(|e| Error::Signing(e.to_string()))?;
            input.final_script_sig = Some(Builder::new().push_slice(push_bytes(redeem.as_bytes())?).into_script());
            input.final_script_witness = Some(Witness::p2wpkh(&signature, &pubkey.inner));
        }
    }
    clear_signing_fields(input);
    Ok(())
}

/// Drop everything a finalized input no longer needs.
pub(crate) fn clear_signing_fields(input: &mut bitcoin::psbt::Input) {
    input.partial_sigs.clear();
    input.sighash_type = None;
    input.redeem_script = None;
    input.witness_script = None;
    input.bip32_derivation.clear();
}

/// Whether every input carries a final scriptSig or witness.
pub fn is_finalized(psbt: &Psbt) -> bool {
    psbt.inputs.iter().all(|i| i.final_script_sig.is_some() || i.final_script_witness.is_some())
}

/// Merge the signatures and metadata of `other` into `psbt`. Both must describe
/// the same unsigned transaction.
pub fn combine(mut psbt: Psbt, other: Psbt) -> Result<Psbt> {
    psbt.combine(other)?;
    Ok(psbt)
}

/// Check a signature against the sighash it should commit to.
pub fn verify_signature(
    psbt: &Psbt,
    index: usize,
    code: ScriptCode<'_>,
    pubkey: &PublicKey,
    signature: &ecdsa::Signature,
    secp: &Secp256k1<All>,
) -> Result<bool> {
    let mut cache = SighashCache::new(&psbt.unsigned_tx);
    let digest = match code {
        ScriptCode::Legacy(script) => cache
            .legacy_signature_hash(index, script, signature.sighash_type.to_u32())
            .map_err(|e| Error::Signing(e.to_string()))?
            .to_byte_array(),
        ScriptCode::P2wpkh(program) => cache
            .p2wpkh_signature_hash(index, program, spent_amount(psbt, index)?, signature.sighash_type)
            .map_err(|e| Error::Signing(e.to_string()))?
            .to_byte_array(),
        ScriptCode::P2wsh(script) => cache
            .p2wsh_signature_hash(index, script, spent_amount(psbt, index)?, signature.sighash_type)
            .map_err(|e| Error::Signing(e.to_string()))?
            .to_byte_array(),
    };
    Ok(secp.verify_ecdsa(&Message::from_digest(digest), &signature.signature, &pubkey.inner).is_ok())
}
