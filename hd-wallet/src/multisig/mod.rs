//! M-of-N multisig wallets
//!
//! A [`Quorum`] holds the account keys of every cosigner. Addresses pay to a
//! `sortedmulti` script: at each (chain, index) every cosigner's key is derived,
//! the keys are sorted and wrapped in P2WSH, P2SH-P2WSH or P2SH.

pub mod cosigner;
pub mod psbt;
pub mod setup;

use core::fmt;
use core::str::FromStr;
use std::sync::OnceLock;

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, Network, NetworkKind, PublicKey, ScriptBuf};
use tracing::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub use cosigner::CosignerKey;

use crate::address_cache::AddressSource;
use crate::derivation::{chain_index_path, Chain};
use crate::error::{Error, Result};
use crate::ext_key::{KeyFamily, KeyVersion};
use crate::fee;
use crate::mnemonic;

/// Largest quorum a standard multisig script allows.
pub const MAX_COSIGNERS: usize = 15;

/// Output script family of a multisig wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum MultisigFormat {
    /// Native segwit, BIP48 script type 2
    P2wsh,
    /// P2WSH nested in P2SH, BIP48 script type 1
    P2shP2wsh,
    /// Legacy P2SH, BIP45
    P2sh,
}

impl MultisigFormat {
    /// Default account path: `m/48'/coin'/0'/2'`, `m/48'/coin'/0'/1'` or `m/45'`.
    pub fn account_path(self, network: NetworkKind) -> DerivationPath {
        let coin = match network {
            NetworkKind::Main => 0,
            NetworkKind::Test => 1,
        };
        let steps = match self {
            MultisigFormat::P2wsh => vec![48, coin, 0, 2],
            MultisigFormat::P2shP2wsh => vec![48, coin, 0, 1],
            MultisigFormat::P2sh => vec![45],
        };
        steps.into_iter().filter_map(|i| ChildNumber::from_hardened_idx(i).ok()).collect()
    }

    /// Extended key family cosigner keys are displayed in.
    pub fn key_family(self) -> KeyFamily {
        match self {
            MultisigFormat::P2wsh => KeyFamily::NativeSegwitMultisig,
            MultisigFormat::P2shP2wsh => KeyFamily::WrappedSegwitMultisig,
            MultisigFormat::P2sh => KeyFamily::Legacy,
        }
    }

    /// Format implied by a key family. Single-sig segwit families map to their
    /// multisig counterpart, plain xpubs imply nothing.
    pub fn from_family(family: KeyFamily) -> Option<Self> {
        match family {
            KeyFamily::NativeSegwit | KeyFamily::NativeSegwitMultisig => Some(MultisigFormat::P2wsh),
            KeyFamily::WrappedSegwit | KeyFamily::WrappedSegwitMultisig => Some(MultisigFormat::P2shP2wsh),
            KeyFamily::Legacy => None,
        }
    }

    /// Script data an `m`-of-`n` input carries, as coin selection counts it.
    pub fn input_script_len(self, m: usize, n: usize) -> usize {
        match self {
            MultisigFormat::P2wsh => fee::multisig_native_input_vsize(m, n),
            MultisigFormat::P2shP2wsh => fee::multisig_wrapped_input_vsize(m, n),
            MultisigFormat::P2sh => fee::multisig_legacy_input_vsize(m, n),
        }
    }

    pub fn is_segwit(self) -> bool {
        !matches!(self, MultisigFormat::P2sh)
    }
}

impl fmt::Display for MultisigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MultisigFormat::P2wsh => "p2wsh",
            MultisigFormat::P2shP2wsh => "p2sh-p2wsh",
            MultisigFormat::P2sh => "p2sh",
        };
        f.write_str(s)
    }
}

impl FromStr for MultisigFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "p2wsh" => Ok(MultisigFormat::P2wsh),
            "p2sh-p2wsh" | "p2wsh-p2sh" => Ok(MultisigFormat::P2shP2wsh),
            "p2sh" => Ok(MultisigFormat::P2sh),
            other => Err(Error::UnsupportedScriptType(other.to_string())),
        }
    }
}

/// A quorum member: the public key, plus the account private key when this
/// wallet can sign for it.
#[derive(Debug, Clone)]
pub struct Cosigner {
    pub key: CosignerKey,
    signer: Option<Xpriv>,
}

impl Cosigner {
    pub fn can_sign(&self) -> bool {
        self.signer.is_some()
    }

    pub(crate) fn signer(&self) -> Option<&Xpriv> {
        self.signer.as_ref()
    }
}

/// An M-of-N multisig wallet.
#[derive(Debug, Clone)]
pub struct Quorum {
    m: usize,
    format: MultisigFormat,
    network: Network,
    label: Option<String>,
    derivation_path: DerivationPath,
    cosigners: Vec<Cosigner>,
    chain_nodes: [OnceLock<Vec<Xpub>>; 2],
    secp: Secp256k1<All>,
}

impl Quorum {
    /// An empty quorum requiring `m` signatures.
    pub fn new(m: usize, format: MultisigFormat, network: Network) -> Self {
        Self {
            m,
            format,
            network,
            label: None,
            derivation_path: format.account_path(NetworkKind::from(network)),
            cosigners: Vec::new(),
            chain_nodes: Default::default(),
            secp: Secp256k1::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Account path shared by cosigners that do not bring their own.
    pub fn with_derivation_path(mut self, path: DerivationPath) -> Self {
        self.derivation_path = path;
        self
    }

    pub(crate) fn set_m(&mut self, m: usize) {
        self.m = m;
    }

    pub(crate) fn set_format(&mut self, format: MultisigFormat) {
        if self.format != format && self.derivation_path == self.format.account_path(NetworkKind::from(self.network)) {
            self.derivation_path = format.account_path(NetworkKind::from(self.network));
        }
        self.format = format;
    }

    pub(crate) fn set_label(&mut self, label: impl Into<String>) {
        self.label = Some(label.into());
    }

    pub(crate) fn set_derivation_path(&mut self, path: DerivationPath) {
        self.derivation_path = path;
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn n(&self) -> usize {
        self.cosigners.len()
    }

    pub fn format(&self) -> MultisigFormat {
        self.format
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn derivation_path(&self) -> &DerivationPath {
        &self.derivation_path
    }

    pub fn cosigners(&self) -> &[Cosigner] {
        &self.cosigners
    }

    pub fn cosigner_for_fingerprint(&self, fingerprint: Fingerprint) -> Option<&Cosigner> {
        self.cosigners.iter().find(|c| c.key.fingerprint == fingerprint)
    }

    /// Number of cosigners this wallet holds private keys for.
    pub fn signatures_we_can_make(&self) -> usize {
        self.cosigners.iter().filter(|c| c.can_sign()).count()
    }

    /// Add a watch-only cosigner. Keys already in the quorum, by payload or by
    /// known fingerprint, are rejected.
    pub fn add_cosigner(&mut self, key: CosignerKey) -> Result<()> {
        self.push(Cosigner {
            key,
            signer: None,
        })
    }

    /// Add a cosigner this wallet can sign for, derived from a BIP39 mnemonic at
    /// `path` (the quorum's derivation path when `None`).
    pub fn add_mnemonic_cosigner(
        &mut self,
        phrase: &str,
        passphrase: &str,
        path: Option<DerivationPath>,
    ) -> Result<()> {
        let seed = mnemonic::to_seed(phrase, passphrase)?;
        let master = Xpriv::new_master(self.network, &seed)?;
        let path = path.unwrap_or_else(|| self.derivation_path.clone());
        let account = master.derive_priv(&self.secp, &path)?;
        let xpub = Xpub::from_priv(&self.secp, &account);
        let key = CosignerKey {
            fingerprint: master.fingerprint(&self.secp),
            path,
            xpub,
            version: KeyVersion::for_family(self.format.key_family(), NetworkKind::from(self.network), false),
            format: Some(self.format),
        };
        self.push(Cosigner {
            key,
            signer: Some(account),
        })
    }

    fn push(&mut self, cosigner: Cosigner) -> Result<()> {
        if self.n() >= MAX_COSIGNERS {
            return Err(Error::Config(format!("a quorum holds at most {} cosigners", MAX_COSIGNERS)));
        }
        if NetworkKind::from(self.network) != cosigner.key.xpub.network {
            return Err(Error::InvalidKey(format!("cosigner key is not for {}", self.network)));
        }
        if self.cosigners.iter().any(|c| c.key.same_key(&cosigner.key)) {
            return Err(Error::DuplicateKey(cosigner.key.encoded()));
        }
        if cosigner.key.has_fingerprint()
            && self.cosigners.iter().any(|c| c.key.fingerprint == cosigner.key.fingerprint)
        {
            return Err(Error::DuplicateKey(format!("fingerprint {}", cosigner.key.fingerprint_hex())));
        }
        debug!("added cosigner {} to {}-of-{} quorum", cosigner.key.fingerprint_hex(), self.m, self.n() + 1);
        self.cosigners.push(cosigner);
        self.chain_nodes = Default::default();
        Ok(())
    }

    /// Check that the quorum can produce addresses.
    pub fn validate(&self) -> Result<()> {
        if self.m == 0 || self.m > self.n() {
            return Err(Error::Config(format!("cannot require {} of {} signatures", self.m, self.n())));
        }
        Ok(())
    }

    fn chain_nodes(&self, chain: Chain) -> Result<&[Xpub]> {
        let slot = &self.chain_nodes[chain.index() as usize];
        if let Some(nodes) = slot.get() {
            return Ok(nodes);
        }
        let step = [ChildNumber::Normal {
            index: chain.index(),
        }];
        let nodes = self
            .cosigners
            .iter()
            .map(|c| c.key.xpub.derive_pub(&self.secp, &step))
            .collect::<core::result::Result<Vec<_>, _>>()?;
        Ok(slot.get_or_init(|| nodes))
    }

    /// Cosigner public keys at `chain/index`, in cosigner order.
    pub fn public_keys(&self, chain: Chain, index: u32) -> Result<Vec<PublicKey>> {
        let [_, child] = chain_index_path(chain, index)?;
        self.chain_nodes(chain)?
            .iter()
            .map(|node| Ok(PublicKey::new(node.derive_pub(&self.secp, &[child])?.public_key)))
            .collect()
    }

    /// The `sortedmulti` script at `chain/index`.
    pub fn multisig_script(&self, chain: Chain, index: u32) -> Result<ScriptBuf> {
        self.validate()?;
        let mut keys = self.public_keys(chain, index)?;
        keys.sort_by_key(|k| k.inner.serialize());
        let mut builder = Builder::new().push_int(self.m as i64);
        for key in &keys {
            builder = builder.push_key(key);
        }
        Ok(builder.push_int(keys.len() as i64).push_opcode(OP_CHECKMULTISIG).into_script())
    }

    /// Address at `chain/index`.
    pub fn derive_address(&self, chain: Chain, index: u32) -> Result<Address> {
        let script = self.multisig_script(chain, index)?;
        match self.format {
            MultisigFormat::P2wsh => Ok(Address::p2wsh(&script, self.network)),
            MultisigFormat::P2shP2wsh => Ok(Address::p2shwsh(&script, self.network)),
            MultisigFormat::P2sh => {
                Address::p2sh(&script, self.network).map_err(|e| Error::InvalidAddress(e.to_string()))
            }
        }
    }

    /// Script data of an input spending this quorum, for coin selection.
    pub fn input_script_len(&self) -> usize {
        self.format.input_script_len(self.m, self.n())
    }

    /// BIP32 origin of every cosigner key at `chain/index`.
    pub fn origins(
        &self,
        chain: Chain,
        index: u32,
    ) -> Result<Vec<(bitcoin::secp256k1::PublicKey, (Fingerprint, DerivationPath))>> {
        let keys = self.public_keys(chain, index)?;
        let steps = chain_index_path(chain, index)?;
        Ok(keys
            .into_iter()
            .zip(&self.cosigners)
            .map(|(key, cosigner)| (key.inner, (cosigner.key.fingerprint, cosigner.key.path.extend(steps))))
            .collect())
    }

    pub(crate) fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }
}

impl AddressSource for Quorum {
    fn address_at(&self, chain: Chain, index: u32) -> Result<String> {
        self.derive_address(chain, index).map(|a| a.to_string())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const FP1_COBO: &str = "D37EAD88";
    pub(crate) const ZPUB1: &str = "Zpub74ijpfhERJNjhCKXRspTdLJV5eoEmSRZdHqDvp9kVtdVEyiXk7pXxRbfZzQvsDFpfDHEHVtVpx4Dz9DGUWGn2Xk5zG5u45QTMsYS2vjohNQ";
    pub(crate) const FP2_COLDCARD: &str = "168DD603";
    pub(crate) const ZPUB2: &str = "Zpub75mAE8EjyxSzoyPmGnd5E6MyD7ALGNndruWv52xpzimZQKukwvEfXTHqmH8nbbc6ccP5t2aM3mws3pKYSnKpKMMytdbNEZFUxKzztYFM8Pn";
    pub(crate) const MNEMONIC3: &str = "accident olympic spawn spider cable track pluck fat code grab fine salt garment kidney crime old often worth member impulse brother smoke garden trash";

    pub(crate) fn cosigner_key(encoded: &str, fingerprint: &str) -> CosignerKey {
        let mut key = cosigner::parse(encoded).unwrap().remove(0);
        key.fingerprint = cosigner::parse_fingerprint(fingerprint).unwrap();
        key
    }

    pub(crate) fn native_2_of_2() -> Quorum {
        let mut quorum = Quorum::new(2, MultisigFormat::P2wsh, Network::Bitcoin);
        quorum.add_cosigner(cosigner_key(ZPUB1, FP1_COBO)).unwrap();
        quorum.add_cosigner(cosigner_key(ZPUB2, FP2_COLDCARD)).unwrap();
        quorum
    }

    #[test]
    fn test_native_segwit_addresses() {
        let quorum = native_2_of_2();
        assert_eq!(
            quorum.derive_address(Chain::External, 0).unwrap().to_string(),
            "bc1qxzrzh4caw7e3genwtldtxntzj0ktfl7mhf2lh4fj8h7hnkvtvc4salvp85"
        );
        assert_eq!(
            quorum.derive_address(Chain::External, 1).unwrap().to_string(),
            "bc1qvwd2d7r46j7u9qyxpedfhe5p075sxuhzd0n6napuvvhq2u5nrmqs9ex90q"
        );
        assert_eq!(
            quorum.derive_address(Chain::Internal, 0).unwrap().to_string(),
            "bc1qtah0p50d4qlftn049k7lldcwh7cs3zkjy9g8xegv63p308hsh9zsf5567q"
        );
        assert_eq!(quorum.signatures_we_can_make(), 0);
    }

    pub(crate) fn legacy_2_of_2() -> Quorum {
        let mut quorum = Quorum::new(2, MultisigFormat::P2sh, Network::Bitcoin);
        quorum.add_cosigner(cosigner_key("xpub69SfFhG5eA9cqxHKM6b1HhXMpDzipUPDBNMBrjNgWWbbzKqnqwx2mvMyB5bRgmLAi7cBgr8euuz4Lvz3maWxpfUmdM71dyQuvq68mTAG4Cp", FP1_COBO)).unwrap();
        quorum.add_cosigner(cosigner_key("xpub6847W6cYUqq4ixcmFb83iqPtJZfnMPTkpYiCsuUybzFppJp2qzh3KCVHsLGQy4WhaxGqkK9aDDZnSfhB92PkHDKihbH6WLztzmN7WW9GYpR", FP2_COLDCARD)).unwrap();
        quorum
    }

    #[test]
    fn test_legacy_p2sh_addresses() {
        let quorum = legacy_2_of_2();
        assert_eq!(quorum.derive_address(Chain::External, 0).unwrap().to_string(), "3J5xQcgBqoykSHhmDJLYp87SgVSNhYrvnz");
        assert_eq!(quorum.derive_address(Chain::Internal, 1).unwrap().to_string(), "36j8Qx6vxUknTxGFa5yYuxifEK9PGPEKso");
        assert_eq!(quorum.input_script_len(), 9 + 2 * 74 + 2 * 34);
    }

    #[test]
    fn test_mnemonic_cosigner() {
        let mut quorum = native_2_of_2();
        quorum.add_mnemonic_cosigner(MNEMONIC3, "", None).unwrap();
        assert_eq!(quorum.n(), 3);
        assert_eq!(quorum.signatures_we_can_make(), 1);
        assert_eq!(
            quorum.cosigners()[2].key.encoded(),
            "Zpub74k35j5DkSA6t6SFhPeHv8ENBHdNgAPALWodSWoWxsHo6vbAu2FUGq9QmUEvdEPzBoMswizfsAbTWQYU2ZnvCjdKsFje5TEfjLxuH8arBtp"
        );
        assert_eq!(
            quorum.derive_address(Chain::External, 0).unwrap().to_string(),
            "bc1qnpy7c7wz6tvmhdwgyk8ka4du3s9x6uhgjal305xdatmwfa538zxsys5l0t"
        );
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let mut quorum = native_2_of_2();
        let result = quorum.add_cosigner(cosigner_key(ZPUB1, "00000000"));
        assert!(matches!(result, Err(Error::DuplicateKey(_))));

        // same payload under another version is still the same key
        let xpub = crate::ext_key::canonicalize(ZPUB2).unwrap();
        assert!(matches!(quorum.add_cosigner(cosigner_key(&xpub, "00000000")), Err(Error::DuplicateKey(_))));
    }

    #[test]
    fn test_validate_threshold() {
        let mut quorum = Quorum::new(3, MultisigFormat::P2wsh, Network::Bitcoin);
        quorum.add_cosigner(cosigner_key(ZPUB1, FP1_COBO)).unwrap();
        assert!(quorum.validate().is_err());
        assert!(quorum.derive_address(Chain::External, 0).is_err());
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("P2WSH-P2SH".parse::<MultisigFormat>().unwrap(), MultisigFormat::P2shP2wsh);
        assert_eq!(MultisigFormat::P2sh.to_string(), "p2sh");
        assert!("p2tr".parse::<MultisigFormat>().is_err());
    }
}
