//! Hierarchical key derivation for single-signature wallets.
//!
//! A [`HdKeyChain`] holds the account-level node of a BIP44/49/84 wallet. External
//! (receive) and internal (change) chain nodes are derived once and kept for the
//! lifetime of the object; per-address keys are derived from those nodes.

use std::sync::OnceLock;

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, CompressedPublicKey, Network, PrivateKey};
use tracing::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ext_key::{self, KeyVersion};
use crate::mnemonic;
use crate::script_type::{path_to_string, ScriptType};

/// Address chain within an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Chain {
    /// Receive addresses, `/0/i`
    External,
    /// Change addresses, `/1/i`
    Internal,
}

impl Chain {
    pub const BOTH: [Chain; 2] = [Chain::External, Chain::Internal];

    /// The non-hardened child index selecting this chain.
    pub fn index(self) -> u32 {
        match self {
            Chain::External => 0,
            Chain::Internal => 1,
        }
    }

    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(Chain::External),
            1 => Some(Chain::Internal),
            _ => None,
        }
    }

    fn slot(self) -> usize {
        self.index() as usize
    }
}

/// Two non-hardened steps, `chain/index`.
pub(crate) fn chain_index_path(chain: Chain, index: u32) -> Result<[ChildNumber; 2]> {
    let index = ChildNumber::from_normal_idx(index)
        .map_err(|_| Error::InvalidDerivationPath(format!("address index {} out of range", index)))?;
    Ok([ChildNumber::Normal {
        index: chain.index(),
    }, index])
}

/// Account-level key material of a single-signature HD wallet.
#[derive(Debug, Clone)]
pub struct HdKeyChain {
    script_type: ScriptType,
    network: Network,
    account_path: DerivationPath,
    account_xpub: Xpub,
    account_xpriv: Option<Xpriv>,
    master_fingerprint: Option<Fingerprint>,
    chain_nodes: [OnceLock<Xpub>; 2],
    xpub_string: OnceLock<String>,
    secp: Secp256k1<All>,
}

impl HdKeyChain {
    /// Derive the default account of `script_type` from a BIP39 mnemonic.
    pub fn from_mnemonic(
        phrase: &str,
        passphrase: &str,
        script_type: ScriptType,
        network: Network,
    ) -> Result<Self> {
        Self::from_mnemonic_with_path(
            phrase,
            passphrase,
            script_type,
            network,
            script_type.default_path(network),
        )
    }

    /// Derive an account at a custom path from a BIP39 mnemonic.
    pub fn from_mnemonic_with_path(
        phrase: &str,
        passphrase: &str,
        script_type: ScriptType,
        network: Network,
        account_path: DerivationPath,
    ) -> Result<Self> {
        let seed = mnemonic::to_seed(phrase, passphrase)?;
        Self::from_seed(&seed, script_type, network, account_path)
    }

    /// Derive an account at `account_path` from a raw BIP32 seed.
    pub fn from_seed(
        seed: &[u8],
        script_type: ScriptType,
        network: Network,
        account_path: DerivationPath,
    ) -> Result<Self> {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(network, seed)?;
        let fingerprint = master.fingerprint(&secp);
        let account_xpriv = master.derive_priv(&secp, &account_path)?;
        let account_xpub = Xpub::from_priv(&secp, &account_xpriv);
        debug!(
            "derived {} account {} (fingerprint {})",
            script_type,
            path_to_string(&account_path),
            fingerprint
        );
        Ok(Self {
            script_type,
            network,
            account_path,
            account_xpub,
            account_xpriv: Some(account_xpriv),
            master_fingerprint: Some(fingerprint),
            chain_nodes: Default::default(),
            xpub_string: OnceLock::new(),
            secp,
        })
    }

    /// Watch-only keychain from an account-level extended public key in any
    /// xpub/ypub/zpub format. The script type follows the key's format.
    pub fn from_xpub(encoded: &str, network: Network) -> Result<Self> {
        let (xpub, version) = ext_key::parse_xpub(encoded)?;
        let script_type = ScriptType::from_key_version(version)
            .ok_or_else(|| Error::UnsupportedScriptType(format!("{} is a multisig key", version)))?;
        Self::from_account_xpub(xpub, script_type, network)
    }

    /// Watch-only keychain from a decoded account xpub and an explicit script type.
    pub fn from_account_xpub(xpub: Xpub, script_type: ScriptType, network: Network) -> Result<Self> {
        if bitcoin::NetworkKind::from(network) != xpub.network {
            return Err(Error::InvalidKey(format!("key is not for {}", network)));
        }
        Ok(Self {
            script_type,
            network,
            account_path: script_type.default_path(network),
            account_xpub: xpub,
            account_xpriv: None,
            master_fingerprint: None,
            chain_nodes: Default::default(),
            xpub_string: OnceLock::new(),
            secp: Secp256k1::new(),
        })
    }

    /// Record the true account path of an imported key.
    pub fn with_account_path(mut self, path: DerivationPath) -> Self {
        self.account_path = path;
        self
    }

    /// Record the master key fingerprint of an imported key.
    pub fn with_master_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.master_fingerprint = Some(fingerprint);
        self
    }

    pub fn script_type(&self) -> ScriptType {
        self.script_type
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn account_path(&self) -> &DerivationPath {
        &self.account_path
    }

    pub fn account_xpub(&self) -> &Xpub {
        &self.account_xpub
    }

    /// Whether private keys can be derived.
    pub fn has_secret(&self) -> bool {
        self.account_xpriv.is_some()
    }

    pub(crate) fn account_xpriv(&self) -> Option<&Xpriv> {
        self.account_xpriv.as_ref()
    }

    /// Master fingerprint, if known.
    pub fn master_fingerprint(&self) -> Option<Fingerprint> {
        self.master_fingerprint
    }

    /// Master fingerprint as uppercase hex, the format hardware wallets display.
    pub fn master_fingerprint_hex(&self) -> Option<String> {
        self.master_fingerprint.map(|fp| fp.to_string().to_uppercase())
    }

    /// Account extended public key in the scheme's display format (zpub for BIP84, ...).
    pub fn extended_public_key(&self) -> &str {
        self.xpub_string.get_or_init(|| {
            ext_key::encode_xpub(&self.account_xpub, self.script_type.xpub_version(self.network))
        })
    }

    /// Extended public key in an explicit format.
    pub fn extended_public_key_as(&self, version: KeyVersion) -> String {
        ext_key::encode_xpub(&self.account_xpub, version)
    }

    fn chain_node(&self, chain: Chain) -> Result<&Xpub> {
        let slot = &self.chain_nodes[chain.slot()];
        if let Some(node) = slot.get() {
            return Ok(node);
        }
        let node = self.account_xpub.derive_pub(
            &self.secp,
            &[ChildNumber::Normal {
                index: chain.index(),
            }],
        )?;
        Ok(slot.get_or_init(|| node))
    }

    /// Public key at `chain/index`.
    pub fn derive_public_key(&self, chain: Chain, index: u32) -> Result<CompressedPublicKey> {
        let index = ChildNumber::from_normal_idx(index).map_err(|_| {
            Error::InvalidDerivationPath(format!("address index {} out of range", index))
        })?;
        let node = self.chain_node(chain)?.derive_pub(&self.secp, &[index])?;
        Ok(node.to_pub())
    }

    /// Address at `chain/index`.
    pub fn derive_address(&self, chain: Chain, index: u32) -> Result<Address> {
        let pubkey = self.derive_public_key(chain, index)?;
        Ok(self.script_type.address(&pubkey, self.network))
    }

    /// Signing key at `chain/index`. Fails with [`Error::NoSecret`] for watch-only keychains.
    pub fn derive_private_key(&self, chain: Chain, index: u32) -> Result<PrivateKey> {
        let xpriv = self.account_xpriv.as_ref().ok_or(Error::NoSecret)?;
        let child = xpriv.derive_priv(&self.secp, &chain_index_path(chain, index)?)?;
        Ok(PrivateKey::new(child.private_key, self.network))
    }

    /// Full path of `chain/index` from the master key.
    pub fn full_path(&self, chain: Chain, index: u32) -> Result<DerivationPath> {
        Ok(self.account_path.extend(chain_index_path(chain, index)?))
    }

    /// Secp256k1 context shared by this keychain.
    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }
}
