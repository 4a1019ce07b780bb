//! Key material of a wallet
//!
//! A wallet is backed by exactly one of: an HD account, a single imported key, or
//! a multisig quorum. [`WalletKeys`] dispatches address rendering, key lookup and
//! transaction building to the right one.

use bitcoin::bip32::Fingerprint;
use bitcoin::{Address, Network, PrivateKey};

use crate::address_cache::AddressSource;
use crate::derivation::{Chain, HdKeyChain};
use crate::error::{Error, Result};
use crate::multisig::Quorum;
use crate::script_type::ScriptType;
use crate::single_key::SingleKey;
use crate::transaction_builder::{CreatedTransaction, KeyProvider, PublicKeyInfo, TransactionBuilder};
use crate::utxo::{KeyRef, Utxo};

impl KeyProvider for HdKeyChain {
    fn script_type(&self) -> ScriptType {
        HdKeyChain::script_type(self)
    }

    fn public_key(&self, key: KeyRef) -> Result<PublicKeyInfo> {
        let KeyRef::Derived {
            chain,
            index,
        } = key
        else {
            return Err(Error::SigningKeyNotFound("no imported key in an HD wallet".into()));
        };
        let fingerprint = self.master_fingerprint().unwrap_or_else(|| Fingerprint::from([0u8; 4]));
        Ok(PublicKeyInfo {
            script_type: HdKeyChain::script_type(self),
            pubkey: self.derive_public_key(chain, index)?,
            origin: Some((fingerprint, self.full_path(chain, index)?)),
        })
    }

    fn private_key(&self, key: KeyRef) -> Result<PrivateKey> {
        match key {
            KeyRef::Derived {
                chain,
                index,
            } => self.derive_private_key(chain, index),
            KeyRef::Imported => Err(Error::SigningKeyNotFound("no imported key in an HD wallet".into())),
        }
    }
}

impl KeyProvider for SingleKey {
    fn script_type(&self) -> ScriptType {
        SingleKey::script_type(self)
    }

    fn public_key(&self, _key: KeyRef) -> Result<PublicKeyInfo> {
        Ok(PublicKeyInfo {
            script_type: SingleKey::script_type(self),
            pubkey: self.compressed_public_key(),
            origin: None,
        })
    }

    fn private_key(&self, _key: KeyRef) -> Result<PrivateKey> {
        Ok(*SingleKey::private_key(self))
    }
}

/// The key material behind a wallet.
#[derive(Debug, Clone)]
pub enum WalletKeys {
    Hd(HdKeyChain),
    Single(SingleKey),
    Multisig(Quorum),
}

impl WalletKeys {
    pub fn network(&self) -> Network {
        match self {
            WalletKeys::Hd(keychain) => keychain.network(),
            WalletKeys::Single(key) => key.network(),
            WalletKeys::Multisig(quorum) => quorum.network(),
        }
    }

    /// Short name of the wallet kind.
    pub fn kind(&self) -> String {
        match self {
            WalletKeys::Hd(keychain) => format!("HD {}", keychain.script_type()),
            WalletKeys::Single(key) => format!("single key {}", key.script_type()),
            WalletKeys::Multisig(quorum) => format!("{}-of-{} {}", quorum.m(), quorum.n(), quorum.format()),
        }
    }

    /// Whether any transaction can be signed locally.
    pub fn has_secret(&self) -> bool {
        match self {
            WalletKeys::Hd(keychain) => keychain.has_secret(),
            WalletKeys::Single(_) => true,
            WalletKeys::Multisig(quorum) => quorum.cosigners().iter().any(|c| c.can_sign()),
        }
    }

    /// Single-key wallets have one address and nothing to discover.
    pub fn is_single_address(&self) -> bool {
        matches!(self, WalletKeys::Single(_))
    }

    /// Whether the wallet's outputs are spent with witness data.
    pub fn is_segwit(&self) -> bool {
        match self {
            WalletKeys::Hd(keychain) => keychain.script_type().is_segwit(),
            WalletKeys::Single(key) => key.script_type().is_segwit(),
            WalletKeys::Multisig(quorum) => quorum.format().is_segwit(),
        }
    }

    /// Key reference of the output at `chain/index`.
    pub fn key_ref(&self, chain: Chain, index: u32) -> KeyRef {
        match self {
            WalletKeys::Single(_) => KeyRef::Imported,
            _ => KeyRef::Derived {
                chain,
                index,
            },
        }
    }

    pub fn derive_address(&self, chain: Chain, index: u32) -> Result<Address> {
        match self {
            WalletKeys::Hd(keychain) => keychain.derive_address(chain, index),
            WalletKeys::Single(key) => Ok(key.address()),
            WalletKeys::Multisig(quorum) => quorum.derive_address(chain, index),
        }
    }

    /// Signing key at `chain/index`. Fails with [`Error::NoSecret`] for watch-only keys.
    pub fn derive_private_key(&self, chain: Chain, index: u32) -> Result<PrivateKey> {
        match self {
            WalletKeys::Hd(keychain) => keychain.derive_private_key(chain, index),
            WalletKeys::Single(key) => Ok(*key.private_key()),
            WalletKeys::Multisig(_) => Err(Error::UnsupportedScriptType("multisig has no single signing key".into())),
        }
    }

    /// Account extended public key, for HD wallets.
    pub fn extended_public_key(&self) -> Option<&str> {
        match self {
            WalletKeys::Hd(keychain) => Some(keychain.extended_public_key()),
            _ => None,
        }
    }

    pub fn master_fingerprint(&self) -> Option<Fingerprint> {
        match self {
            WalletKeys::Hd(keychain) => keychain.master_fingerprint(),
            _ => None,
        }
    }

    /// Build (and sign, where keys allow) a transaction spending `utxos`.
    pub fn build_transaction(&self, builder: &TransactionBuilder, utxos: &[Utxo]) -> Result<CreatedTransaction> {
        match self {
            WalletKeys::Hd(keychain) => builder.build(utxos, keychain),
            WalletKeys::Single(key) => builder.build(utxos, key),
            WalletKeys::Multisig(quorum) => builder.build_multisig(utxos, quorum),
        }
    }
}

impl AddressSource for WalletKeys {
    fn address_at(&self, chain: Chain, index: u32) -> Result<String> {
        self.derive_address(chain, index).map(|a| a.to_string())
    }
}

impl From<HdKeyChain> for WalletKeys {
    fn from(keychain: HdKeyChain) -> Self {
        WalletKeys::Hd(keychain)
    }
}

impl From<SingleKey> for WalletKeys {
    fn from(key: SingleKey) -> Self {
        WalletKeys::Single(key)
    }
}

impl From<Quorum> for WalletKeys {
    fn from(quorum: Quorum) -> Self {
        WalletKeys::Multisig(quorum)
    }
}
