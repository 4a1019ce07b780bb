//! Single private key (WIF) wallets.

use core::str::FromStr;

use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, CompressedPublicKey, Network, PrivateKey};

use crate::error::{Error, Result};
use crate::script_type::ScriptType;

/// A WIF-imported key rendered under one script type.
#[derive(Debug, Clone)]
pub struct SingleKey {
    key: PrivateKey,
    pubkey: CompressedPublicKey,
    script_type: ScriptType,
}

impl SingleKey {
    /// Import a WIF key. Uncompressed keys are rejected: their P2PKH address
    /// hashes a different public key than the one every signing path uses.
    pub fn from_wif(wif: &str, script_type: ScriptType) -> Result<Self> {
        let key = PrivateKey::from_wif(wif.trim())?;
        Self::new(key, script_type)
    }

    pub fn new(key: PrivateKey, script_type: ScriptType) -> Result<Self> {
        let secp = Secp256k1::new();
        if !key.compressed {
            return Err(Error::InvalidKey("uncompressed WIF keys are not supported".into()));
        }
        let pubkey = CompressedPublicKey(key.inner.public_key(&secp));
        Ok(Self {
            key,
            pubkey,
            script_type,
        })
    }

    pub fn script_type(&self) -> ScriptType {
        self.script_type
    }

    pub fn network(&self) -> Network {
        match self.key.network {
            bitcoin::NetworkKind::Main => Network::Bitcoin,
            bitcoin::NetworkKind::Test => Network::Testnet,
        }
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.key
    }

    pub fn public_key(&self) -> bitcoin::PublicKey {
        self.key.public_key(&Secp256k1::<All>::new())
    }

    pub fn compressed_public_key(&self) -> CompressedPublicKey {
        self.pubkey
    }

    /// The single address of this key.
    pub fn address(&self) -> Address {
        match self.script_type {
            ScriptType::P2pkh => Address::p2pkh(self.public_key().pubkey_hash(), self.network()),
            other => other.address(&self.pubkey, self.network()),
        }
    }

    /// Whether `address` is this key's address.
    pub fn owns(&self, address: &str) -> bool {
        Address::from_str(address)
            .ok()
            .map(|a| a.assume_checked() == self.address())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIF: &str = "Kxr9tQED9H44gCmp6HAdmemAzU3n84H3dGkuWTKvE23JgHMW8gct";

    #[test]
    fn test_wif_addresses() {
        let legacy = SingleKey::from_wif(WIF, ScriptType::P2pkh).unwrap();
        assert_eq!(legacy.address().to_string(), "19AAjaTUbRjQCMuVczepkoPswiZRhjtg31");

        let wrapped = SingleKey::from_wif(WIF, ScriptType::P2shP2wpkh).unwrap();
        assert_eq!(wrapped.address().to_string(), "34AgLJhwXrvmkZS1o5TrcdeevMt22Nar53");

        let native = SingleKey::from_wif(WIF, ScriptType::P2wpkh).unwrap();
        assert!(native.address().to_string().starts_with("bc1q"));
        assert!(native.owns(&native.address().to_string()));
        assert!(!native.owns("34AgLJhwXrvmkZS1o5TrcdeevMt22Nar53"));
    }

    #[test]
    fn test_bad_wif() {
        assert!(matches!(SingleKey::from_wif("not-a-key", ScriptType::P2pkh), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn test_uncompressed_wif_rejected() {
        let mut key = PrivateKey::from_wif(WIF).unwrap();
        key.compressed = false;
        let uncompressed = key.to_wif();
        for script_type in ScriptType::ALL {
            assert!(matches!(SingleKey::from_wif(&uncompressed, script_type), Err(Error::InvalidKey(_))));
        }
    }
}
