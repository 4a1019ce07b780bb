//! Wallet import strategies
//!
//! A piece of user input (mnemonic, WIF, extended key, multisig setup file, JSON
//! keystore) can describe several wallets. [`strategies`] lists every way of
//! reading it in the order they are tried; each [`Strategy`] is a predicate plus a
//! constructor. Deciding which candidates to keep needs chain data and happens in
//! the async import coordinator.

use core::fmt;

use bitcoin::bip32::Fingerprint;
use bitcoin::{Network, NetworkKind, PrivateKey};
use serde_json::{Map, Value};

use crate::derivation::HdKeyChain;
use crate::error::{Error, Result};
use crate::ext_key::{self, KeyFamily, KeyVersion};
use crate::keys::WalletKeys;
use crate::mnemonic;
use crate::multisig::{cosigner, setup};
use crate::script_type::{parse_path, ScriptType};
use crate::single_key::SingleKey;

/// Options shared by all strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOptions {
    pub network: Network,
    /// BIP39 passphrase
    pub passphrase: String,
}

impl ImportOptions {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            passphrase: String::new(),
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = passphrase.into();
        self
    }
}

/// Strategies reading the same input in alternative ways form a group. Within a
/// group, candidates that need a usage check are kept only if used; when none is
/// used the group falls back per [`Group::fallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Multisig,
    Mnemonic,
    Wif,
    WatchOnly,
    Keystore,
}

/// What a group keeps when none of its candidates has been used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// The first candidate, e.g. the BIP84 wallet of a fresh mnemonic
    First,
    /// Every candidate
    All,
}

impl Group {
    pub fn fallback(self) -> Fallback {
        match self {
            Group::Wif => Fallback::All,
            _ => Fallback::First,
        }
    }
}

/// One way of reading import input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Multisig descriptor, text setup or Electrum multisig JSON
    MultisigSetup,
    /// BIP39 mnemonic at the default account of a script type
    Mnemonic(ScriptType),
    /// WIF private key under a script type
    Wif(ScriptType),
    /// Account extended public key read as a script type
    ExtendedKey(ScriptType),
    /// Electrum or Cobo/Keystone JSON keystore, or an array of them
    Keystore,
}

/// The import table, in the order strategies are tried.
pub fn strategies() -> Vec<Strategy> {
    let mut table = vec![Strategy::MultisigSetup];
    // BIP84 first: it is the fallback for an unused mnemonic
    table.extend(ScriptType::ALL.iter().map(|st| Strategy::Mnemonic(*st)));
    table.extend(ScriptType::ALL.iter().map(|st| Strategy::Wif(*st)));
    table.extend([ScriptType::P2pkh, ScriptType::P2shP2wpkh, ScriptType::P2wpkh].map(Strategy::ExtendedKey));
    table.push(Strategy::Keystore);
    table
}

impl Strategy {
    pub fn group(&self) -> Group {
        match self {
            Strategy::MultisigSetup => Group::Multisig,
            Strategy::Mnemonic(_) => Group::Mnemonic,
            Strategy::Wif(_) => Group::Wif,
            Strategy::ExtendedKey(_) => Group::WatchOnly,
            Strategy::Keystore => Group::Keystore,
        }
    }

    /// Whether this strategy can read `input`.
    pub fn matches(&self, input: &str) -> bool {
        let input = input.trim();
        match self {
            Strategy::MultisigSetup => setup::is_setup(input),
            Strategy::Mnemonic(_) => mnemonic::validate(input),
            Strategy::Wif(_) => PrivateKey::from_wif(input).is_ok_and(|key| key.compressed),
            Strategy::ExtendedKey(script_type) => match KeyVersion::from_prefix(input) {
                Some(version) if !version.is_private() => match version.family() {
                    // a plain xpub is tried under every single-sig script type
                    KeyFamily::Legacy => true,
                    family => family == script_type.key_family(),
                },
                _ => false,
            },
            Strategy::Keystore => keystore_records(input).is_some(),
        }
    }

    /// Whether a candidate from this strategy is kept only if it has history.
    pub fn needs_usage_check(&self, input: &str) -> bool {
        match self {
            Strategy::Mnemonic(_) | Strategy::Wif(_) => true,
            Strategy::ExtendedKey(_) => {
                KeyVersion::from_prefix(input.trim()).is_some_and(|v| v.family() == KeyFamily::Legacy)
            }
            Strategy::MultisigSetup | Strategy::Keystore => false,
        }
    }

    /// Build every wallet this strategy reads from `input`.
    pub fn build(&self, input: &str, options: &ImportOptions) -> Result<Vec<WalletKeys>> {
        let input = input.trim();
        let network = options.network;
        match self {
            Strategy::MultisigSetup => Ok(vec![setup::import(input, network)?.into()]),
            Strategy::Mnemonic(script_type) => {
                let keychain = HdKeyChain::from_mnemonic(input, &options.passphrase, *script_type, network)?;
                Ok(vec![keychain.into()])
            }
            Strategy::Wif(script_type) => {
                let key = SingleKey::from_wif(input, *script_type)?;
                if NetworkKind::from(key.network()) != NetworkKind::from(network) {
                    return Err(Error::InvalidKey(format!("key is not for {}", network)));
                }
                Ok(vec![key.into()])
            }
            Strategy::ExtendedKey(script_type) => {
                let (xpub, _) = ext_key::parse_xpub(input)?;
                Ok(vec![HdKeyChain::from_account_xpub(xpub, *script_type, network)?.into()])
            }
            Strategy::Keystore => {
                let records = keystore_records(input).ok_or_else(|| Error::InvalidKey("not a keystore".into()))?;
                records.iter().map(|record| keystore_wallet(record, network).map(WalletKeys::from)).collect()
            }
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::MultisigSetup => write!(f, "multisignature"),
            Strategy::Mnemonic(script_type) => write!(f, "bip39 {}", script_type),
            Strategy::Wif(script_type) => write!(f, "wif {}", script_type),
            Strategy::ExtendedKey(script_type) => write!(f, "watch only {}", script_type),
            Strategy::Keystore => write!(f, "keystore"),
        }
    }
}

/// Account records of a JSON keystore: Electrum `{"keystore": {...}}`, a flat
/// Cobo/Keystone record, or an array of either.
fn keystore_records(input: &str) -> Option<Vec<Map<String, Value>>> {
    fn record(value: &Value) -> Option<Map<String, Value>> {
        let object = value.as_object()?;
        if let Some(keystore) = object.get("keystore").and_then(Value::as_object) {
            return keystore.contains_key("xpub").then(|| keystore.clone());
        }
        (object.contains_key("ExtPubKey") || object.contains_key("xpub")).then(|| object.clone())
    }

    match serde_json::from_str::<Value>(input).ok()? {
        Value::Array(items) => {
            let records: Vec<_> = items.iter().filter_map(record).collect();
            (!records.is_empty()).then_some(records)
        }
        value => record(&value).map(|r| vec![r]),
    }
}

const PATH_FIELDS: [&str; 4] = ["derivation", "path", "deriv", "AccountKeyPath"];

fn keystore_wallet(record: &Map<String, Value>, network: Network) -> Result<HdKeyChain> {
    let key = cosigner::parse_record(record)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::InvalidKey("empty keystore".into()))?;
    let path = PATH_FIELDS.iter().find_map(|name| record.get(*name).and_then(Value::as_str)).map(parse_path).transpose()?;

    // the key format decides the script type, or the BIP43 purpose for plain xpubs
    let script_type = match ScriptType::from_key_version(key.version) {
        Some(ScriptType::P2pkh) | None => path
            .as_ref()
            .and_then(|p| p.as_ref().first().copied())
            .and_then(|purpose| ScriptType::ALL.into_iter().find(|st| purpose == purpose_step(*st)))
            .unwrap_or(ScriptType::P2pkh),
        Some(script_type) => script_type,
    };

    let mut keychain = HdKeyChain::from_account_xpub(key.xpub, script_type, network)?;
    if let Some(path) = path {
        keychain = keychain.with_account_path(path);
    }
    if key.fingerprint != Fingerprint::from([0u8; 4]) {
        keychain = keychain.with_master_fingerprint(key.fingerprint);
    }
    Ok(keychain)
}

fn purpose_step(script_type: ScriptType) -> bitcoin::bip32::ChildNumber {
    bitcoin::bip32::ChildNumber::Hardened {
        index: script_type.purpose(),
    }
}
