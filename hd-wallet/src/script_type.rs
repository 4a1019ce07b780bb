//! Single-signature wallet schemes.
//!
//! Each variant supplies its BIP purpose (path template), extended-key format and
//! address rendering.

use core::fmt;
use core::str::FromStr;

use bitcoin::bip32::{ChildNumber, DerivationPath};
use bitcoin::{Address, CompressedPublicKey, Network, NetworkKind, ScriptBuf};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ext_key::{KeyFamily, KeyVersion};

/// Script type of a single-signature wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum ScriptType {
    /// BIP44 pay-to-pubkey-hash
    P2pkh,
    /// BIP49 P2WPKH nested in P2SH
    P2shP2wpkh,
    /// BIP84 native segwit v0
    P2wpkh,
}

impl ScriptType {
    pub const ALL: [ScriptType; 3] = [ScriptType::P2wpkh, ScriptType::P2shP2wpkh, ScriptType::P2pkh];

    /// BIP43 purpose field.
    pub fn purpose(self) -> u32 {
        match self {
            ScriptType::P2pkh => 44,
            ScriptType::P2shP2wpkh => 49,
            ScriptType::P2wpkh => 84,
        }
    }

    /// Account-level path, `m/purpose'/coin'/account'`.
    pub fn account_path(self, network: Network, account: u32) -> Result<DerivationPath> {
        let coin = if network == Network::Bitcoin {
            0
        } else {
            1
        };
        let children = [self.purpose(), coin, account]
            .into_iter()
            .map(ChildNumber::from_hardened_idx)
            .collect::<core::result::Result<Vec<_>, _>>()?;
        Ok(DerivationPath::from(children))
    }

    /// Default account path for account 0.
    pub fn default_path(self, network: Network) -> DerivationPath {
        // purpose and coin are constants below 2^31
        self.account_path(network, 0).unwrap_or_else(|_| DerivationPath::master())
    }

    /// Extended key family used when displaying this scheme's account key.
    pub fn key_family(self) -> KeyFamily {
        match self {
            ScriptType::P2pkh => KeyFamily::Legacy,
            ScriptType::P2shP2wpkh => KeyFamily::WrappedSegwit,
            ScriptType::P2wpkh => KeyFamily::NativeSegwit,
        }
    }

    /// Public extended key version for this scheme.
    pub fn xpub_version(self, network: Network) -> KeyVersion {
        KeyVersion::for_family(self.key_family(), NetworkKind::from(network), false)
    }

    /// Scheme implied by an extended key format, if it is a single-sig one.
    pub fn from_key_version(version: KeyVersion) -> Option<Self> {
        match version.family() {
            KeyFamily::Legacy => Some(ScriptType::P2pkh),
            KeyFamily::WrappedSegwit => Some(ScriptType::P2shP2wpkh),
            KeyFamily::NativeSegwit => Some(ScriptType::P2wpkh),
            _ => None,
        }
    }

    /// Render the address of a public key.
    pub fn address(self, pubkey: &CompressedPublicKey, network: Network) -> Address {
        match self {
            ScriptType::P2pkh => Address::p2pkh(pubkey.pubkey_hash(), network),
            ScriptType::P2shP2wpkh => Address::p2shwpkh(pubkey, network),
            ScriptType::P2wpkh => Address::p2wpkh(pubkey, network),
        }
    }

    /// Redeem script for P2SH-wrapped segwit spends.
    pub fn redeem_script(self, pubkey: &CompressedPublicKey) -> Option<ScriptBuf> {
        match self {
            ScriptType::P2shP2wpkh => Some(ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash())),
            _ => None,
        }
    }

    /// Detect the scheme of an output script.
    pub fn from_script(script: &bitcoin::Script) -> Option<Self> {
        if script.is_p2pkh() {
            Some(ScriptType::P2pkh)
        } else if script.is_p2wpkh() {
            Some(ScriptType::P2wpkh)
        } else if script.is_p2sh() {
            Some(ScriptType::P2shP2wpkh)
        } else {
            None
        }
    }

    /// Length of the script data an input of this type carries, as coin selection counts it.
    pub fn input_script_len(self) -> usize {
        match self {
            ScriptType::P2pkh => 107,
            ScriptType::P2shP2wpkh => 50,
            ScriptType::P2wpkh => 27,
        }
    }

    /// Whether spends carry witness data.
    pub fn is_segwit(self) -> bool {
        !matches!(self, ScriptType::P2pkh)
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScriptType::P2pkh => "p2pkh",
            ScriptType::P2shP2wpkh => "p2wpkh-p2sh",
            ScriptType::P2wpkh => "p2wpkh",
        };
        f.write_str(s)
    }
}

impl FromStr for ScriptType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "p2pkh" => Ok(ScriptType::P2pkh),
            "p2wpkh-p2sh" | "p2sh-p2wpkh" => Ok(ScriptType::P2shP2wpkh),
            "p2wpkh" => Ok(ScriptType::P2wpkh),
            other => Err(Error::UnsupportedScriptType(other.to_string())),
        }
    }
}

/// Render a derivation path as `m/84'/0'/0'`.
pub fn path_to_string(path: &DerivationPath) -> String {
    let mut out = String::from("m");
    for child in path.as_ref() {
        out.push('/');
        out.push_str(&child.to_string());
    }
    out
}

/// Parse a derivation path, accepting `'`, `h` or `H` as the hardened marker and an
/// optional leading `m/`.
pub fn parse_path(path: &str) -> Result<DerivationPath> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidDerivationPath("empty path".into()));
    }
    let body = trimmed.strip_prefix('m').unwrap_or(trimmed);
    let body = body.strip_prefix('/').unwrap_or(body);
    let mut children = Vec::new();
    for segment in body.split('/').filter(|s| !s.is_empty()) {
        let (digits, hardened) = match segment.strip_suffix(['\'', 'h', 'H']) {
            Some(d) => (d, true),
            None => (segment, false),
        };
        let index: u32 = digits
            .parse()
            .map_err(|_| Error::InvalidDerivationPath(format!("bad segment {:?} in {}", segment, path)))?;
        let child = if hardened {
            ChildNumber::from_hardened_idx(index)
        } else {
            ChildNumber::from_normal_idx(index)
        }
        .map_err(|_| Error::InvalidDerivationPath(format!("index out of range in {}", path)))?;
        children.push(child);
    }
    Ok(DerivationPath::from(children))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        assert_eq!(path_to_string(&ScriptType::P2wpkh.default_path(Network::Bitcoin)), "m/84'/0'/0'");
        assert_eq!(path_to_string(&ScriptType::P2shP2wpkh.default_path(Network::Bitcoin)), "m/49'/0'/0'");
        assert_eq!(path_to_string(&ScriptType::P2pkh.default_path(Network::Testnet)), "m/44'/1'/0'");
    }

    #[test]
    fn test_parse_path_variants() {
        let a = parse_path("m/48'/0'/0'/2'").unwrap();
        let b = parse_path("m/48h/0h/0h/2h").unwrap();
        let c = parse_path("48'/0'/0'/2'").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(path_to_string(&a), "m/48'/0'/0'/2'");
        assert_eq!(parse_path("m").unwrap(), DerivationPath::master());
    }

    #[test]
    fn test_parse_path_rejects_garbage() {
        assert!(parse_path("").is_err());
        assert!(parse_path("m/44'/x/0").is_err());
        assert!(parse_path("m/2147483648").is_err());
    }

    #[test]
    fn test_script_type_names() {
        for ty in ScriptType::ALL {
            assert_eq!(ty.to_string().parse::<ScriptType>().unwrap(), ty);
        }
        assert_eq!(ScriptType::P2wpkh.xpub_version(Network::Bitcoin), KeyVersion::Zpub);
        assert_eq!(ScriptType::P2shP2wpkh.xpub_version(Network::Testnet), KeyVersion::Upub);
    }
}
