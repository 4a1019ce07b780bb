//! Extended key version bytes
//!
//! BIP32 serializes extended keys as 78 bytes: a 4-byte version followed by depth,
//! parent fingerprint, child number, chain code and key. SLIP-132 assigns a distinct
//! version to each script type (xpub/ypub/zpub and their multisig and testnet
//! counterparts). Conversion between formats swaps only the version, the other 74
//! bytes are carried over untouched.

use core::fmt;
use core::str::FromStr;

use bitcoin::base58;
use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::NetworkKind;

use crate::error::{Error, Result};

/// Length of a serialized extended key.
pub const EXTENDED_KEY_LEN: usize = 78;

/// Known extended key serialization formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyVersion {
    Xpub,
    Ypub,
    Zpub,
    /// P2SH-P2WSH multisig (`Ypub`)
    YpubMultisig,
    /// P2WSH multisig (`Zpub`)
    ZpubMultisig,
    Xprv,
    Yprv,
    Zprv,
    YprvMultisig,
    ZprvMultisig,
    Tpub,
    Upub,
    Vpub,
    UpubMultisig,
    VpubMultisig,
    Tprv,
    Uprv,
    Vprv,
    UprvMultisig,
    VprvMultisig,
}

const VERSIONS: [(KeyVersion, [u8; 4], &str); 20] = [
    (KeyVersion::Xpub, [0x04, 0x88, 0xb2, 0x1e], "xpub"),
    (KeyVersion::Ypub, [0x04, 0x9d, 0x7c, 0xb2], "ypub"),
    (KeyVersion::Zpub, [0x04, 0xb2, 0x47, 0x46], "zpub"),
    (KeyVersion::YpubMultisig, [0x02, 0x95, 0xb4, 0x3f], "Ypub"),
    (KeyVersion::ZpubMultisig, [0x02, 0xaa, 0x7e, 0xd3], "Zpub"),
    (KeyVersion::Xprv, [0x04, 0x88, 0xad, 0xe4], "xprv"),
    (KeyVersion::Yprv, [0x04, 0x9d, 0x78, 0x78], "yprv"),
    (KeyVersion::Zprv, [0x04, 0xb2, 0x43, 0x0c], "zprv"),
    (KeyVersion::YprvMultisig, [0x02, 0x95, 0xb0, 0x05], "Yprv"),
    (KeyVersion::ZprvMultisig, [0x02, 0xaa, 0x7a, 0x99], "Zprv"),
    (KeyVersion::Tpub, [0x04, 0x35, 0x87, 0xcf], "tpub"),
    (KeyVersion::Upub, [0x04, 0x4a, 0x52, 0x62], "upub"),
    (KeyVersion::Vpub, [0x04, 0x5f, 0x1c, 0xf6], "vpub"),
    (KeyVersion::UpubMultisig, [0x02, 0x42, 0x89, 0xef], "Upub"),
    (KeyVersion::VpubMultisig, [0x02, 0x57, 0x54, 0x83], "Vpub"),
    (KeyVersion::Tprv, [0x04, 0x35, 0x83, 0x94], "tprv"),
    (KeyVersion::Uprv, [0x04, 0x4a, 0x4e, 0x28], "uprv"),
    (KeyVersion::Vprv, [0x04, 0x5f, 0x18, 0xbc], "vprv"),
    (KeyVersion::UprvMultisig, [0x02, 0x42, 0x85, 0xb5], "Uprv"),
    (KeyVersion::VprvMultisig, [0x02, 0x57, 0x50, 0x48], "Vprv"),
];

/// The script family an extended key format is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    /// xpub: P2PKH or legacy P2SH multisig
    Legacy,
    /// ypub: P2SH-P2WPKH
    WrappedSegwit,
    /// zpub: P2WPKH
    NativeSegwit,
    /// Ypub: P2SH-P2WSH multisig
    WrappedSegwitMultisig,
    /// Zpub: P2WSH multisig
    NativeSegwitMultisig,
}

impl KeyVersion {
    /// The 4 version bytes.
    pub fn bytes(self) -> [u8; 4] {
        VERSIONS.iter().find(|(v, _, _)| *v == self).map(|(_, b, _)| *b).unwrap_or([0; 4])
    }

    /// Look up a version by its 4 bytes.
    pub fn from_bytes(bytes: [u8; 4]) -> Option<Self> {
        VERSIONS.iter().find(|(_, b, _)| *b == bytes).map(|(v, _, _)| *v)
    }

    /// The four-letter prefix this version produces in base58.
    pub fn prefix(self) -> &'static str {
        VERSIONS.iter().find(|(v, _, _)| *v == self).map(|(_, _, p)| *p).unwrap_or("")
    }

    /// Guess the version from the string prefix of an encoded key.
    pub fn from_prefix(encoded: &str) -> Option<Self> {
        let prefix = encoded.get(..4)?;
        VERSIONS.iter().find(|(_, _, p)| *p == prefix).map(|(v, _, _)| *v)
    }

    /// Whether the version tags a private key.
    pub fn is_private(self) -> bool {
        self.prefix().ends_with("prv")
    }

    /// Network kind the version belongs to.
    pub fn network_kind(self) -> NetworkKind {
        use KeyVersion::*;
        match self {
            Tpub | Upub | Vpub | UpubMultisig | VpubMultisig | Tprv | Uprv | Vprv
            | UprvMultisig | VprvMultisig => NetworkKind::Test,
            _ => NetworkKind::Main,
        }
    }

    /// The script family the version signals.
    pub fn family(self) -> KeyFamily {
        use KeyVersion::*;
        match self {
            Xpub | Xprv | Tpub | Tprv => KeyFamily::Legacy,
            Ypub | Yprv | Upub | Uprv => KeyFamily::WrappedSegwit,
            Zpub | Zprv | Vpub | Vprv => KeyFamily::NativeSegwit,
            YpubMultisig | YprvMultisig | UpubMultisig | UprvMultisig => {
                KeyFamily::WrappedSegwitMultisig
            }
            ZpubMultisig | ZprvMultisig | VpubMultisig | VprvMultisig => {
                KeyFamily::NativeSegwitMultisig
            }
        }
    }

    /// Public/private, network and family identify exactly one version.
    pub fn for_family(family: KeyFamily, network: NetworkKind, private: bool) -> Self {
        use KeyVersion::*;
        let main = network == NetworkKind::Main;
        match (family, main, private) {
            (KeyFamily::Legacy, true, false) => Xpub,
            (KeyFamily::Legacy, true, true) => Xprv,
            (KeyFamily::Legacy, false, false) => Tpub,
            (KeyFamily::Legacy, false, true) => Tprv,
            (KeyFamily::WrappedSegwit, true, false) => Ypub,
            (KeyFamily::WrappedSegwit, true, true) => Yprv,
            (KeyFamily::WrappedSegwit, false, false) => Upub,
            (KeyFamily::WrappedSegwit, false, true) => Uprv,
            (KeyFamily::NativeSegwit, true, false) => Zpub,
            (KeyFamily::NativeSegwit, true, true) => Zprv,
            (KeyFamily::NativeSegwit, false, false) => Vpub,
            (KeyFamily::NativeSegwit, false, true) => Vprv,
            (KeyFamily::WrappedSegwitMultisig, true, false) => YpubMultisig,
            (KeyFamily::WrappedSegwitMultisig, true, true) => YprvMultisig,
            (KeyFamily::WrappedSegwitMultisig, false, false) => UpubMultisig,
            (KeyFamily::WrappedSegwitMultisig, false, true) => UprvMultisig,
            (KeyFamily::NativeSegwitMultisig, true, false) => ZpubMultisig,
            (KeyFamily::NativeSegwitMultisig, true, true) => ZprvMultisig,
            (KeyFamily::NativeSegwitMultisig, false, false) => VpubMultisig,
            (KeyFamily::NativeSegwitMultisig, false, true) => VprvMultisig,
        }
    }

    /// The plain BIP32 version (xpub/xprv/tpub/tprv) with the same network and privacy.
    pub fn canonical(self) -> Self {
        Self::for_family(KeyFamily::Legacy, self.network_kind(), self.is_private())
    }
}

impl fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A decoded 78-byte extended key payload together with its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedKeyPayload {
    pub version: KeyVersion,
    pub data: [u8; EXTENDED_KEY_LEN],
}

impl ExtendedKeyPayload {
    /// The 74 bytes following the version prefix.
    pub fn body(&self) -> &[u8] {
        &self.data[4..]
    }

    /// Replace the version prefix, leaving every other byte untouched.
    pub fn with_version(&self, version: KeyVersion) -> Self {
        let mut data = self.data;
        data[..4].copy_from_slice(&version.bytes());
        Self {
            version,
            data,
        }
    }

    /// Base58check encoding of the payload.
    pub fn encode(&self) -> String {
        base58::encode_check(&self.data)
    }
}

impl FromStr for ExtendedKeyPayload {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = base58::decode_check(s.trim())
            .map_err(|e| Error::InvalidKey(format!("base58: {}", e)))?;
        if raw.len() != EXTENDED_KEY_LEN {
            return Err(Error::InvalidKey(format!(
                "extended key must be {} bytes, got {}",
                EXTENDED_KEY_LEN,
                raw.len()
            )));
        }
        let mut data = [0u8; EXTENDED_KEY_LEN];
        data.copy_from_slice(&raw);
        let version = KeyVersion::from_bytes([data[0], data[1], data[2], data[3]])
            .ok_or_else(|| Error::InvalidKey(format!("unknown version bytes {}", hex::encode(&data[..4]))))?;
        Ok(Self {
            version,
            data,
        })
    }
}

/// Re-encode an extended key under another version of the same privacy.
pub fn convert(encoded: &str, target: KeyVersion) -> Result<String> {
    let payload: ExtendedKeyPayload = encoded.parse()?;
    if payload.version.is_private() != target.is_private() {
        return Err(Error::InvalidKey(format!(
            "cannot convert {} into {}",
            payload.version, target
        )));
    }
    Ok(payload.with_version(target).encode())
}

/// Convert any known format into the plain BIP32 form (xpub/xprv/tpub/tprv).
pub fn canonicalize(encoded: &str) -> Result<String> {
    let payload: ExtendedKeyPayload = encoded.parse()?;
    Ok(payload.with_version(payload.version.canonical()).encode())
}

/// Parse an extended public key in any known format.
pub fn parse_xpub(encoded: &str) -> Result<(Xpub, KeyVersion)> {
    let payload: ExtendedKeyPayload = encoded.parse()?;
    if payload.version.is_private() {
        return Err(Error::InvalidKey(format!("expected a public key, got {}", payload.version)));
    }
    let canonical = payload.with_version(payload.version.canonical());
    let xpub = Xpub::decode(&canonical.data)?;
    Ok((xpub, payload.version))
}

/// Parse an extended private key in any known format.
pub fn parse_xpriv(encoded: &str) -> Result<(Xpriv, KeyVersion)> {
    let payload: ExtendedKeyPayload = encoded.parse()?;
    if !payload.version.is_private() {
        return Err(Error::InvalidKey(format!("expected a private key, got {}", payload.version)));
    }
    let canonical = payload.with_version(payload.version.canonical());
    let xpriv = Xpriv::decode(&canonical.data)?;
    Ok((xpriv, payload.version))
}

/// Encode an extended public key under the given version.
pub fn encode_xpub(xpub: &Xpub, version: KeyVersion) -> String {
    let mut data = xpub.encode();
    data[..4].copy_from_slice(&version.bytes());
    base58::encode_check(&data)
}

/// Whether the string decodes as an extended public key of any known format.
pub fn is_valid_xpub(encoded: &str) -> bool {
    parse_xpub(encoded).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZPUB: &str = "zpub6rFR7y4Q2AijBEqTUquhVz398htDFrtymD9xYYfG1m4wAcvPhXNfE3EfH1r1ADqtfSdVCToUG868RvUUkgDKf31mGDtKsAYz2oz2AGutZYs";

    #[test]
    fn test_zpub_round_trip() {
        let canonical = canonicalize(ZPUB).unwrap();
        assert!(canonical.starts_with("xpub"));
        let back = convert(&canonical, KeyVersion::Zpub).unwrap();
        assert_eq!(back, ZPUB);
    }

    #[test]
    fn test_conversion_keeps_body() {
        let original: ExtendedKeyPayload = ZPUB.parse().unwrap();
        for target in [KeyVersion::Xpub, KeyVersion::Ypub, KeyVersion::ZpubMultisig] {
            let converted: ExtendedKeyPayload = convert(ZPUB, target).unwrap().parse().unwrap();
            assert_eq!(converted.version, target);
            assert_eq!(converted.body(), original.body());
            assert!(converted.encode().starts_with(target.prefix()));
        }
    }

    #[test]
    fn test_parse_xpub_any_format() {
        let (xpub, version) = parse_xpub(ZPUB).unwrap();
        assert_eq!(version, KeyVersion::Zpub);
        assert_eq!(version.family(), KeyFamily::NativeSegwit);
        assert_eq!(encode_xpub(&xpub, KeyVersion::Zpub), ZPUB);
    }

    #[test]
    fn test_private_public_mismatch() {
        assert!(convert(ZPUB, KeyVersion::Zprv).is_err());
        assert!(parse_xpriv(ZPUB).is_err());
    }

    #[test]
    fn test_invalid_keys() {
        assert!(!is_valid_xpub("zpub123"));
        assert!(!is_valid_xpub(""));
        let mut broken = ZPUB.to_string();
        broken.pop();
        broken.push('t');
        assert!(!is_valid_xpub(&broken));
    }

    #[test]
    fn test_version_table() {
        assert_eq!(KeyVersion::Zpub.bytes(), [0x04, 0xb2, 0x47, 0x46]);
        assert_eq!(KeyVersion::ZpubMultisig.bytes(), [0x02, 0xaa, 0x7e, 0xd3]);
        assert_eq!(KeyVersion::from_prefix("Ypub6..."), Some(KeyVersion::YpubMultisig));
        assert_eq!(KeyVersion::Vpub.canonical(), KeyVersion::Tpub);
        assert_eq!(KeyVersion::Zprv.canonical(), KeyVersion::Xprv);
    }
}
