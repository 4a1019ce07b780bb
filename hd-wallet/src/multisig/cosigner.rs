//! Cosigner key parsing
//!
//! Cosigners hand over their account key in a handful of shapes: a bare extended
//! public key, a descriptor key with origin (`[fingerprint/path]xpub`), a flat JSON
//! record, or a hardware wallet export bundling one key per multisig format.

use core::fmt;

use bitcoin::bip32::{DerivationPath, Fingerprint, Xpub};
use serde_json::{Map, Value};

use super::MultisigFormat;
use crate::error::{Error, Result};
use crate::ext_key::{self, KeyFamily, KeyVersion};
use crate::script_type::{parse_path, path_to_string};

/// A cosigner's account-level public key and its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CosignerKey {
    /// Master key fingerprint, all zero when unknown
    pub fingerprint: Fingerprint,
    /// Path from the master key to `xpub`
    pub path: DerivationPath,
    pub xpub: Xpub,
    /// Format the key was provided in
    pub version: KeyVersion,
    /// Multisig format the key was exported for, when the source says so
    pub format: Option<MultisigFormat>,
}

impl CosignerKey {
    /// The key in the format it was provided in.
    pub fn encoded(&self) -> String {
        ext_key::encode_xpub(&self.xpub, self.version)
    }

    /// Fingerprint as uppercase hex.
    pub fn fingerprint_hex(&self) -> String {
        self.fingerprint.to_string().to_uppercase()
    }

    /// Whether both keys carry the same 74-byte payload, whatever their version.
    pub fn same_key(&self, other: &CosignerKey) -> bool {
        self.xpub.encode()[4..] == other.xpub.encode()[4..]
    }

    pub fn has_fingerprint(&self) -> bool {
        self.fingerprint != Fingerprint::from([0u8; 4])
    }
}

impl fmt::Display for CosignerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = path_to_string(&self.path);
        match path.strip_prefix("m/") {
            Some(steps) => write!(f, "[{}/{}]{}", self.fingerprint, steps, self.encoded()),
            None => write!(f, "[{}]{}", self.fingerprint, self.encoded()),
        }
    }
}

/// Parse cosigner data in any supported shape. Hardware wallet exports yield one
/// key per format they contain, everything else a single key.
pub fn parse(data: &str) -> Result<Vec<CosignerKey>> {
    let data = data.trim();
    if KeyVersion::from_prefix(data).is_some() {
        return parse_bare(data).map(|key| vec![key]);
    }
    if data.starts_with('[') {
        return parse_descriptor_key(data).map(|key| vec![key]);
    }
    match serde_json::from_str::<Value>(data) {
        Ok(Value::Object(object)) => parse_record(&object),
        _ => Err(Error::InvalidKey("unrecognized cosigner data".into())),
    }
}

/// The key meant for `format` among parsed keys: an explicit match first, then a
/// key whose version implies the format, then the only key there is.
pub fn select_for_format(keys: &[CosignerKey], format: MultisigFormat) -> Option<&CosignerKey> {
    keys.iter()
        .find(|k| k.format == Some(format))
        .or_else(|| keys.iter().find(|k| k.format.is_none() && MultisigFormat::from_family(k.version.family()) == Some(format)))
        .or_else(|| if keys.len() == 1 { keys.first() } else { None })
}

/// Eight hex digits.
pub fn parse_fingerprint(hex_str: &str) -> Result<Fingerprint> {
    let hex_str = hex_str.trim();
    if hex_str.len() != 8 {
        return Err(Error::InvalidKey(format!("bad fingerprint {:?}", hex_str)));
    }
    let bytes = hex::decode(hex_str).map_err(|_| Error::InvalidKey(format!("bad fingerprint {:?}", hex_str)))?;
    let mut out = [0u8; 4];
    out.copy_from_slice(&bytes);
    Ok(Fingerprint::from(out))
}

/// Coldcard's `ckcc_xfp`: the fingerprint bytes read as a little-endian integer.
pub fn fingerprint_from_xfp(xfp: u32) -> Fingerprint {
    Fingerprint::from(xfp.to_le_bytes())
}

fn parse_bare(encoded: &str) -> Result<CosignerKey> {
    let (xpub, version) = ext_key::parse_xpub(encoded)?;
    let format = match version.family() {
        KeyFamily::Legacy => None,
        family => MultisigFormat::from_family(family),
    };
    let path = format.unwrap_or(MultisigFormat::P2sh).account_path(version.network_kind());
    Ok(CosignerKey {
        fingerprint: Fingerprint::from([0u8; 4]),
        path,
        xpub,
        version,
        format,
    })
}

/// `[fingerprint/path]xpub`, optionally followed by `/0/*` and closing parentheses.
pub(crate) fn parse_descriptor_key(data: &str) -> Result<CosignerKey> {
    let body = data.trim().strip_prefix('[').ok_or_else(|| Error::InvalidKey("expected key origin".into()))?;
    let (origin, rest) = body.split_once(']').ok_or_else(|| Error::InvalidKey("unterminated key origin".into()))?;
    let (fingerprint, path) = origin.split_once('/').unwrap_or((origin, ""));
    let encoded = rest.split(['/', ')', ',']).next().unwrap_or_default();
    let (xpub, version) = ext_key::parse_xpub(encoded)?;
    Ok(CosignerKey {
        fingerprint: parse_fingerprint(fingerprint)?,
        path: if path.is_empty() {
            DerivationPath::master()
        } else {
            parse_path(path)?
        },
        xpub,
        version,
        format: None,
    })
}

fn string_field<'a>(object: &'a Map<String, Value>, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|name| object.get(*name).and_then(Value::as_str))
}

fn json_fingerprint(object: &Map<String, Value>) -> Result<Fingerprint> {
    if let Some(xfp) = object.get("ckcc_xfp").and_then(Value::as_u64) {
        let xfp = u32::try_from(xfp).map_err(|_| Error::InvalidKey(format!("bad ckcc_xfp {}", xfp)))?;
        return Ok(fingerprint_from_xfp(xfp));
    }
    match string_field(object, &["xfp", "fingerprint", "root_fingerprint", "MasterFingerprint"]) {
        Some(fp) => parse_fingerprint(fp),
        None => Ok(Fingerprint::from([0u8; 4])),
    }
}

const EXPORT_VARIANTS: [(&str, MultisigFormat); 4] = [
    ("p2sh", MultisigFormat::P2sh),
    ("p2wsh_p2sh", MultisigFormat::P2shP2wsh),
    ("p2sh_p2wsh", MultisigFormat::P2shP2wsh),
    ("p2wsh", MultisigFormat::P2wsh),
];

/// A JSON cosigner record, flat or a hardware wallet bundle.
pub(crate) fn parse_record(object: &Map<String, Value>) -> Result<Vec<CosignerKey>> {
    let fingerprint = json_fingerprint(object)?;

    if let Some(encoded) = string_field(object, &["xpub", "ExtPubKey"]) {
        let mut key = parse_bare(encoded)?;
        key.fingerprint = fingerprint;
        if let Some(path) = string_field(object, &["path", "deriv", "derivation", "AccountKeyPath"]) {
            key.path = parse_path(path)?;
        }
        return Ok(vec![key]);
    }

    // hardware wallet export: one record per format, `<name>` and `<name>_deriv`
    let mut keys = Vec::new();
    for (name, format) in EXPORT_VARIANTS {
        let Some(encoded) = object.get(name).and_then(Value::as_str) else {
            continue;
        };
        let mut record = Map::new();
        record.insert("xpub".into(), Value::from(encoded));
        record.insert("xfp".into(), Value::from(fingerprint.to_string()));
        if let Some(path) = object.get(&format!("{}_deriv", name)) {
            record.insert("path".into(), path.clone());
        }
        for mut key in parse_record(&record)? {
            key.format = Some(format);
            keys.push(key);
        }
    }
    if keys.is_empty() {
        return Err(Error::InvalidKey("no extended public key in cosigner record".into()));
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZPUB1: &str = "Zpub74ijpfhERJNjhCKXRspTdLJV5eoEmSRZdHqDvp9kVtdVEyiXk7pXxRbfZzQvsDFpfDHEHVtVpx4Dz9DGUWGn2Xk5zG5u45QTMsYS2vjohNQ";
    const COLDCARD_EXPORT: &str = r#"{"p2sh_deriv":"m/45'","p2sh":"xpub6847W6cYUqq4ixcmFb83iqPtJZfnMPTkpYiCsuUybzFppJp2qzh3KCVHsLGQy4WhaxGqkK9aDDZnSfhB92PkHDKihbH6WLztzmN7WW9GYpR","p2wsh_p2sh_deriv":"m/48'/0'/0'/1'","p2wsh_p2sh":"Ypub6kvtvTZpqGuWtQfg9bL5xe4vDWtwsirR8LzDvsY3vgXvyncW1NGXCUJ9Ps7CiizSSLV6NnnXSYyVDnxCu26QChWzWLg5YCAHam6cYjGtzRz","p2wsh_deriv":"m/48'/0'/0'/2'","p2wsh":"Zpub75mAE8EjyxSzoyPmGnd5E6MyD7ALGNndruWv52xpzimZQKukwvEfXTHqmH8nbbc6ccP5t2aM3mws3pKYSnKpKMMytdbNEZFUxKzztYFM8Pn","xfp":"168DD603"}"#;

    #[test]
    fn test_bare_key_infers_path() {
        let keys = parse(ZPUB1).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].format, Some(MultisigFormat::P2wsh));
        assert_eq!(path_to_string(&keys[0].path), "m/48'/0'/0'/2'");
        assert!(!keys[0].has_fingerprint());
        assert_eq!(keys[0].encoded(), ZPUB1);
    }

    #[test]
    fn test_descriptor_key() {
        let data = "[1104442d/48h/0h/0h/2h]xpub6ERaLLFZ3qu7X4cpiMAvSZ6UZVXJfxY5FoNvVJgai1V78DmeNHTcNVfu4cK2RmvTNXU4s1tFpGMPTwqoQ1RraE2o9iiNw2s2aHESpandSFY/0/*";
        let key = &parse(data).unwrap()[0];
        assert_eq!(key.fingerprint_hex(), "1104442D");
        assert_eq!(path_to_string(&key.path), "m/48'/0'/0'/2'");
        assert_eq!(key.version, KeyVersion::Xpub);
    }

    #[test]
    fn test_hardware_export_bundle() {
        let keys = parse(COLDCARD_EXPORT).unwrap();
        assert_eq!(keys.len(), 3);
        assert!(keys.iter().all(|k| k.fingerprint_hex() == "168DD603"));

        let native = select_for_format(&keys, MultisigFormat::P2wsh).unwrap();
        assert!(native.encoded().starts_with("Zpub75mAE8"));
        assert_eq!(path_to_string(&native.path), "m/48'/0'/0'/2'");
        let legacy = select_for_format(&keys, MultisigFormat::P2sh).unwrap();
        assert_eq!(path_to_string(&legacy.path), "m/45'");
    }

    #[test]
    fn test_flat_json_and_xfp() {
        let json = format!(r#"{{"xpub": "{}", "ckcc_xfp": 64392470, "derivation": "m/48'/1'/0'/1'"}}"#, ZPUB1);
        let key = &parse(&json).unwrap()[0];
        assert_eq!(key.fingerprint_hex(), "168DD603");
        assert_eq!(path_to_string(&key.path), "m/48'/1'/0'/1'");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(parse("garbage"), Err(Error::InvalidKey(_))));
        assert!(parse("Zpub74ijpfhERJNjhCKXRspTdLJV5eoEm").is_err());
        assert!(parse(r#"{"label": "nothing here"}"#).is_err());
        assert!(parse_fingerprint("rmjiweg3").is_err());
        assert!(parse_fingerprint("dEaDbeEF").is_ok());
    }
}
