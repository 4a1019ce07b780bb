//! Multisig wallet setup files
//!
//! Supported inputs: `sortedmulti` output descriptors (bare or inside a JSON
//! object with a `descriptor` field), Coldcard/Cobo text setup files, and Electrum
//! multisig wallet JSON. [`export`] writes the text format back.

use bitcoin::{Network, NetworkKind};
use serde_json::Value;

use super::cosigner::{self, parse_descriptor_key, parse_fingerprint, parse_record, CosignerKey};
use super::{MultisigFormat, Quorum};
use crate::error::{Error, Result};
use crate::ext_key::KeyVersion;
use crate::script_type::{parse_path, path_to_string};

const DEFAULT_LABEL: &str = "Multisig vault";

/// Build a quorum from a setup file in any supported format.
pub fn import(data: &str, network: Network) -> Result<Quorum> {
    let data = data.trim();
    let json = serde_json::from_str::<Value>(data).ok();

    let quorum = match &json {
        Some(Value::Object(object)) if object.contains_key("descriptor") => {
            let descriptor = object.get("descriptor").and_then(Value::as_str).unwrap_or_default();
            let mut quorum = from_descriptor(descriptor, network)?;
            if let Some(label) = object.get("label").and_then(Value::as_str) {
                quorum.set_label(label);
            }
            quorum
        }
        Some(Value::Object(object)) if object.contains_key("wallet_type") => from_electrum(object, network)?,
        Some(_) => return Err(Error::InvalidKey("not a multisig setup".into())),
        None if data.contains("sortedmulti(") => from_descriptor(data, network)?,
        None => from_text(data, network)?,
    };
    quorum.validate()?;
    Ok(quorum)
}

/// Whether `data` looks like a multisig setup rather than a single-signature key.
pub fn is_setup(data: &str) -> bool {
    let data = data.trim();
    match serde_json::from_str::<Value>(data) {
        Ok(Value::Object(object)) => {
            object.get("descriptor").and_then(Value::as_str).is_some_and(|d| d.contains("sortedmulti("))
                || object
                    .get("wallet_type")
                    .and_then(Value::as_str)
                    .is_some_and(|t| t.split_once("of").is_some_and(|(m, n)| m.parse::<usize>().is_ok() && n.parse::<usize>().is_ok()))
        }
        Ok(_) => false,
        Err(_) => {
            data.contains("sortedmulti(")
                || data.lines().any(|line| line.trim_start().to_lowercase().starts_with("policy:"))
        }
    }
}

/// `wsh(sortedmulti(M,[fp/path]xpub/0/*,...))`, `sh(wsh(...))` or `sh(...)`.
pub fn from_descriptor(descriptor: &str, network: Network) -> Result<Quorum> {
    let descriptor = descriptor.split('#').next().unwrap_or_default().trim();
    let format = if descriptor.starts_with("sh(wsh(") {
        MultisigFormat::P2shP2wsh
    } else if descriptor.starts_with("wsh(") {
        MultisigFormat::P2wsh
    } else if descriptor.starts_with("sh(") {
        MultisigFormat::P2sh
    } else {
        return Err(Error::UnsupportedScriptType(descriptor.split('(').next().unwrap_or_default().to_string()));
    };
    let (_, args) = descriptor
        .split_once("sortedmulti(")
        .ok_or_else(|| Error::InvalidKey("descriptor has no sortedmulti expression".into()))?;
    let mut parts = args.split(',');
    let m = parts
        .next()
        .and_then(|m| m.trim().parse::<usize>().ok())
        .ok_or_else(|| Error::InvalidKey("bad threshold in descriptor".into()))?;

    let mut quorum = Quorum::new(m, format, network).with_label(DEFAULT_LABEL);
    let mut first_path = None;
    for part in parts {
        let key = parse_descriptor_key(part)?;
        first_path.get_or_insert_with(|| key.path.clone());
        quorum.add_cosigner(key)?;
    }
    if let Some(path) = first_path {
        quorum.set_derivation_path(path);
    }
    Ok(quorum)
}

/// Coldcard/Cobo text: `Name:`, `Policy: M of N`, `Derivation:`, `Format:` and
/// `FINGERPRINT: xpub` lines. A `# derivation: path` comment applies to the
/// cosigner line that follows it.
pub fn from_text(text: &str, network: Network) -> Result<Quorum> {
    let mut quorum = Quorum::new(0, MultisigFormat::P2wsh, network);
    let mut pending_path = None;
    let mut global_path = None;

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key.to_lowercase().as_str() {
            "name" => quorum.set_label(value),
            "policy" => {
                let m = value
                    .split("of")
                    .next()
                    .and_then(|m| m.trim().parse::<usize>().ok())
                    .ok_or_else(|| Error::InvalidKey(format!("bad policy {:?}", value)))?;
                quorum.set_m(m);
            }
            "derivation" => global_path = Some(parse_path(value)?),
            "format" => quorum.set_format(value.parse()?),
            "# derivation" => pending_path = Some(parse_path(value)?),
            _ if KeyVersion::from_prefix(value).is_some() => {
                let fingerprint = parse_fingerprint(key.trim_start_matches('#'))?;
                let mut cosigner_key = first_key(cosigner::parse(value)?)?;
                cosigner_key.fingerprint = fingerprint;
                cosigner_key.format = Some(quorum.format());
                cosigner_key.path = pending_path
                    .take()
                    .or_else(|| global_path.clone())
                    .unwrap_or_else(|| quorum.derivation_path().clone());
                quorum.add_cosigner(cosigner_key)?;
            }
            _ => {}
        }
    }
    if let Some(path) = global_path {
        quorum.set_derivation_path(path);
    }
    if quorum.label().is_none() {
        quorum.set_label(DEFAULT_LABEL);
    }
    Ok(quorum)
}

fn first_key(keys: Vec<CosignerKey>) -> Result<CosignerKey> {
    keys.into_iter().next().ok_or_else(|| Error::InvalidKey("no cosigner key".into()))
}

/// Electrum multisig wallet file: `wallet_type: "MofN"` and `x1/`..`xN/` keystores.
fn from_electrum(object: &serde_json::Map<String, Value>, network: Network) -> Result<Quorum> {
    let wallet_type = object.get("wallet_type").and_then(Value::as_str).unwrap_or_default();
    let (m, n) = wallet_type
        .split_once("of")
        .and_then(|(m, n)| Some((m.trim().parse::<usize>().ok()?, n.trim().parse::<usize>().ok()?)))
        .ok_or_else(|| Error::InvalidKey(format!("not a multisig wallet type {:?}", wallet_type)))?;

    let mut quorum = Quorum::new(m, MultisigFormat::P2wsh, network).with_label(DEFAULT_LABEL);
    for c in 1..=n {
        let Some(Value::Object(keystore)) = object.get(&format!("x{}/", c)) else {
            continue;
        };
        let key = first_key(parse_record(keystore)?)?;
        quorum.set_format(MultisigFormat::from_family(key.version.family()).unwrap_or(MultisigFormat::P2sh));
        quorum.add_cosigner(key)?;
    }
    Ok(quorum)
}

/// Write the quorum as a Coldcard/Cobo text setup file holding public keys only.
pub fn export(quorum: &Quorum) -> String {
    let mut out = String::from("# Multisig setup file\n# this file contains only public keys and is safe to\n# distribute among cosigners\n#\n");
    out.push_str(&format!("Name: {}\n", quorum.label().unwrap_or(DEFAULT_LABEL)));
    out.push_str(&format!("Policy: {} of {}\n", quorum.m(), quorum.n()));
    let global = quorum.derivation_path();
    out.push_str(&format!("Derivation: {}\n", path_to_string(global)));
    out.push_str(&format!("Format: {}\n\n", quorum.format().to_string().to_uppercase()));

    let network = NetworkKind::from(quorum.network());
    let version = KeyVersion::for_family(quorum.format().key_family(), network, false);
    for cosigner in quorum.cosigners() {
        let key: &CosignerKey = &cosigner.key;
        if &key.path != global {
            out.push_str(&format!("# derivation: {}\n", path_to_string(&key.path)));
        }
        out.push_str(&format!(
            "{}: {}\n",
            key.fingerprint_hex(),
            crate::ext_key::encode_xpub(&key.xpub, version)
        ));
    }
    out
}
