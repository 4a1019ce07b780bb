//! BIP39 mnemonic handling

use bip39::{Language, Mnemonic};

use crate::error::{Error, Result};

/// Lowercase the phrase and collapse any run of whitespace into a single space.
pub fn normalize(phrase: &str) -> String {
    phrase.split_whitespace().map(str::to_lowercase).collect::<Vec<_>>().join(" ")
}

/// Parse an English BIP39 phrase.
pub fn parse(phrase: &str) -> Result<Mnemonic> {
    let normalized = normalize(phrase);
    if normalized.is_empty() {
        return Err(Error::InvalidMnemonic("empty phrase".into()));
    }
    Ok(Mnemonic::parse_in_normalized(Language::English, &normalized)?)
}

/// Whether the phrase is a valid English BIP39 mnemonic.
pub fn validate(phrase: &str) -> bool {
    parse(phrase).is_ok()
}

/// BIP39 seed for a phrase, salted with the optional passphrase.
pub fn to_seed(phrase: &str, passphrase: &str) -> Result<[u8; 64]> {
    Ok(parse(phrase)?.to_seed_normalized(passphrase))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Abandon\tabandon\n about "), "abandon abandon about");
    }

    #[test]
    fn test_validate() {
        assert!(validate(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about"
        ));
        assert!(!validate("abandon abandon abandon"));
        assert!(!validate(""));
    }

    #[test]
    fn test_passphrase_changes_seed() {
        let phrase = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
        assert_ne!(to_seed(phrase, "").unwrap(), to_seed(phrase, "TREZOR").unwrap());
        assert_eq!(
            hex::encode(to_seed(phrase, "TREZOR").unwrap()),
            "c55257c360c07c72029aebc1b53c05ed0362ada38ead3e3e9efa3708e53495531f09a6987599d18264c1e1c92f2cf141630c7a3c4ab7c81b2f001698e7463b04"
        );
    }
}
