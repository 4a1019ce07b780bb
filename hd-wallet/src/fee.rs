//! Fee rates and transaction size accounting
//!
//! Sizes follow the usual coin selection accounting: a fixed transaction overhead,
//! a base per input plus the script data it will carry, and a base per output plus
//! its script. For segwit inputs the "script length" is the witness discounted to
//! vbytes, so the totals approximate virtual size.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Version, input count, output count and locktime
pub const TX_EMPTY_SIZE: usize = 4 + 1 + 1 + 4;
/// Outpoint, script length byte and sequence
pub const TX_INPUT_BASE: usize = 32 + 4 + 1 + 4;
/// Signature and compressed public key of a P2PKH spend
pub const TX_INPUT_PUBKEYHASH: usize = 107;
/// Value and script length byte
pub const TX_OUTPUT_BASE: usize = 8 + 1;
/// A P2PKH output script
pub const TX_OUTPUT_PUBKEYHASH: usize = 25;
/// An output with the default script size, used for change
pub const BLANK_OUTPUT: usize = TX_OUTPUT_BASE + TX_OUTPUT_PUBKEYHASH;

/// Fee rate in satoshis per virtual byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FeeRate {
    sat_per_vb: u64,
}

impl Default for FeeRate {
    fn default() -> Self {
        Self::min()
    }
}

impl FeeRate {
    /// Create from satoshis per virtual byte
    pub fn from_sat_per_vb(sat_per_vb: u64) -> Self {
        Self {
            sat_per_vb,
        }
    }

    /// Satoshis per virtual byte
    pub fn as_sat_per_vb(&self) -> u64 {
        self.sat_per_vb
    }

    /// Fee for a transaction of `vsize` virtual bytes
    pub fn fee_for(&self, vsize: usize) -> u64 {
        self.sat_per_vb.saturating_mul(vsize as u64)
    }

    /// Default minimum relay rate (1 sat/vB)
    pub fn min() -> Self {
        Self::from_sat_per_vb(1)
    }

    /// Outputs worth less than this are not worth creating at this rate.
    pub fn dust_threshold(&self) -> u64 {
        self.fee_for(TX_INPUT_BASE + TX_INPUT_PUBKEYHASH)
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat/vB", self.sat_per_vb)
    }
}

/// How the fee of a new transaction is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FeePolicy {
    /// Fee scales with size
    Rate(FeeRate),
    /// A fixed fee in satoshis regardless of size
    Absolute(u64),
}

impl FeePolicy {
    /// Fee for a transaction of `vsize` virtual bytes
    pub fn fee_for(&self, vsize: usize) -> u64 {
        match self {
            FeePolicy::Rate(rate) => rate.fee_for(vsize),
            FeePolicy::Absolute(fee) => *fee,
        }
    }

    /// Cost of adding `bytes` to a transaction
    pub fn marginal_fee(&self, bytes: usize) -> u64 {
        match self {
            FeePolicy::Rate(rate) => rate.fee_for(bytes),
            FeePolicy::Absolute(_) => 0,
        }
    }
}

impl From<FeeRate> for FeePolicy {
    fn from(rate: FeeRate) -> Self {
        FeePolicy::Rate(rate)
    }
}

/// Size an input contributes, given the script data it carries.
pub fn input_bytes(script_len: usize) -> usize {
    TX_INPUT_BASE + script_len
}

/// Size an output contributes, given its script length.
pub fn output_bytes(script_len: usize) -> usize {
    TX_OUTPUT_BASE + script_len
}

/// Estimated size of a transaction.
pub fn transaction_bytes(input_script_lens: &[usize], output_script_lens: &[usize]) -> usize {
    TX_EMPTY_SIZE
        + input_script_lens.iter().map(|l| input_bytes(*l)).sum::<usize>()
        + output_script_lens.iter().map(|l| output_bytes(*l)).sum::<usize>()
}

/// Script length used to account for a payment to `script_pubkey`. Witness
/// programs are counted with three extra bytes of slack, everything else with the
/// P2PKH default.
pub fn output_script_len(script_pubkey: &bitcoin::Script) -> usize {
    if script_pubkey.is_witness_program() {
        script_pubkey.len() + 3
    } else {
        TX_OUTPUT_PUBKEYHASH
    }
}

/// Virtual size of a P2WSH `m`-of-`n` multisig input.
pub fn multisig_native_input_vsize(m: usize, n: usize) -> usize {
    (8 + m * 74 + n * 34).div_ceil(4)
}

/// Virtual size of a P2SH-P2WSH `m`-of-`n` multisig input.
pub fn multisig_wrapped_input_vsize(m: usize, n: usize) -> usize {
    35 + multisig_native_input_vsize(m, n)
}

/// Size of a legacy P2SH `m`-of-`n` multisig input.
pub fn multisig_legacy_input_vsize(m: usize, n: usize) -> usize {
    9 + m * 74 + n * 34
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::ScriptBuf;

    #[test]
    fn test_fee_rate() {
        let rate = FeeRate::from_sat_per_vb(10);
        assert_eq!(rate.fee_for(141), 1410);
        assert_eq!(rate.dust_threshold(), 1480);
        assert_eq!(rate.to_string(), "10 sat/vB");
        assert_eq!(FeePolicy::Absolute(10_000).fee_for(5000), 10_000);
        assert_eq!(FeePolicy::Absolute(10_000).marginal_fee(68), 0);
    }

    #[test]
    fn test_transaction_bytes() {
        // one P2PKH input, one P2PKH output
        assert_eq!(transaction_bytes(&[TX_INPUT_PUBKEYHASH], &[TX_OUTPUT_PUBKEYHASH]), 192);
        // one P2WPKH input, two outputs
        assert_eq!(transaction_bytes(&[27], &[25, 25]), 10 + 68 + 68);
        assert_eq!(BLANK_OUTPUT, 34);
    }

    #[test]
    fn test_output_script_len() {
        let p2wsh = ScriptBuf::new_p2wsh(&bitcoin::WScriptHash::all_zeros());
        assert_eq!(output_script_len(&p2wsh), 37);
        let p2sh = ScriptBuf::new_p2sh(&bitcoin::ScriptHash::all_zeros());
        assert_eq!(output_script_len(&p2sh), 25);
    }

    #[test]
    fn test_multisig_vsize() {
        assert_eq!(multisig_native_input_vsize(2, 3), 65);
        assert_eq!(multisig_wrapped_input_vsize(2, 3), 100);
        assert_eq!(multisig_legacy_input_vsize(2, 3), 259);
    }
}
