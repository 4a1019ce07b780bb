//! Coin selection algorithms for transaction building
//!
//! Two modes are supported. A regular payment accumulates inputs until their value
//! covers the outputs plus the fee for the inputs gathered so far. A payment with
//! outputs of unspecified value (send-max) spends every candidate and splits what
//! remains after the fee among those outputs.

use core::cmp::Reverse;

use tracing::debug;

use crate::error::{Error, Result};
use crate::fee::{transaction_bytes, FeePolicy, BLANK_OUTPUT, TX_OUTPUT_BASE, TX_OUTPUT_PUBKEYHASH};
use crate::utxo::Utxo;

/// UTXO selection strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Accumulate in the order the candidates are given
    Accumulative,
    /// Select largest UTXOs first (minimize fees)
    #[default]
    LargestFirst,
    /// Select smallest UTXOs first (minimize UTXO set)
    SmallestFirst,
}

/// An output as coin selection sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSpec {
    /// `None` asks for an equal share of whatever is left after the fee
    pub value: Option<u64>,
    /// Script length used for size accounting
    pub script_len: usize,
}

impl OutputSpec {
    pub fn new(value: Option<u64>, script_len: usize) -> Self {
        Self {
            value,
            script_len,
        }
    }
}

/// Result of UTXO selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionResult {
    /// Selected UTXOs
    pub selected: Vec<Utxo>,
    /// Value of each requested output, in request order
    pub output_values: Vec<u64>,
    /// Change amount, if a change output is warranted
    pub change: Option<u64>,
    /// Fee paid: inputs minus outputs minus change
    pub fee: u64,
    /// Estimated transaction size in vbytes, change output included
    pub estimated_size: usize,
}

impl SelectionResult {
    /// Total value of selected UTXOs
    pub fn total_value(&self) -> u64 {
        self.selected.iter().map(|u| u.value).sum()
    }
}

/// Coin selector for choosing UTXOs
#[derive(Debug, Clone, Copy)]
pub struct CoinSelector {
    strategy: SelectionStrategy,
    dust_threshold: u64,
}

impl CoinSelector {
    /// Create a new coin selector
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            dust_threshold: crate::config::DEFAULT_DUST_THRESHOLD,
        }
    }

    /// Set the floor below which change is folded into the fee
    pub fn with_dust_threshold(mut self, threshold: u64) -> Self {
        self.dust_threshold = threshold;
        self
    }

    fn dust_for(&self, fee: &FeePolicy) -> u64 {
        match fee {
            FeePolicy::Rate(rate) => rate.dust_threshold().max(self.dust_threshold),
            FeePolicy::Absolute(_) => self.dust_threshold,
        }
    }

    /// Select inputs for `outputs`. `script_len` gives the script data each
    /// candidate input will carry once signed.
    pub fn select<F>(
        &self,
        candidates: &[Utxo],
        script_len: F,
        outputs: &[OutputSpec],
        fee: FeePolicy,
    ) -> Result<SelectionResult>
    where
        F: Fn(&Utxo) -> usize,
    {
        if outputs.is_empty() {
            return Err(Error::MissingData("no destination provided".into()));
        }
        if outputs.iter().any(|o| o.value.is_none()) {
            return self.split(candidates, script_len, outputs, fee);
        }

        let mut ordered: Vec<&Utxo> = candidates.iter().collect();
        match self.strategy {
            SelectionStrategy::Accumulative => {}
            SelectionStrategy::LargestFirst => ordered.sort_by_key(|u| Reverse(u.value)),
            SelectionStrategy::SmallestFirst => ordered.sort_by_key(|u| u.value),
        }

        let out_lens: Vec<usize> = outputs.iter().map(|o| o.script_len).collect();
        let out_total: u64 = outputs.iter().filter_map(|o| o.value).sum();
        let mut in_lens = Vec::new();
        let mut selected = Vec::new();
        let mut in_total = 0u64;
        let mut required = out_total + fee.fee_for(transaction_bytes(&[], &out_lens));

        for utxo in ordered {
            let len = script_len(utxo);
            // an input that costs more than it brings only makes things worse
            if fee.marginal_fee(crate::fee::input_bytes(len)) > utxo.value {
                debug!("skipping detrimental input {}:{} of {} sat", utxo.txid, utxo.vout, utxo.value);
                continue;
            }
            in_lens.push(len);
            in_total += utxo.value;
            selected.push(utxo.clone());

            required = out_total + fee.fee_for(transaction_bytes(&in_lens, &out_lens));
            if in_total >= required {
                let values = outputs.iter().filter_map(|o| o.value).collect();
                return Ok(self.finalize(selected, &in_lens, values, &out_lens, fee));
            }
        }

        Err(Error::InsufficientFunds {
            available: candidates.iter().map(|u| u.value).sum(),
            required,
        })
    }

    /// Spend every candidate and share the remainder among unvalued outputs.
    fn split<F>(
        &self,
        candidates: &[Utxo],
        script_len: F,
        outputs: &[OutputSpec],
        fee: FeePolicy,
    ) -> Result<SelectionResult>
    where
        F: Fn(&Utxo) -> usize,
    {
        let in_lens: Vec<usize> = candidates.iter().map(&script_len).collect();
        let out_lens: Vec<usize> = outputs.iter().map(|o| o.script_len).collect();
        let in_total: u64 = candidates.iter().map(|u| u.value).sum();
        let fixed: u64 = outputs.iter().filter_map(|o| o.value).sum();
        let fee_amount = fee.fee_for(transaction_bytes(&in_lens, &out_lens));

        let required = fixed + fee_amount;
        if candidates.is_empty() || in_total <= required {
            return Err(Error::InsufficientFunds {
                available: in_total,
                required: required + 1,
            });
        }
        let remaining = in_total - required;
        let unvalued = outputs.iter().filter(|o| o.value.is_none()).count() as u64;
        let share = remaining / unvalued;
        if share <= self.dust_for(&fee) {
            return Err(Error::InsufficientFunds {
                available: in_total,
                required: required + unvalued * (self.dust_for(&fee) + 1),
            });
        }

        let values = outputs.iter().map(|o| o.value.unwrap_or(share)).collect();
        Ok(self.finalize(candidates.to_vec(), &in_lens, values, &out_lens, fee))
    }

    /// Decide on change: add it when what is left after paying for one more
    /// output is above the dust threshold, otherwise leave it to the fee.
    fn finalize(
        &self,
        selected: Vec<Utxo>,
        in_lens: &[usize],
        output_values: Vec<u64>,
        out_lens: &[usize],
        fee: FeePolicy,
    ) -> SelectionResult {
        let in_total: u64 = selected.iter().map(|u| u.value).sum();
        let out_total: u64 = output_values.iter().sum();
        let bytes = transaction_bytes(in_lens, out_lens);
        let fee_with_change = fee.fee_for(bytes + BLANK_OUTPUT);

        let remainder = in_total.saturating_sub(out_total + fee_with_change);
        let change = (in_total >= out_total + fee_with_change && remainder > self.dust_for(&fee)).then_some(remainder);
        let estimated_size = if change.is_some() {
            bytes + TX_OUTPUT_BASE + TX_OUTPUT_PUBKEYHASH
        } else {
            bytes
        };

        SelectionResult {
            fee: in_total - out_total - change.unwrap_or(0),
            selected,
            output_values,
            change,
            estimated_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fee::FeeRate;
    use crate::transaction::tests::txid;

    fn utxos(values: &[u64]) -> Vec<Utxo> {
        values.iter().enumerate().map(|(i, v)| Utxo::new(txid(i as u8 + 1), 0, *v, "addr")).collect()
    }

    fn p2wpkh(_: &Utxo) -> usize {
        27
    }

    fn rate(r: u64) -> FeePolicy {
        FeePolicy::Rate(FeeRate::from_sat_per_vb(r))
    }

    #[test]
    fn test_largest_first_selection() {
        let candidates = utxos(&[10_000, 20_000, 30_000, 40_000]);
        let selector = CoinSelector::new(SelectionStrategy::LargestFirst);
        let result = selector.select(&candidates, p2wpkh, &[OutputSpec::new(Some(25_000), 25)], rate(1)).unwrap();

        assert_eq!(result.selected.len(), 1);
        assert_eq!(result.total_value(), 40_000);
        assert_eq!(result.output_values, vec![25_000]);
        // 10 + 68 + 34 bytes, plus a 34 byte change output
        assert_eq!(result.fee, 146);
        assert_eq!(result.change, Some(40_000 - 25_000 - 146));
    }

    #[test]
    fn test_smallest_first_selection() {
        let candidates = utxos(&[40_000, 10_000, 20_000, 30_000]);
        let selector = CoinSelector::new(SelectionStrategy::SmallestFirst);
        let result = selector.select(&candidates, p2wpkh, &[OutputSpec::new(Some(25_000), 25)], rate(1)).unwrap();
        assert_eq!(result.selected.len(), 2);
        assert_eq!(result.total_value(), 30_000);
        assert!(result.total_value() >= 25_000 + result.fee);
    }

    #[test]
    fn test_detrimental_inputs_are_skipped() {
        let candidates = utxos(&[500, 100_000]);
        let selector = CoinSelector::new(SelectionStrategy::Accumulative);
        let result = selector.select(&candidates, p2wpkh, &[OutputSpec::new(Some(50_000), 25)], rate(20)).unwrap();
        assert_eq!(result.selected.len(), 1);
        assert_eq!(result.selected[0].value, 100_000);
    }

    #[test]
    fn test_small_change_goes_to_fee() {
        let candidates = utxos(&[10_000]);
        let selector = CoinSelector::new(SelectionStrategy::default());
        // 10 + 68 + 34 = 112 bytes; leftover after an extra output is below dust
        let result = selector.select(&candidates, p2wpkh, &[OutputSpec::new(Some(9_500), 25)], rate(1)).unwrap();
        assert_eq!(result.change, None);
        assert_eq!(result.fee, 500);
    }

    #[test]
    fn test_insufficient_funds() {
        let candidates = utxos(&[10_000, 20_000]);
        let selector = CoinSelector::new(SelectionStrategy::LargestFirst);
        let result = selector.select(&candidates, p2wpkh, &[OutputSpec::new(Some(50_000), 25)], rate(1));
        assert!(matches!(
            result,
            Err(Error::InsufficientFunds {
                available: 30_000,
                ..
            })
        ));
    }

    #[test]
    fn test_send_max_spends_everything() {
        let candidates = utxos(&[10_000, 20_000, 30_000]);
        let selector = CoinSelector::new(SelectionStrategy::default());
        let result = selector.select(&candidates, p2wpkh, &[OutputSpec::new(None, 25)], rate(3)).unwrap();

        let size = transaction_bytes(&[27, 27, 27], &[25]);
        assert_eq!(result.selected.len(), 3);
        assert_eq!(result.fee, 3 * size as u64);
        assert!(result.fee > 0);
        assert_eq!(result.output_values, vec![60_000 - result.fee]);
        assert_eq!(result.change, None);
    }

    #[test]
    fn test_send_max_below_dust_fails() {
        let candidates = utxos(&[600]);
        let selector = CoinSelector::new(SelectionStrategy::default());
        let result = selector.select(&candidates, p2wpkh, &[OutputSpec::new(None, 25)], rate(1));
        assert!(matches!(result, Err(Error::InsufficientFunds { .. })));
    }

    #[test]
    fn test_absolute_fee() {
        let candidates = utxos(&[100_000]);
        let selector = CoinSelector::new(SelectionStrategy::default());
        let result = selector
            .select(&candidates, |_| 107, &[OutputSpec::new(Some(90_000), 25)], FeePolicy::Absolute(10_000))
            .unwrap();
        assert_eq!(result.fee, 10_000);
        assert_eq!(result.change, None);

        let result = selector
            .select(&candidates, |_| 107, &[OutputSpec::new(Some(80_000), 25)], FeePolicy::Absolute(10_000))
            .unwrap();
        assert_eq!(result.change, Some(10_000));
        assert_eq!(result.fee, 10_000);
    }
}
