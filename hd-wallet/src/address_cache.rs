//! Memoized address-by-index lookups.
//!
//! Derivation is deterministic, so once an address is computed for a
//! (chain, index) pair it is kept for the wallet's lifetime and never evicted.

use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::derivation::Chain;
use crate::error::Result;

/// Anything that can render an address for a (chain, index) pair.
pub trait AddressSource {
    fn address_at(&self, chain: Chain, index: u32) -> Result<String>;
}

/// Per-chain cache of derived addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AddressCache {
    external: BTreeMap<u32, String>,
    internal: BTreeMap<u32, String>,
}

impl AddressCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, chain: Chain) -> &BTreeMap<u32, String> {
        match chain {
            Chain::External => &self.external,
            Chain::Internal => &self.internal,
        }
    }

    fn map_mut(&mut self, chain: Chain) -> &mut BTreeMap<u32, String> {
        match chain {
            Chain::External => &mut self.external,
            Chain::Internal => &mut self.internal,
        }
    }

    /// Cached address, if already derived.
    pub fn get(&self, chain: Chain, index: u32) -> Option<&str> {
        self.map(chain).get(&index).map(String::as_str)
    }

    /// Cached address, deriving and storing it on a miss.
    pub fn get_or_derive<S: AddressSource + ?Sized>(
        &mut self,
        source: &S,
        chain: Chain,
        index: u32,
    ) -> Result<String> {
        if let Some(address) = self.get(chain, index) {
            return Ok(address.to_string());
        }
        let address = source.address_at(chain, index)?;
        self.map_mut(chain).insert(index, address.clone());
        Ok(address)
    }

    /// Make sure `range` is cached and return the addresses in index order.
    pub fn ensure_range<S: AddressSource + ?Sized>(
        &mut self,
        source: &S,
        chain: Chain,
        range: core::ops::Range<u32>,
    ) -> Result<Vec<(u32, String)>> {
        range
            .map(|index| -> Result<(u32, String)> {
                Ok((index, self.get_or_derive(source, chain, index)?))
            })
            .collect()
    }

    /// Reverse lookup of an address among cached entries.
    pub fn find(&self, address: &str) -> Option<(Chain, u32)> {
        Chain::BOTH.into_iter().find_map(|chain| {
            self.map(chain)
                .iter()
                .find(|(_, cached)| addresses_equal(cached, address))
                .map(|(index, _)| (chain, *index))
        })
    }

    /// Number of cached addresses on `chain`.
    pub fn len(&self, chain: Chain) -> usize {
        self.map(chain).len()
    }

    pub fn is_empty(&self) -> bool {
        self.external.is_empty() && self.internal.is_empty()
    }
}

/// Bech32 addresses compare case-insensitively, base58 ones exactly.
pub fn addresses_equal(a: &str, b: &str) -> bool {
    let lower_a = a.to_ascii_lowercase();
    if lower_a.starts_with("bc1") || lower_a.starts_with("tb1") || lower_a.starts_with("bcrt1") {
        lower_a == b.to_ascii_lowercase()
    } else {
        a == b
    }
}
