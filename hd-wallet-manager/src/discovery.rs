//! Indexer-driven gap limit discovery
//!
//! Drives the [`DiscoveryScan`] and [`LagScan`] state machines from the core
//! crate against an [`Indexer`], one batched history query per step.

use core::ops::Range;

use hd_wallet::address_cache::AddressCache;
use hd_wallet::gap_limit::{DiscoveryScan, LagScan};
use hd_wallet::{Chain, WalletConfig, WalletKeys};
use tracing::{debug, info};

use crate::cancel::CancellationFlag;
use crate::error::Result;
use crate::indexer::Indexer;

/// Indices in `range` whose address has any history.
pub async fn used_indices(
    indexer: &dyn Indexer,
    keys: &WalletKeys,
    cache: &mut AddressCache,
    chain: Chain,
    range: Range<u32>,
) -> Result<Vec<u32>> {
    let addresses = cache.ensure_range(keys, chain, range)?;
    let query: Vec<String> = addresses.iter().map(|(_, address)| address.clone()).collect();
    let history = indexer.multi_get_history_by_address(&query).await?;
    Ok(addresses
        .into_iter()
        .filter(|(_, address)| history.get(address).is_some_and(|items| !items.is_empty()))
        .map(|(index, _)| index)
        .collect())
}

/// Locate the first unused index of `chain` by scanning gap-limit sized batches
/// from index 0 until a batch comes back entirely unused.
pub async fn discover_next_free_index(
    indexer: &dyn Indexer,
    keys: &WalletKeys,
    cache: &mut AddressCache,
    chain: Chain,
    config: &WalletConfig,
    cancel: &CancellationFlag,
) -> Result<u32> {
    let mut scan = DiscoveryScan::new(config.gap_limit, config.discovery_max_index);
    while let Some(batch) = scan.next_batch() {
        cancel.check()?;
        debug!("Discovery {:?}: querying {}..{}", chain, batch.start, batch.end);
        let used = used_indices(indexer, keys, cache, chain, batch).await?;
        scan.record_batch(&used);
    }
    info!("Discovered next free {:?} index {}", chain, scan.result());
    Ok(scan.result())
}

/// Move `cursor` past any activity found in the window right after it, repeating
/// until a window is quiet.
pub async fn advance_lagging_cursor(
    indexer: &dyn Indexer,
    keys: &WalletKeys,
    cache: &mut AddressCache,
    chain: Chain,
    cursor: u32,
    config: &WalletConfig,
    cancel: &CancellationFlag,
) -> Result<u32> {
    let mut lag = LagScan::new(cursor, config.gap_limit, config.discovery_max_index);
    while let Some(window) = lag.next_window() {
        cancel.check()?;
        let used = used_indices(indexer, keys, cache, chain, window).await?;
        lag.record(&used);
    }
    if lag.cursor() != cursor {
        info!("{:?} cursor lagged behind chain activity, moved {} -> {}", chain, cursor, lag.cursor());
    }
    Ok(lag.cursor())
}

/// Whether anything in the first gap window of the receive chain has history.
pub async fn was_ever_used(
    indexer: &dyn Indexer,
    keys: &WalletKeys,
    cache: &mut AddressCache,
    config: &WalletConfig,
) -> Result<bool> {
    let window = if keys.is_single_address() {
        1
    } else {
        config.gap_limit
    };
    Ok(!used_indices(indexer, keys, cache, Chain::External, 0..window).await?.is_empty())
}
