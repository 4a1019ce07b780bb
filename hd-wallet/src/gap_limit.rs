//! Gap limit address discovery
//!
//! Discovery is a forward scan in batches of `gap_limit` addresses. A batch without
//! any used address ends the scan: an unbroken run of `gap_limit` unused addresses is
//! taken to mean nothing further is in use. Usage hidden behind a longer void is
//! not detected.
//!
//! The types here are pure state machines. They hand out index ranges to query and
//! consume the results; the caller owns the I/O.

use core::cmp;
use core::ops::Range;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Standard gap limit (BIP44 recommendation)
pub const DEFAULT_GAP_LIMIT: u32 = 20;

/// Maximum gap limit to prevent excessive address generation
pub const MAX_GAP_LIMIT: u32 = 1000;

/// Stages of a discovery scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DiscoveryStage {
    /// Waiting for the first batch
    Initial,
    /// At least one batch has been recorded
    Scanning,
    /// An empty batch was seen or the scan bound was hit
    Complete,
}

/// Forward scan locating the first unused index of one chain.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DiscoveryScan {
    /// Batch size
    pub limit: u32,
    /// Exclusive upper bound of indices that will be queried
    pub max_index: u32,
    /// Current stage
    pub stage: DiscoveryStage,
    /// Start of the next batch
    pub next_start: u32,
    /// Highest index seen in use
    pub highest_used_index: Option<u32>,
}

impl DiscoveryScan {
    /// Create a scan with batches of `limit` addresses, never querying at or past `max_index`.
    pub fn new(limit: u32, max_index: u32) -> Self {
        Self {
            limit: cmp::min(cmp::max(limit, 1), MAX_GAP_LIMIT),
            max_index,
            stage: DiscoveryStage::Initial,
            next_start: 0,
            highest_used_index: None,
        }
    }

    /// Indices to query next, or `None` once the scan is complete.
    pub fn next_batch(&self) -> Option<Range<u32>> {
        if self.is_complete() || self.next_start >= self.max_index {
            return None;
        }
        let end = cmp::min(self.next_start.saturating_add(self.limit), self.max_index);
        Some(self.next_start..end)
    }

    /// Record which indices of the batch returned by [`next_batch`](Self::next_batch)
    /// have history. Indices outside the batch are ignored.
    pub fn record_batch(&mut self, used: &[u32]) {
        let Some(batch) = self.next_batch() else {
            return;
        };
        let last_used = used.iter().copied().filter(|i| batch.contains(i)).max();
        match last_used {
            None => self.stage = DiscoveryStage::Complete,
            Some(index) => {
                self.highest_used_index = Some(index);
                self.next_start = batch.end;
                self.stage = if batch.end >= self.max_index {
                    DiscoveryStage::Complete
                } else {
                    DiscoveryStage::Scanning
                };
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.stage == DiscoveryStage::Complete
    }

    /// The next free index: last used index plus one, or 0 for an unused chain.
    pub fn result(&self) -> u32 {
        self.highest_used_index.map(|i| i + 1).unwrap_or(0)
    }
}

/// Scan for usage past the locally tracked frontier.
///
/// Rather than checking only the address at `cursor + limit - 1`, the whole window
/// `cursor..cursor + limit` is queried, so activity anywhere in it is seen. If an
/// address in the window has activity, the cursor moves to the highest active
/// index plus one and the next window is scanned. Activity at the last index of
/// the window advances the cursor by a full window, same as a single-address check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LagScan {
    cursor: u32,
    limit: u32,
    max_index: u32,
    done: bool,
}

impl LagScan {
    pub fn new(cursor: u32, limit: u32, max_index: u32) -> Self {
        Self {
            cursor,
            limit: cmp::max(limit, 1),
            max_index,
            done: false,
        }
    }

    /// Indices to check, or `None` when the scan is over.
    pub fn next_window(&self) -> Option<Range<u32>> {
        if self.done || self.cursor >= self.max_index {
            return None;
        }
        let end = cmp::min(self.cursor.saturating_add(self.limit), self.max_index);
        Some(self.cursor..end)
    }

    /// Record which indices of the current window have activity.
    pub fn record(&mut self, used: &[u32]) {
        let Some(window) = self.next_window() else {
            return;
        };
        match used.iter().copied().filter(|i| window.contains(i)).max() {
            Some(index) => self.cursor = index + 1,
            None => self.done = true,
        }
    }

    /// Current cursor.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }
}
