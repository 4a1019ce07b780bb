//! Import coordinator
//!
//! Walks the strategy table of [`hd_wallet::import`] over one piece of user
//! input. Strategies of a group are tried together: candidates that need a
//! usage check are kept only if the indexer knows their first addresses, and a
//! group whose candidates all came back unused falls back per
//! [`Group::fallback`](hd_wallet::import::Group::fallback).

use std::collections::HashSet;
use std::sync::Arc;

use hd_wallet::address_cache::{AddressCache, AddressSource};
use hd_wallet::import::{strategies, Fallback, Group, ImportOptions, Strategy};
use hd_wallet::{Chain, WalletConfig, WalletKeys};
use tracing::{debug, info};

use crate::cancel::CancellationFlag;
use crate::discovery;
use crate::error::Result;
use crate::indexer::Indexer;
use crate::wallet::HdWallet;

/// Progress events, in the order they happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportProgress {
    /// A strategy matched the input and is being built
    Trying(String),
    /// A wallet was accepted
    Found {
        kind: String,
        address: String,
    },
    /// Import finished with this many wallets
    Done(usize),
}

/// Whether to stop at the first wallet found or collect every reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    First,
    All,
}

type ProgressFn = Box<dyn FnMut(&ImportProgress) + Send>;

/// Turns user input into wallets.
pub struct Importer {
    indexer: Arc<dyn Indexer>,
    config: WalletConfig,
    options: ImportOptions,
    mode: ImportMode,
    offline: bool,
    cancel: CancellationFlag,
    progress: Option<ProgressFn>,
}

impl Importer {
    pub fn new(indexer: Arc<dyn Indexer>, config: WalletConfig) -> Self {
        Self {
            indexer,
            options: ImportOptions::new(config.network),
            config,
            mode: ImportMode::First,
            offline: false,
            cancel: CancellationFlag::new(),
            progress: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.options = self.options.with_passphrase(passphrase);
        self
    }

    pub fn with_mode(mut self, mode: ImportMode) -> Self {
        self.mode = mode;
        self
    }

    /// Skip usage checks: every candidate counts as used.
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Stop between strategies once `flag` is cancelled.
    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancel = flag;
        self
    }

    pub fn on_progress(mut self, callback: impl FnMut(&ImportProgress) + Send + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    fn report(&mut self, event: ImportProgress) {
        debug!("import: {:?}", event);
        if let Some(callback) = self.progress.as_mut() {
            callback(&event);
        }
    }

    /// Read `input` with every matching strategy and return the wallets found.
    /// An input nothing can read yields an empty list.
    pub async fn import(&mut self, input: &str) -> Result<Vec<HdWallet>> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();

        let table = strategies();
        let mut groups: Vec<Group> = Vec::new();
        for strategy in &table {
            if !groups.contains(&strategy.group()) {
                groups.push(strategy.group());
            }
        }

        'groups: for group in groups {
            let mut unused = Vec::new();
            let mut accepted_in_group = 0;
            for strategy in table.iter().filter(|s| s.group() == group && s.matches(input)) {
                self.cancel.check()?;
                self.report(ImportProgress::Trying(strategy.to_string()));
                let candidates = match strategy.build(input, &self.options) {
                    Ok(candidates) => candidates,
                    Err(err) => {
                        debug!("{} could not read the input: {}", strategy, err);
                        continue;
                    }
                };
                for keys in candidates {
                    if self.is_used(strategy, input, &keys).await? {
                        if self.accept(keys, &mut seen, &mut found)? {
                            accepted_in_group += 1;
                            if self.mode == ImportMode::First {
                                break 'groups;
                            }
                        }
                    } else {
                        unused.push(keys);
                    }
                }
            }

            if accepted_in_group == 0 && !unused.is_empty() {
                let fallback: Vec<WalletKeys> = match group.fallback() {
                    Fallback::First => unused.into_iter().take(1).collect(),
                    Fallback::All => unused,
                };
                for keys in fallback {
                    self.accept(keys, &mut seen, &mut found)?;
                }
            }
            if self.mode == ImportMode::First && !found.is_empty() {
                break;
            }
        }

        info!("Import finished with {} wallet(s)", found.len());
        self.report(ImportProgress::Done(found.len()));
        Ok(found)
    }

    async fn is_used(&self, strategy: &Strategy, input: &str, keys: &WalletKeys) -> Result<bool> {
        if self.offline || !strategy.needs_usage_check(input) {
            return Ok(true);
        }
        let mut cache = AddressCache::new();
        discovery::was_ever_used(self.indexer.as_ref(), keys, &mut cache, &self.config).await
    }

    /// Wrap `keys` in a wallet unless an identical wallet was already accepted.
    fn accept(&mut self, keys: WalletKeys, seen: &mut HashSet<String>, found: &mut Vec<HdWallet>) -> Result<bool> {
        let address = keys.address_at(Chain::External, 0)?;
        let kind = keys.kind();
        if !seen.insert(format!("{} {}", kind, address)) {
            return Ok(false);
        }
        let wallet = HdWallet::new(keys, self.config.clone(), self.indexer.clone())?;
        self.report(ImportProgress::Found {
            kind,
            address,
        });
        found.push(wallet);
        Ok(true)
    }
}
