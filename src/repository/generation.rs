// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-table generation counters kept in the Cache Port.
//!
//! Counters are created lazily (absent reads as 0), only ever incremented,
//! and vanish with an explicit cache clear. Atomicity comes from the
//! cache's own `INCR`; no lock is held here.
//!
//! A table whose bump failed is held as unsettled. Prefix removal only
//! reaches entries whose primary table it is, so joined results cached
//! under another primary table survive it; until a later `INCR` succeeds,
//! every read touching an unsettled table bypasses the cache. The mark is
//! local to this process.

use std::sync::Arc;

use dashmap::DashSet;
use tracing::{error, info, warn};

use crate::metrics;
use crate::query::cache_key::{generation_key, table_prefix};
use crate::storage::CachePort;

pub(crate) struct Generations {
    cache: Arc<dyn CachePort>,
    namespace: String,
    unsettled: DashSet<String>,
}

impl Generations {
    pub(crate) fn new(cache: Arc<dyn CachePort>, namespace: String) -> Self {
        Self {
            cache,
            namespace,
            unsettled: DashSet::new(),
        }
    }

    /// Retry the missed bump of an unsettled table; true once it is settled.
    async fn settle(&self, table: &str) -> bool {
        if !self.unsettled.contains(table) {
            return true;
        }
        match self.cache.increment(&generation_key(&self.namespace, table)).await {
            Ok(_) => {
                self.unsettled.remove(table);
                info!(table, "Generation bump recovered");
                true
            }
            Err(_) => false,
        }
    }

    /// Current generation of every table, in order.
    ///
    /// `None` when any counter cannot be read; the caller must then bypass
    /// the cache entirely, since an unknown generation cannot address an entry.
    pub(crate) async fn snapshot<'t>(&self, tables: &[&'t str]) -> Option<Vec<(&'t str, i64)>> {
        let mut generations = Vec::with_capacity(tables.len());
        for table in tables {
            if !self.settle(table).await {
                metrics::record_cache_error("generation");
                return None;
            }
            let key = generation_key(&self.namespace, table);
            let generation = match self.cache.get(&key).await {
                Ok(None) => 0,
                Ok(Some(raw)) => match raw.trim().parse::<i64>() {
                    Ok(g) => g,
                    Err(_) => {
                        warn!(table, value = %raw, "Generation counter is not an integer, bypassing cache");
                        metrics::record_cache_error("generation");
                        return None;
                    }
                },
                Err(e) => {
                    warn!(table, error = %e, "Generation read failed, bypassing cache");
                    metrics::record_cache_error("generation");
                    return None;
                }
            };
            generations.push((*table, generation));
        }
        Some(generations)
    }

    /// Move `table` to a new generation, orphaning every entry keyed on the old one.
    ///
    /// If the counter cannot be bumped, the table turns unsettled and its
    /// own entries are removed directly. Returns whether either step succeeded.
    pub(crate) async fn bump(&self, table: &str) -> bool {
        let key = generation_key(&self.namespace, table);
        match self.cache.increment(&key).await {
            Ok(_) => {
                self.unsettled.remove(table);
                metrics::record_generation_bump(table, true);
                true
            }
            Err(e) => {
                self.unsettled.insert(table.to_string());
                metrics::record_generation_bump(table, false);
                warn!(table, error = %e, "Generation bump failed, removing entries by prefix");
                match self.cache.remove_prefix(&table_prefix(&self.namespace, table)).await {
                    Ok(_) => true,
                    Err(e) => {
                        error!(table, error = %e, "Cache invalidation failed, stale entries may be served until TTL");
                        false
                    }
                }
            }
        }
    }
}
