// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process Cache Port binding.
//!
//! Suitable for tests and single-process deployments. Expired entries are
//! dropped lazily on read and by [`MemoryCache::purge_expired`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::traits::{CachePort, StorageError};

#[derive(Debug, Clone)]
struct CachedValue {
    value: String,
    expires_at: Option<Instant>,
}

impl CachedValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    data: DashMap<String, CachedValue>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entry count (expired entries not yet purged included)
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Keys currently stored, in no particular order
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.data.iter().map(|e| e.key().clone()).collect()
    }

    /// Overwrite a raw value without expiry.
    pub fn insert_raw(&self, key: &str, value: &str) {
        self.data.insert(
            key.to_string(),
            CachedValue {
                value: value.to_string(),
                expires_at: None,
            },
        );
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, v| !v.is_expired(now));
        before - self.data.len()
    }

    pub fn clear(&self) {
        self.data.clear();
    }
}

#[async_trait]
impl CachePort for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = Instant::now();
        match self.data.get(key) {
            Some(entry) if !entry.is_expired(now) => Ok(Some(entry.value.clone())),
            Some(entry) => {
                drop(entry);
                self.data.remove_if(key, |_, v| v.is_expired(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.data.insert(
            key.to_string(),
            CachedValue {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        let before = self.data.len();
        self.data.retain(|k, _| !k.starts_with(prefix));
        Ok((before - self.data.len()) as u64)
    }

    async fn increment(&self, key: &str) -> Result<i64, StorageError> {
        let now = Instant::now();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = if occupied.get().is_expired(now) {
                    0
                } else {
                    occupied.get().value.parse::<i64>().map_err(|_| {
                        StorageError::Backend(format!("value at '{}' is not an integer", key))
                    })?
                };
                let next = current + 1;
                occupied.insert(CachedValue {
                    value: next.to_string(),
                    expires_at: None,
                });
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CachedValue {
                    value: "1".to_string(),
                    expires_at: None,
                });
                Ok(1)
            }
        }
    }
}
