// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Cache Port binding.
//!
//! Plain string keys and values:
//! - `GET` / `SET key value EX ttl` for cache entries
//! - `INCR` for generation counters
//! - `SCAN MATCH prefix*` + `DEL` for prefix removal
//!
//! Prefix removal walks the keyspace incrementally, so it never blocks the
//! server the way `KEYS` would. It is an administrative path, not a hot one.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, AsyncCommands, Client};
use tracing::debug;

use super::traits::{CachePort, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

/// Keys fetched per `SCAN` round trip
const SCAN_COUNT: usize = 500;

pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    /// Connect with startup-mode retry.
    pub async fn connect(connection_string: &str) -> Result<Self, StorageError> {
        let client =
            Client::open(connection_string).map_err(|e| StorageError::Connection(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Connection(e.to_string()))?;

        Ok(Self { connection })
    }

    /// Get a clone of the connection manager
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    /// Escape glob metacharacters so a literal prefix matches only itself.
    fn scan_pattern(prefix: &str) -> String {
        let mut pattern = String::with_capacity(prefix.len() + 1);
        for c in prefix.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('*');
        pattern
    }
}

fn backend(e: redis::RedisError) -> StorageError {
    if e.is_timeout() {
        StorageError::Timeout
    } else if e.is_connection_dropped() || e.is_connection_refusal() {
        StorageError::Connection(e.to_string())
    } else {
        StorageError::Backend(e.to_string())
    }
}

#[async_trait]
impl CachePort for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.connection.clone();
        conn.get(key).await.map_err(backend)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, secs).await.map_err(backend)
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(key).await.map_err(backend)
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        let mut conn = self.connection.clone();
        let pattern = Self::scan_pattern(prefix);
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;

            if !keys.is_empty() {
                let n: u64 = conn.del(&keys).await.map_err(backend)?;
                removed += n;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix, removed, "Removed cache keys by prefix");
        Ok(removed)
    }

    async fn increment(&self, key: &str) -> Result<i64, StorageError> {
        let mut conn = self.connection.clone();
        conn.incr(key, 1i64).await.map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_pattern_escapes_glob() {
        assert_eq!(RedisCache::scan_pattern("entity_cache:users:"), "entity_cache:users:*");
        assert_eq!(RedisCache::scan_pattern("a*b?[c]"), "a\\*b\\?\\[c\\]*");
    }
}
