// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Generic repository: the public CRUD surface of the engine.
//!
//! A [`Repository`] owns one Execution Port, one Cache Port and the cache
//! settings. It is cheap to clone and every clone shares the same ports.
//!
//! # Read path (cache-aside)
//!
//! ```text
//! build statement ─► snapshot generations ─► key = H(sql, params, gens)
//!                                                  │
//!                          hit ◄──── cache.get ────┤
//!                                                  │ miss
//!                    cache.set(ttl ± jitter) ◄── fetch + rehydrate
//! ```
//!
//! # Write path
//!
//! The insert or delete and its outbox record commit in one transaction.
//! Only then is the table's generation bumped, before the call returns, so
//! a read issued after a write on the same task never sees a pre-write
//! cache entry.
//!
//! Cache failures on either path are logged and absorbed.
//!
//! # Example
//!
//! ```rust,no_run
//! use entity_persistence::{entity, EngineConfig, Repository};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Default, Serialize, Deserialize)]
//! struct User { id: i64, email: String }
//! entity!(User => "users" { key: [id], fields: [id, email] });
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let repo = Repository::connect(&EngineConfig {
//!     sql_url: Some("sqlite://chat.db?mode=rwc".into()),
//!     ..Default::default()
//! })
//! .await?;
//!
//! repo.save(&User { id: 7, email: "a@x.com".into() }).await?;
//! let user: Option<User> = repo.find_one(7).await?;
//! let same = repo.select::<User>().where_eq("email", "a@x.com").execute().await?;
//! # Ok(())
//! # }
//! ```

mod api;
pub(crate) mod generation;
mod spawn;

use std::sync::Arc;

use tracing::info;

use crate::config::{CacheConfig, EngineConfig};
use crate::error::PersistError;
use crate::outbox::Outbox;
use crate::storage::{CachePort, ExecutionPort, MemoryCache, RedisCache, SqlExecutor, StorageError};
use generation::Generations;

/// Settings a repository needs beyond its ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryConfig {
    pub cache: CacheConfig,
    pub outbox_table: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for RepositoryConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            cache: config.cache(),
            outbox_table: config.outbox_table.clone(),
        }
    }
}

pub(crate) struct Inner {
    executor: Arc<dyn ExecutionPort>,
    cache: Arc<dyn CachePort>,
    config: RepositoryConfig,
    outbox: Outbox,
    generations: Generations,
}

#[derive(Clone)]
pub struct Repository {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("dialect", &self.inner.executor.dialect())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Repository {
    /// Build a repository over explicit ports.
    pub fn new(
        executor: Arc<dyn ExecutionPort>,
        cache: Arc<dyn CachePort>,
        config: RepositoryConfig,
    ) -> Result<Self, PersistError> {
        let outbox = Outbox::new(config.outbox_table.clone())?;
        let generations = Generations::new(cache.clone(), config.cache.namespace.clone());
        Ok(Self {
            inner: Arc::new(Inner {
                executor,
                cache,
                config,
                outbox,
                generations,
            }),
        })
    }

    /// Connect the ports named in `config`.
    ///
    /// Without `redis_url` the repository caches in process memory.
    #[tracing::instrument(skip(config), fields(has_redis = config.redis_url.is_some()))]
    pub async fn connect(config: &EngineConfig) -> Result<Self, PersistError> {
        let sql_url = config
            .sql_url
            .as_deref()
            .ok_or_else(|| StorageError::Connection("sql_url is not configured".to_string()))?;

        let executor = SqlExecutor::connect(sql_url, config.sql_max_connections, config.sql_acquire_timeout()).await?;

        let cache: Arc<dyn CachePort> = match config.redis_url.as_deref() {
            Some(url) => Arc::new(RedisCache::connect(url).await?),
            None => {
                info!("No redis_url configured, using in-process cache");
                Arc::new(MemoryCache::new())
            }
        };

        Self::new(Arc::new(executor), cache, RepositoryConfig::from(config))
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<dyn ExecutionPort> {
        &self.inner.executor
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<dyn CachePort> {
        &self.inner.cache
    }

    #[must_use]
    pub fn config(&self) -> &RepositoryConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn outbox(&self) -> &Outbox {
        &self.inner.outbox
    }
}
