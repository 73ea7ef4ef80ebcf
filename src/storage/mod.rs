// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ports to the relational store and the key-value cache, plus their bindings.

pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;
pub use self::sql::SqlExecutor;
pub use self::traits::{CachePort, Dialect, ExecutionPort, Row, Statement, StorageError};
