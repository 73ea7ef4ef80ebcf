// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::schema::SqlValue;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Operation timed out")]
    Timeout,
}

impl StorageError {
    /// Outage-like failures that may succeed if retried unchanged.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout)
    }
}

/// SQL flavour of the bound store. Only upsert clauses and DDL differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    MySql,
}

impl Dialect {
    /// Detect from a connection string.
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("sqlite:") {
            Self::Sqlite
        } else {
            Self::MySql
        }
    }
}

/// Statement text with `?` placeholders plus its positional values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    #[must_use]
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -- {} param(s)", self.sql, self.params.len())
    }
}

/// One result row, values in select-list order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row(pub Vec<SqlValue>);

impl Row {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.0.get(index)
    }

    #[must_use]
    pub fn into_values(self) -> Vec<SqlValue> {
        self.0
    }
}

/// Boundary to the relational store.
///
/// Implementations must not pin concurrent callers to one connection:
/// each call acquires its own statement context.
#[async_trait]
pub trait ExecutionPort: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Run a query and collect every row.
    async fn fetch(&self, statement: &Statement) -> Result<Vec<Row>, StorageError>;

    /// Run a write, returning rows affected.
    async fn execute(&self, statement: &Statement) -> Result<u64, StorageError>;

    /// Run several writes as one transaction.
    ///
    /// Returns rows affected per statement. On error nothing is committed.
    async fn execute_atomic(&self, statements: &[Statement]) -> Result<Vec<u64>, StorageError>;
}

/// Boundary to the remote key-value cache.
#[async_trait]
pub trait CachePort: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Remove every key starting with `prefix`, returning how many went.
    async fn remove_prefix(&self, prefix: &str) -> Result<u64, StorageError>;

    /// Atomically add one to an integer key (missing = 0) and return the new value.
    async fn increment(&self, key: &str) -> Result<i64, StorageError>;
}
