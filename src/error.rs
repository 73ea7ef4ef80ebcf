// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use thiserror::Error;

use crate::query::QueryError;
use crate::schema::MetadataError;
use crate::storage::StorageError;

/// Failure surfaced by repository, query and batcher operations.
///
/// Cache trouble never shows up here: it is logged and read as a miss.
#[derive(Error, Debug)]
pub enum PersistError {
    /// The relational store rejected or failed a statement
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("invalid query: {0}")]
    Query(#[from] QueryError),

    /// A stored row does not fit the entity's metadata (schema drift)
    #[error("row from '{table}' does not match its entity: {reason}")]
    Rehydrate { table: &'static str, reason: String },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("entity in '{table}' violates its invariant: {reason}")]
    Invariant { table: &'static str, reason: String },

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("{0} has been shut down")]
    Shutdown(&'static str),
}

impl From<serde_json::Error> for PersistError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl PersistError {
    /// Whether this came from the store rather than from the caller's input.
    #[must_use]
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Whether retrying the same call unchanged could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_transient())
    }
}
