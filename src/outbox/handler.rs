// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Derived-write handlers, dispatched by triggered table.
//!
//! Records are delivered at least once, so every handler must be
//! idempotent: applying the same record twice leaves the same end state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::record::{Operation, OutboxRecord};
use crate::schema::{check_identifier, MetadataError, SqlValue};
use crate::storage::{Dialect, ExecutionPort, Statement, StorageError};

#[derive(Error, Debug)]
pub enum HandlerError {
    /// The record's payload cannot drive this handler
    #[error("bad payload: {0}")]
    Payload(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait OutboxHandler: Send + Sync {
    /// Perform the derived write(s) for one record.
    async fn apply(&self, record: &OutboxRecord, port: &dyn ExecutionPort) -> Result<(), HandlerError>;

    /// Tables written by [`apply`](Self::apply); their cache generations
    /// are bumped once a batch containing this handler's records commits.
    fn touched_tables(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Handlers keyed by the primary table whose changes they follow.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn OutboxHandler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route records triggered by `table` to `handler`, replacing any earlier one.
    pub fn register(&mut self, table: impl Into<String>, handler: impl OutboxHandler + 'static) -> &mut Self {
        self.handlers.insert(table.into(), Arc::new(handler));
        self
    }

    #[must_use]
    pub fn get(&self, table: &str) -> Option<&Arc<dyn OutboxHandler>> {
        self.handlers.get(table)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tables: Vec<&String> = self.handlers.keys().collect();
        tables.sort();
        f.debug_struct("HandlerRegistry").field("tables", &tables).finish()
    }
}

/// Keeps `view(lookup → target)` in step with a primary table.
///
/// With `users_by_email(email, user_id)` following `users(id, email, ..)`,
/// a save replaces the user's row in the view and a delete removes it.
/// The target field must be part of the primary key, since delete
/// payloads carry only key fields.
#[derive(Debug, Clone)]
pub struct LookupViewHandler {
    view: String,
    lookup_field: String,
    target_field: String,
    lookup_column: String,
    target_column: String,
    dialect: Dialect,
}

impl LookupViewHandler {
    /// View columns named after the payload fields they come from.
    pub fn new(
        view: impl Into<String>,
        lookup_field: impl Into<String>,
        target_field: impl Into<String>,
        dialect: Dialect,
    ) -> Result<Self, MetadataError> {
        let lookup_field = lookup_field.into();
        let target_field = target_field.into();
        Self::with_columns(view, lookup_field.clone(), target_field.clone(), lookup_field, target_field, dialect)
    }

    pub fn with_columns(
        view: impl Into<String>,
        lookup_field: impl Into<String>,
        target_field: impl Into<String>,
        lookup_column: impl Into<String>,
        target_column: impl Into<String>,
        dialect: Dialect,
    ) -> Result<Self, MetadataError> {
        let handler = Self {
            view: view.into(),
            lookup_field: lookup_field.into(),
            target_field: target_field.into(),
            lookup_column: lookup_column.into(),
            target_column: target_column.into(),
            dialect,
        };
        for name in [&handler.view, &handler.lookup_column, &handler.target_column] {
            check_identifier(name)?;
        }
        Ok(handler)
    }

    #[must_use]
    pub fn view(&self) -> &str {
        &self.view
    }

    fn field(payload: &serde_json::Map<String, serde_json::Value>, name: &str) -> Result<SqlValue, HandlerError> {
        let value = payload
            .get(name)
            .ok_or_else(|| HandlerError::Payload(format!("missing field '{}'", name)))?;
        match SqlValue::from_json(value) {
            Some(SqlValue::Null) => Err(HandlerError::Payload(format!("field '{}' is null", name))),
            Some(value) => Ok(value),
            None => Err(HandlerError::Payload(format!("field '{}' is not a scalar", name))),
        }
    }

    fn remove_target(&self, target: SqlValue) -> Statement {
        Statement::new(
            format!("DELETE FROM {} WHERE {} = ?", self.view, self.target_column),
            vec![target],
        )
    }

    fn upsert(&self, lookup: SqlValue, target: SqlValue) -> Statement {
        let conflict = match self.dialect {
            Dialect::Sqlite => format!(
                "ON CONFLICT({l}) DO UPDATE SET {t} = excluded.{t}",
                l = self.lookup_column,
                t = self.target_column
            ),
            Dialect::MySql => format!("ON DUPLICATE KEY UPDATE {t} = VALUES({t})", t = self.target_column),
        };
        Statement::new(
            format!(
                "INSERT INTO {} ({}, {}) VALUES (?, ?) {}",
                self.view, self.lookup_column, self.target_column, conflict
            ),
            vec![lookup, target],
        )
    }
}

#[async_trait]
impl OutboxHandler for LookupViewHandler {
    async fn apply(&self, record: &OutboxRecord, port: &dyn ExecutionPort) -> Result<(), HandlerError> {
        let payload = record.fields().map_err(HandlerError::Payload)?;
        let target = Self::field(&payload, &self.target_field)?;
        match record.operation {
            Operation::Save => {
                let lookup = Self::field(&payload, &self.lookup_field)?;
                port.execute_atomic(&[self.remove_target(target.clone()), self.upsert(lookup, target)])
                    .await?;
            }
            Operation::Delete => {
                port.execute(&self.remove_target(target)).await?;
            }
        }
        Ok(())
    }

    fn touched_tables(&self) -> Vec<String> {
        vec![self.view.clone()]
    }
}
