// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbox table layout and the statements that read and advance it.
//!
//! ```sql
//! CREATE TABLE outbox (
//!   id INTEGER PRIMARY KEY AUTOINCREMENT,
//!   triggered_table TEXT NOT NULL,   -- primary table that changed
//!   operation TEXT NOT NULL,         -- 'save' | 'delete'
//!   payload TEXT NOT NULL,           -- JSON: the entity, or its key fields on delete
//!   processed INTEGER NOT NULL DEFAULT 0,  -- 0 pending, 1 done, 2 dead
//!   attempts INTEGER NOT NULL DEFAULT 0,
//!   last_error TEXT
//! )
//! ```
//!
//! Rows are appended in the same transaction as the primary write and only
//! ever advanced by the worker.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;

use crate::query::MAX_BIND_PARAMS;
use crate::schema::{check_identifier, Column, MetadataError, SqlValue};
use crate::storage::{Dialect, ExecutionPort, Row, Statement, StorageError};

/// `processed` flag values
pub const PENDING: i64 = 0;
pub const PROCESSED: i64 = 1;
pub const DEAD: i64 = 2;

/// Longest `last_error` kept, in characters
const MAX_ERROR_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Save,
    Delete,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Save => "save",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "save" => Ok(Self::Save),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown outbox operation '{}'", other)),
        }
    }
}

/// A pending change to propagate.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub id: i64,
    pub triggered_table: String,
    pub operation: Operation,
    pub payload: String,
    pub attempts: u32,
}

impl OutboxRecord {
    /// Decode the payload as a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.payload)
    }

    /// Decode the payload as a JSON object.
    pub fn fields(&self) -> Result<serde_json::Map<String, serde_json::Value>, String> {
        match serde_json::from_str(&self.payload) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(other) => Err(format!("payload is not an object: {}", other)),
            Err(e) => Err(format!("malformed payload: {}", e)),
        }
    }
}

/// Statements for one outbox table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbox {
    table: String,
}

impl Outbox {
    pub fn new(table: impl Into<String>) -> Result<Self, MetadataError> {
        let table = table.into();
        check_identifier(&table)?;
        Ok(Self { table })
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// One appended record.
    #[must_use]
    pub fn append(&self, triggered_table: &str, operation: Operation, payload: String) -> Statement {
        Statement::new(
            format!(
                "INSERT INTO {} (triggered_table, operation, payload) VALUES (?, ?, ?)",
                self.table
            ),
            vec![
                SqlValue::from(triggered_table),
                SqlValue::from(operation.as_str()),
                SqlValue::Text(payload),
            ],
        )
    }

    /// Multi-row appends, chunked to stay under the bind budget.
    #[must_use]
    pub fn append_many(&self, triggered_table: &str, operation: Operation, payloads: Vec<String>) -> Vec<Statement> {
        let per_statement = MAX_BIND_PARAMS / 3;
        let mut statements = Vec::new();
        let mut payloads = payloads.into_iter().peekable();
        while payloads.peek().is_some() {
            let chunk: Vec<String> = payloads.by_ref().take(per_statement).collect();
            let rows = vec!["(?, ?, ?)"; chunk.len()].join(", ");
            let params = chunk
                .into_iter()
                .flat_map(|payload| {
                    [
                        SqlValue::from(triggered_table),
                        SqlValue::from(operation.as_str()),
                        SqlValue::Text(payload),
                    ]
                })
                .collect();
            statements.push(Statement::new(
                format!(
                    "INSERT INTO {} (triggered_table, operation, payload) VALUES {}",
                    self.table, rows
                ),
                params,
            ));
        }
        statements
    }

    /// Oldest pending records first.
    #[must_use]
    pub fn poll(&self, limit: usize) -> Statement {
        Statement::new(
            format!(
                "SELECT id, triggered_table, operation, payload, attempts FROM {} \
                 WHERE processed = ? ORDER BY id LIMIT {}",
                self.table, limit
            ),
            vec![SqlValue::Integer(PENDING)],
        )
    }

    /// Flag records as applied.
    #[must_use]
    pub fn mark_processed(&self, ids: &[i64]) -> Vec<Statement> {
        ids.chunks(MAX_BIND_PARAMS - 1)
            .map(|chunk| {
                let mut params = vec![SqlValue::Integer(PROCESSED)];
                params.extend(chunk.iter().map(|id| SqlValue::Integer(*id)));
                Statement::new(
                    format!(
                        "UPDATE {} SET processed = ? WHERE id IN ({})",
                        self.table,
                        vec!["?"; chunk.len()].join(", ")
                    ),
                    params,
                )
            })
            .collect()
    }

    /// Count a failed application; `dead` retires the record for good.
    #[must_use]
    pub fn record_failure(&self, id: i64, error: &str, dead: bool) -> Statement {
        let error: String = error.chars().take(MAX_ERROR_LEN).collect();
        Statement::new(
            format!(
                "UPDATE {} SET attempts = attempts + 1, last_error = ?, processed = ? WHERE id = ?",
                self.table
            ),
            vec![
                SqlValue::Text(error),
                SqlValue::Integer(if dead { DEAD } else { PENDING }),
                SqlValue::Integer(id),
            ],
        )
    }

    /// Retire a row whose `id` is not an integer, matching it by that raw value.
    #[must_use]
    pub fn dead_letter_raw(&self, id: SqlValue, error: &str) -> Statement {
        let error: String = error.chars().take(MAX_ERROR_LEN).collect();
        let mut params = vec![SqlValue::Text(error), SqlValue::Integer(DEAD)];
        let predicate = match id {
            SqlValue::Null => "id IS NULL",
            other => {
                params.push(other);
                "id = ?"
            }
        };
        Statement::new(
            format!(
                "UPDATE {} SET attempts = attempts + 1, last_error = ?, processed = ? WHERE {}",
                self.table, predicate
            ),
            params,
        )
    }

    /// Table and pending-scan index for `dialect`.
    #[must_use]
    pub fn ddl(&self, dialect: Dialect) -> Vec<String> {
        match dialect {
            Dialect::Sqlite => vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        triggered_table TEXT NOT NULL,
                        operation TEXT NOT NULL DEFAULT 'save',
                        payload TEXT NOT NULL,
                        processed INTEGER NOT NULL DEFAULT 0,
                        attempts INTEGER NOT NULL DEFAULT 0,
                        last_error TEXT
                    )",
                    self.table
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS idx_{t}_pending ON {t} (processed, id)",
                    t = self.table
                ),
            ],
            Dialect::MySql => vec![format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BIGINT AUTO_INCREMENT PRIMARY KEY,
                    triggered_table VARCHAR(255) NOT NULL,
                    operation VARCHAR(16) NOT NULL DEFAULT 'save',
                    payload LONGTEXT NOT NULL,
                    processed TINYINT NOT NULL DEFAULT 0,
                    attempts INT NOT NULL DEFAULT 0,
                    last_error TEXT,
                    INDEX idx_pending (processed, id)
                )",
                self.table
            )],
        }
    }

    /// Create the outbox table if it does not exist.
    pub async fn init_schema(&self, port: &dyn ExecutionPort) -> Result<(), StorageError> {
        for sql in self.ddl(port.dialect()) {
            port.execute(&Statement::new(sql, Vec::new())).await?;
        }
        Ok(())
    }

    /// Records still waiting to be applied.
    pub async fn pending_count(&self, port: &dyn ExecutionPort) -> Result<u64, StorageError> {
        self.count_where(port, PENDING).await
    }

    /// Records retired after too many failures.
    pub async fn dead_count(&self, port: &dyn ExecutionPort) -> Result<u64, StorageError> {
        self.count_where(port, DEAD).await
    }

    async fn count_where(&self, port: &dyn ExecutionPort, processed: i64) -> Result<u64, StorageError> {
        let rows = port
            .fetch(&Statement::new(
                format!("SELECT COUNT(*) FROM {} WHERE processed = ?", self.table),
                vec![SqlValue::Integer(processed)],
            ))
            .await?;
        let count = rows
            .into_iter()
            .next()
            .and_then(|row| row.into_values().into_iter().next())
            .map(i64::from_value)
            .transpose()
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .unwrap_or(0);
        Ok(count.max(0) as u64)
    }

    /// Decode a row produced by [`poll`](Self::poll).
    pub fn decode_row(row: Row) -> Result<OutboxRecord, String> {
        let [id, table, operation, payload, attempts]: [SqlValue; 5] = row
            .into_values()
            .try_into()
            .map_err(|values: Vec<SqlValue>| format!("outbox row has {} columns, expected 5", values.len()))?;
        let text = |v: SqlValue| String::from_value(v).map_err(|e| e.to_string());
        Ok(OutboxRecord {
            id: i64::from_value(id).map_err(|e| e.to_string())?,
            triggered_table: text(table)?,
            operation: text(operation)?.parse()?,
            payload: text(payload)?,
            attempts: u32::from_value(attempts).map_err(|e| e.to_string())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_table_name() {
        assert!(Outbox::new("outbox; drop").is_err());
        assert_eq!(Outbox::new("outbox").unwrap().table(), "outbox");
    }

    #[test]
    fn test_append_statement() {
        let outbox = Outbox::new("outbox").unwrap();
        let stmt = outbox.append("users", Operation::Save, "{\"id\":1}".into());
        assert_eq!(
            stmt.sql,
            "INSERT INTO outbox (triggered_table, operation, payload) VALUES (?, ?, ?)"
        );
        assert_eq!(stmt.params[1], SqlValue::Text("save".into()));
    }

    #[test]
    fn test_dead_letter_raw_matches_the_stored_value() {
        let outbox = Outbox::new("outbox").unwrap();
        let stmt = outbox.dead_letter_raw(SqlValue::Text("a1".into()), "bad id");
        assert!(stmt.sql.ends_with("processed = ? WHERE id = ?"));
        assert_eq!(stmt.params[1], SqlValue::Integer(DEAD));
        assert_eq!(stmt.params[2], SqlValue::Text("a1".into()));

        let stmt = outbox.dead_letter_raw(SqlValue::Null, "bad id");
        assert!(stmt.sql.ends_with("WHERE id IS NULL"));
        assert_eq!(stmt.params.len(), 2);
    }

    #[test]
    fn test_append_many_chunks() {
        let outbox = Outbox::new("outbox").unwrap();
        let payloads: Vec<String> = (0..301).map(|i| format!("{{\"id\":{}}}", i)).collect();
        let stmts = outbox.append_many("users", Operation::Delete, payloads);
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].params.len(), 900);
        assert_eq!(stmts[1].params.len(), 3);
        assert!(outbox.append_many("users", Operation::Save, Vec::new()).is_empty());
    }

    #[test]
    fn test_poll_and_mark() {
        let outbox = Outbox::new("outbox").unwrap();
        assert!(outbox.poll(50).sql.ends_with("WHERE processed = ? ORDER BY id LIMIT 50"));
        let marks = outbox.mark_processed(&[1, 2, 3]);
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].sql, "UPDATE outbox SET processed = ? WHERE id IN (?, ?, ?)");
        assert_eq!(marks[0].params[0], SqlValue::Integer(PROCESSED));
    }

    #[test]
    fn test_record_failure_truncates_error() {
        let outbox = Outbox::new("outbox").unwrap();
        let long = "x".repeat(5000);
        let stmt = outbox.record_failure(9, &long, true);
        match &stmt.params[0] {
            SqlValue::Text(s) => assert_eq!(s.len(), MAX_ERROR_LEN),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(stmt.params[1], SqlValue::Integer(DEAD));
    }

    #[test]
    fn test_decode_row() {
        let row = Row(vec![
            SqlValue::Integer(4),
            SqlValue::Text("users".into()),
            SqlValue::Text("delete".into()),
            SqlValue::Text("{\"id\":7}".into()),
            SqlValue::Integer(2),
        ]);
        let record = Outbox::decode_row(row).unwrap();
        assert_eq!(record.id, 4);
        assert_eq!(record.operation, Operation::Delete);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.fields().unwrap()["id"], serde_json::json!(7));

        assert!(Outbox::decode_row(Row(vec![SqlValue::Integer(1)])).is_err());
    }

    #[test]
    fn test_payload_must_be_object() {
        let record = OutboxRecord {
            id: 1,
            triggered_table: "users".into(),
            operation: Operation::Save,
            payload: "[1,2]".into(),
            attempts: 0,
        };
        assert!(record.fields().is_err());
    }
}
