// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! sqlx-backed Execution Port.
//!
//! One [`AnyPool`] serves every caller; each call checks out its own
//! connection, so unrelated reads and writes never queue behind each other.
//!
//! ## sqlx Any Driver Quirks
//!
//! - Drivers must be installed at runtime before the first pool is built.
//! - MySQL TEXT columns come back as BLOB, so text decoding falls back to
//!   `Vec<u8>` and converts as UTF-8.
//! - SQLite has no boolean type; booleans round-trip as `0`/`1`
//!   integers and are coerced by the field's declared type.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{Any, AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{AnyPool, Row as _, ValueRef};
use tracing::{debug, info};

use super::traits::{Dialect, ExecutionPort, Row, Statement, StorageError};
use crate::metrics::{self, StatementTimer};
use crate::resilience::retry::{retry, RetryConfig};
use crate::schema::SqlValue;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlExecutor {
    pool: AnyPool,
    dialect: Dialect,
}

impl SqlExecutor {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn connect(
        connection_string: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StorageError> {
        install_drivers();

        let dialect = Dialect::from_url(connection_string);

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(acquire_timeout)
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Connection(e.to_string()))
        })
        .await?;

        let executor = Self { pool, dialect };
        if dialect == Dialect::Sqlite {
            executor.enable_wal_mode().await?;
        }

        info!(?dialect, max_connections, "SQL execution port connected");
        Ok(executor)
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: AnyPool, dialect: Dialect) -> Self {
        Self { pool, dialect }
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    /// WAL lets readers proceed while a writer holds the database.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }
}

fn bind_params<'q>(sql: &'q str, params: &[SqlValue]) -> Query<'q, Any, AnyArguments<'q>> {
    params.iter().fold(sqlx::query(sql), |query, value| match value {
        SqlValue::Null => query.bind(Option::<String>::None),
        SqlValue::Integer(i) => query.bind(*i),
        SqlValue::Real(r) => query.bind(*r),
        SqlValue::Text(s) => query.bind(s.clone()),
        SqlValue::Bool(b) => query.bind(*b),
    })
}

/// Decode one column into the narrowest matching [`SqlValue`].
fn decode_column(row: &AnyRow, index: usize) -> Result<SqlValue, StorageError> {
    let raw = row
        .try_get_raw(index)
        .map_err(|e| StorageError::Backend(format!("column {}: {}", index, e)))?;
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }

    if let Ok(i) = row.try_get::<i64, _>(index) {
        return Ok(SqlValue::Integer(i));
    }
    if let Ok(i) = row.try_get::<i32, _>(index) {
        return Ok(SqlValue::Integer(i64::from(i)));
    }
    if let Ok(i) = row.try_get::<i16, _>(index) {
        return Ok(SqlValue::Integer(i64::from(i)));
    }
    if let Ok(b) = row.try_get::<bool, _>(index) {
        return Ok(SqlValue::Bool(b));
    }
    if let Ok(r) = row.try_get::<f64, _>(index) {
        return Ok(SqlValue::Real(r));
    }
    if let Ok(r) = row.try_get::<f32, _>(index) {
        return Ok(SqlValue::Real(f64::from(r)));
    }
    if let Ok(s) = row.try_get::<String, _>(index) {
        return Ok(SqlValue::Text(s));
    }
    if let Ok(bytes) = row.try_get::<Vec<u8>, _>(index) {
        return String::from_utf8(bytes)
            .map(SqlValue::Text)
            .map_err(|e| StorageError::Backend(format!("column {} is not UTF-8: {}", index, e)));
    }

    Err(StorageError::Backend(format!("column {} has an unsupported type", index)))
}

fn decode_row(row: &AnyRow) -> Result<Row, StorageError> {
    (0..row.len())
        .map(|i| decode_column(row, i))
        .collect::<Result<Vec<_>, _>>()
        .map(Row)
}

/// SQLite busy/locked codes (extended too) and the SQLSTATE for a serialization failure
const RETRYABLE_DB_CODES: &[&str] = &["5", "6", "261", "262", "517", "40001"];

/// Split sqlx failures into outage-like ones and statements the store refused.
fn storage_error(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::PoolTimedOut => StorageError::Timeout,
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StorageError::Connection(e.to_string()),
        sqlx::Error::Database(db) if db.code().is_some_and(|code| RETRYABLE_DB_CODES.contains(&&*code)) => {
            StorageError::Timeout
        }
        _ => StorageError::Backend(e.to_string()),
    }
}

fn tally<T>(kind: &str, result: &Result<T, StorageError>) {
    metrics::record_statement(kind, if result.is_ok() { "success" } else { "error" });
}

#[async_trait]
impl ExecutionPort for SqlExecutor {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn fetch(&self, statement: &Statement) -> Result<Vec<Row>, StorageError> {
        let _timer = StatementTimer::new("fetch");
        debug!(sql = %statement.sql, params = statement.params.len(), "fetch");

        let result = async {
            let rows = bind_params(&statement.sql, &statement.params)
                .fetch_all(&self.pool)
                .await
                .map_err(storage_error)?;
            rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()
        }
        .await;

        tally("fetch", &result);
        result
    }

    async fn execute(&self, statement: &Statement) -> Result<u64, StorageError> {
        let _timer = StatementTimer::new("execute");
        debug!(sql = %statement.sql, params = statement.params.len(), "execute");

        let result = bind_params(&statement.sql, &statement.params)
            .execute(&self.pool)
            .await
            .map(|done| done.rows_affected())
            .map_err(storage_error);

        tally("execute", &result);
        result
    }

    async fn execute_atomic(&self, statements: &[Statement]) -> Result<Vec<u64>, StorageError> {
        let _timer = StatementTimer::new("atomic");
        debug!(statements = statements.len(), "execute_atomic");

        let result = async {
            let mut tx = self.pool.begin().await.map_err(storage_error)?;

            let mut affected = Vec::with_capacity(statements.len());
            for statement in statements {
                // Dropping `tx` on early return rolls back
                let done = bind_params(&statement.sql, &statement.params)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_error)?;
                affected.push(done.rows_affected());
            }

            tx.commit().await.map_err(storage_error)?;
            Ok(affected)
        }
        .await;

        tally("atomic", &result);
        result
    }
}
