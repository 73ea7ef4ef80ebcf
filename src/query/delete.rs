// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fluent delete over one entity type.

use std::marker::PhantomData;

use tokio::task::JoinHandle;

use super::statement::{build_delete, Filter, Join, Op, QuerySpec};
use crate::error::PersistError;
use crate::repository::Repository;
use crate::schema::{Entity, SqlValue};
use crate::storage::Statement;

/// Removes rows of the queried table matching every predicate.
///
/// Joins only narrow the match; joined tables are never deleted from.
/// For entities that emit outbox records, matches are resolved to keys
/// first so each removal is recorded in the same transaction.
#[must_use = "a query does nothing until executed"]
pub struct DeleteQuery<T> {
    repo: Repository,
    spec: QuerySpec,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> DeleteQuery<T> {
    pub(crate) fn new(repo: Repository) -> Self {
        Self {
            repo,
            spec: QuerySpec::default(),
            _entity: PhantomData,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, op: Op, value: impl Into<SqlValue>) -> Self {
        self.spec.filters.push(Filter::new(field, op, value));
        self
    }

    pub fn where_eq(self, field: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.filter(field, Op::Eq, value)
    }

    pub fn where_in<V: Into<SqlValue>>(mut self, field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        self.spec.filters.push(Filter::any_of(field, values));
        self
    }

    pub fn where_null(mut self, field: impl Into<String>) -> Self {
        self.spec.filters.push(Filter::unary(field, Op::IsNull));
        self
    }

    pub fn where_not_null(mut self, field: impl Into<String>) -> Self {
        self.spec.filters.push(Filter::unary(field, Op::NotNull));
        self
    }

    pub fn join(mut self, table: impl Into<String>, left_field: impl Into<String>, right_field: impl Into<String>) -> Self {
        self.spec.joins.push(Join {
            table: table.into(),
            left_field: left_field.into(),
            right_field: right_field.into(),
        });
        self
    }

    /// Delete at most `limit` matching rows.
    pub fn limit(mut self, limit: u64) -> Self {
        self.spec.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    pub fn statement(&self) -> Result<Statement, PersistError> {
        Ok(build_delete(T::metadata(), &self.spec)?)
    }

    /// Rows removed.
    pub async fn execute(self) -> Result<u64, PersistError> {
        self.repo.run_delete::<T>(&self.spec).await
    }

    pub fn spawn(self) -> JoinHandle<Result<u64, PersistError>> {
        tokio::spawn(self.execute())
    }
}

impl<T> std::fmt::Debug for DeleteQuery<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeleteQuery").field("spec", &self.spec).finish()
    }
}
