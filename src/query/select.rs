// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fluent select over one entity type.

use std::marker::PhantomData;

use tokio::task::JoinHandle;

use super::statement::{build_select, Direction, Filter, Join, Op, OrderBy, QuerySpec};
use crate::error::PersistError;
use crate::repository::Repository;
use crate::schema::{Entity, SqlValue};
use crate::storage::Statement;

/// Accumulates predicates, then runs through the repository's cache-aside path.
///
/// Bare field names always refer to the queried table; columns of a
/// joined table must be qualified as `table.field`.
#[must_use = "a query does nothing until executed"]
pub struct SelectQuery<T> {
    repo: Repository,
    spec: QuerySpec,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> SelectQuery<T> {
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

    /// Inner join `table` on `left_field = right_field`.
    pub fn join(mut self, table: impl Into<String>, left_field: impl Into<String>, right_field: impl Into<String>) -> Self {
        self.spec.joins.push(Join {
            table: table.into(),
            left_field: left_field.into(),
            right_field: right_field.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.spec.order.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.spec.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    /// The SQL this query would run, without running it.
    pub fn statement(&self) -> Result<Statement, PersistError> {
        Ok(build_select(T::metadata(), &self.spec)?)
    }

    pub async fn execute(self) -> Result<Vec<T>, PersistError> {
        self.repo.run_select::<T>(&self.spec).await
    }

    /// First match, if any.
    pub async fn first(self) -> Result<Option<T>, PersistError> {
        let limited = self.limit(1);
        Ok(limited.execute().await?.into_iter().next())
    }

    pub fn spawn(self) -> JoinHandle<Result<Vec<T>, PersistError>> {
        tokio::spawn(self.execute())
    }
}

impl<T> std::fmt::Debug for SelectQuery<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectQuery").field("spec", &self.spec).finish()
    }
}
