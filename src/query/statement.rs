// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Statement builder: metadata + inputs -> parameterized SQL.
//!
//! Everything here is a pure function. Column lists always follow field
//! declaration order, so [`rehydrate`] can assign positionally.
//!
//! Field references in filters, joins and ordering are either bare
//! (`email`, resolved against the queried entity's metadata) or qualified
//! (`chats.owner_id`, for the queried table or a joined one). Every name is
//! checked as an identifier before it reaches statement text.
//!
//! ```
//! use entity_persistence::entity;
//! use entity_persistence::query::{build_select, Filter, Op, QuerySpec};
//! use entity_persistence::schema::Entity;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Default, Serialize, Deserialize)]
//! struct User { id: i64, email: String }
//! entity!(User => "users" { key: [id], fields: [id, email] });
//!
//! let spec = QuerySpec {
//!     filters: vec![Filter::new("email", Op::Eq, "a@x.com")],
//!     limit: Some(1),
//!     ..Default::default()
//! };
//! let stmt = build_select(User::metadata(), &spec).unwrap();
//! assert_eq!(
//!     stmt.sql,
//!     "SELECT users.id, users.email FROM users WHERE users.email = ? LIMIT 1"
//! );
//! ```

use std::collections::HashSet;
use std::fmt;

use thiserror::Error;

use super::cache_key::encode_values;
use crate::schema::{is_identifier, ConversionError, EntityMetadata, Key, SqlValue, WritePolicy};
use crate::storage::{Dialect, Row, Statement};

/// Placeholder budget per statement; below SQLite's historical limit of 999.
pub const MAX_BIND_PARAMS: usize = 900;

/// A query the caller assembled cannot be turned into a statement.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("'{0}' is not a valid SQL identifier")]
    InvalidIdentifier(String),
    #[error("table '{table}' has no field '{field}'")]
    UnknownField { table: String, field: String },
    #[error("'{0}' is neither the queried table nor a joined one")]
    UnknownTable(String),
    #[error("table '{0}' is already part of the query")]
    DuplicateTable(String),
    #[error("{op} takes {expected} value(s), got {got}")]
    Arity { op: Op, expected: &'static str, got: usize },
    #[error("key for '{table}' needs {expected} part(s), got {got}")]
    KeyArity { table: String, expected: usize, got: usize },
    #[error("delete statements cannot be ordered")]
    OrderedDelete,
}

/// Row shape did not match entity metadata.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RehydrateError {
    #[error("row has {got} column(s), entity declares {expected}")]
    Shape { expected: usize, got: usize },
    #[error("field '{field}': {source}")]
    Field {
        field: &'static str,
        #[source]
        source: ConversionError,
    },
}

/// Comparison operator of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    IsNull,
    NotNull,
    In,
}

impl Op {
    fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Like => "LIKE",
            Self::IsNull => "IS NULL",
            Self::NotNull => "IS NOT NULL",
            Self::In => "IN",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: Op,
    pub values: Vec<SqlValue>,
}

impl Filter {
    /// Binary comparison, e.g. `age >= 18`.
    pub fn new(field: impl Into<String>, op: Op, value: impl Into<SqlValue>) -> Self {
        Self {
            field: field.into(),
            op,
            values: vec![value.into()],
        }
    }

    /// `IS NULL` / `IS NOT NULL`.
    pub fn unary(field: impl Into<String>, op: Op) -> Self {
        Self {
            field: field.into(),
            op,
            values: Vec::new(),
        }
    }

    /// `field IN (..)`.
    pub fn any_of<V: Into<SqlValue>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self {
            field: field.into(),
            op: Op::In,
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Inner join of `table` on `left_field = right_field`.
///
/// `left_field` resolves against tables already in the query; a bare
/// `right_field` belongs to `table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub table: String,
    pub left_field: String,
    pub right_field: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Accumulated predicates of a fluent query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QuerySpec {
    pub filters: Vec<Filter>,
    pub joins: Vec<Join>,
    pub order: Vec<OrderBy>,
    pub limit: Option<u64>,
}

impl QuerySpec {
    /// Primary table followed by joined tables, without repeats.
    #[must_use]
    pub fn tables<'a>(&'a self, primary: &'a str) -> Vec<&'a str> {
        let mut tables = vec![primary];
        for join in &self.joins {
            if !tables.contains(&join.table.as_str()) {
                tables.push(&join.table);
            }
        }
        tables
    }
}

fn check(name: &str) -> Result<(), QueryError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(QueryError::InvalidIdentifier(name.to_string()))
    }
}

/// Field references resolved against the queried table and its joins.
struct Scope<'a, T> {
    meta: &'a EntityMetadata<T>,
    tables: Vec<&'a str>,
}

/// A resolved `table.column`.
struct Column<'a> {
    table: &'a str,
    qualified: String,
}

impl<'a, T> Scope<'a, T> {
    fn new(meta: &'a EntityMetadata<T>) -> Self {
        Self {
            meta,
            tables: vec![meta.table()],
        }
    }

    fn primary(&self) -> &'a str {
        self.meta.table()
    }

    fn resolve(&self, field: &str) -> Result<Column<'a>, QueryError> {
        let (table, column) = match field.split_once('.') {
            Some((table, column)) => {
                check(table)?;
                let table = self
                    .tables
                    .iter()
                    .copied()
                    .find(|t| *t == table)
                    .ok_or_else(|| QueryError::UnknownTable(table.to_string()))?;
                (table, column)
            }
            None => (self.primary(), field),
        };
        check(column)?;
        if table == self.primary() && !self.meta.has_field(column) {
            return Err(QueryError::UnknownField {
                table: table.to_string(),
                field: column.to_string(),
            });
        }
        Ok(Column {
            table,
            qualified: format!("{}.{}", table, column),
        })
    }

    /// Validate a join and bring its table into scope; returns `(left, right)`.
    fn join(&mut self, join: &'a Join) -> Result<(String, String), QueryError> {
        check(&join.table)?;
        if self.tables.contains(&join.table.as_str()) {
            return Err(QueryError::DuplicateTable(join.table.clone()));
        }
        let left = self.resolve(&join.left_field)?.qualified;
        self.tables.push(&join.table);
        let right = match join.right_field.split_once('.') {
            Some((table, _)) if table != join.table => {
                return Err(QueryError::UnknownTable(table.to_string()));
            }
            Some(_) => self.resolve(&join.right_field)?.qualified,
            None => self.resolve(&format!("{}.{}", join.table, join.right_field))?.qualified,
        };
        Ok((left, right))
    }
}

fn predicate(column: &str, filter: &Filter, params: &mut Vec<SqlValue>) -> Result<String, QueryError> {
    let arity = |expected: &'static str| QueryError::Arity {
        op: filter.op,
        expected,
        got: filter.values.len(),
    };
    match filter.op {
        Op::IsNull | Op::NotNull => {
            if !filter.values.is_empty() {
                return Err(arity("0"));
            }
            Ok(format!("{} {}", column, filter.op.sql()))
        }
        Op::In => {
            if filter.values.is_empty() {
                return Err(arity("1 or more"));
            }
            params.extend(filter.values.iter().cloned());
            Ok(format!("{} IN ({})", column, placeholders(filter.values.len())))
        }
        op => {
            let [value] = filter.values.as_slice() else {
                return Err(arity("1"));
            };
            // `= NULL` never matches
            match (op, value) {
                (Op::Eq, SqlValue::Null) => Ok(format!("{} IS NULL", column)),
                (Op::Ne, SqlValue::Null) => Ok(format!("{} IS NOT NULL", column)),
                _ => {
                    params.push(value.clone());
                    Ok(format!("{} {} ?", column, op.sql()))
                }
            }
        }
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn column_list<T>(meta: &EntityMetadata<T>, qualified: bool) -> String {
    meta.fields()
        .iter()
        .map(|f| {
            if qualified {
                format!("{}.{}", meta.table(), f.name())
            } else {
                f.name().to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Conflict clause that turns an insert into an upsert.
fn upsert_clause<T>(meta: &EntityMetadata<T>, dialect: Dialect) -> String {
    let keys: Vec<&str> = meta.key_fields().map(|f| f.name()).collect();
    let updates: Vec<&str> = meta
        .fields()
        .iter()
        .map(|f| f.name())
        .filter(|name| !meta.is_key_field(name))
        .collect();

    match dialect {
        Dialect::Sqlite if updates.is_empty() => {
            format!("ON CONFLICT({}) DO NOTHING", keys.join(", "))
        }
        Dialect::Sqlite => format!(
            "ON CONFLICT({}) DO UPDATE SET {}",
            keys.join(", "),
            updates
                .iter()
                .map(|c| format!("{c} = excluded.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Dialect::MySql if updates.is_empty() => {
            format!("ON DUPLICATE KEY UPDATE {k} = {k}", k = keys[0])
        }
        Dialect::MySql => format!(
            "ON DUPLICATE KEY UPDATE {}",
            updates
                .iter()
                .map(|c| format!("{c} = VALUES({c})"))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

fn insert_sql<T>(meta: &EntityMetadata<T>, rows: usize, policy: WritePolicy, dialect: Dialect) -> String {
    let row = format!("({})", placeholders(meta.fields().len()));
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        meta.table(),
        column_list(meta, false),
        vec![row; rows].join(", ")
    );
    if policy == WritePolicy::Upsert {
        sql.push(' ');
        sql.push_str(&upsert_clause(meta, dialect));
    }
    sql
}

/// Single-row insert (or upsert) of `entity`.
pub fn build_insert<T>(meta: &EntityMetadata<T>, entity: &T, policy: WritePolicy, dialect: Dialect) -> Statement {
    Statement::new(insert_sql(meta, 1, policy, dialect), meta.row_of(entity))
}

/// Multi-row inserts, chunked to stay under [`MAX_BIND_PARAMS`].
///
/// Under [`WritePolicy::Upsert`] repeated keys collapse to their last
/// occurrence, since one statement may not update the same row twice.
pub fn build_insert_many<T>(
    meta: &EntityMetadata<T>,
    entities: &[T],
    policy: WritePolicy,
    dialect: Dialect,
) -> Vec<Statement> {
    let rows: Vec<&T> = if policy == WritePolicy::Upsert {
        let mut seen = HashSet::new();
        let mut kept: Vec<&T> = entities
            .iter()
            .rev()
            .filter(|e| seen.insert(encode_values(&meta.key_values(e))))
            .collect();
        kept.reverse();
        kept
    } else {
        entities.iter().collect()
    };

    let per_statement = (MAX_BIND_PARAMS / meta.fields().len().max(1)).max(1);
    rows.chunks(per_statement)
        .map(|chunk| {
            let params = chunk.iter().flat_map(|e| meta.row_of(e)).collect();
            Statement::new(insert_sql(meta, chunk.len(), policy, dialect), params)
        })
        .collect()
}

/// `SELECT` of every declared column of the queried table.
///
/// Joined queries are `DISTINCT` so an entity matching several joined rows
/// comes back once.
pub fn build_select<T>(meta: &EntityMetadata<T>, spec: &QuerySpec) -> Result<Statement, QueryError> {
    let mut scope = Scope::new(meta);
    let mut params = Vec::new();

    let mut sql = format!(
        "SELECT {}{} FROM {}",
        if spec.joins.is_empty() { "" } else { "DISTINCT " },
        column_list(meta, true),
        meta.table()
    );

    for join in &spec.joins {
        let (left, right) = scope.join(join)?;
        sql.push_str(&format!(" INNER JOIN {} ON {} = {}", join.table, left, right));
    }

    let predicates = spec
        .filters
        .iter()
        .map(|f| predicate(&scope.resolve(&f.field)?.qualified, f, &mut params))
        .collect::<Result<Vec<_>, _>>()?;
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }

    if !spec.order.is_empty() {
        let order = spec
            .order
            .iter()
            .map(|o| {
                let column = scope.resolve(&o.field)?.qualified;
                Ok(match o.direction {
                    Direction::Asc => format!("{} ASC", column),
                    Direction::Desc => format!("{} DESC", column),
                })
            })
            .collect::<Result<Vec<_>, QueryError>>()?;
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }

    if let Some(limit) = spec.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    Ok(Statement::new(sql, params))
}

/// `DELETE` from the queried table.
///
/// Joins become one correlated `EXISTS` subquery holding the filters on
/// joined tables. A limit deletes through a key subquery wrapped in a
/// derived table, which MySQL requires when the target table is also read.
pub fn build_delete<T>(meta: &EntityMetadata<T>, spec: &QuerySpec) -> Result<Statement, QueryError> {
    if !spec.order.is_empty() {
        return Err(QueryError::OrderedDelete);
    }

    let table = meta.table();
    let mut scope = Scope::new(meta);
    let mut join_conditions = Vec::with_capacity(spec.joins.len());
    for join in &spec.joins {
        join_conditions.push(scope.join(join)?);
    }

    let mut outer_params = Vec::new();
    let mut inner_params = Vec::new();
    let mut outer = Vec::new();
    let mut inner = Vec::new();
    for filter in &spec.filters {
        let column = scope.resolve(&filter.field)?;
        if column.table == table {
            outer.push(predicate(&column.qualified, filter, &mut outer_params)?);
        } else {
            inner.push(predicate(&column.qualified, filter, &mut inner_params)?);
        }
    }

    if let Some((first, rest)) = spec.joins.split_first() {
        let mut from = first.table.clone();
        for (join, (left, right)) in rest.iter().zip(&join_conditions[1..]) {
            from.push_str(&format!(" INNER JOIN {} ON {} = {}", join.table, left, right));
        }
        let (left, right) = &join_conditions[0];
        let mut conditions = vec![format!("{} = {}", left, right)];
        conditions.extend(inner);
        outer.push(format!("EXISTS (SELECT 1 FROM {} WHERE {})", from, conditions.join(" AND ")));
    }

    let mut params = outer_params;
    params.extend(inner_params);
    let where_clause = if outer.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", outer.join(" AND "))
    };

    let sql = match spec.limit {
        None => format!("DELETE FROM {}{}", table, where_clause),
        Some(limit) => {
            let keys: Vec<&str> = meta.key_fields().map(|f| f.name()).collect();
            let qualified: Vec<String> = keys.iter().map(|k| format!("{}.{}", table, k)).collect();
            let target = if keys.len() == 1 {
                keys[0].to_string()
            } else {
                format!("({})", keys.join(", "))
            };
            format!(
                "DELETE FROM {table} WHERE {target} IN (SELECT {keys} FROM (SELECT {qualified} FROM {table}{where_clause} LIMIT {limit}) AS limited)",
                keys = keys.join(", "),
                qualified = qualified.join(", "),
            )
        }
    };

    Ok(Statement::new(sql, params))
}

/// Filters selecting exactly one entity by natural key.
pub fn key_filters<T>(meta: &EntityMetadata<T>, key: &Key) -> Result<Vec<Filter>, QueryError> {
    if key.parts().len() != meta.key_len() {
        return Err(QueryError::KeyArity {
            table: meta.table().to_string(),
            expected: meta.key_len(),
            got: key.parts().len(),
        });
    }
    Ok(meta
        .key_fields()
        .zip(key.parts())
        .map(|(field, value)| Filter::new(field.name(), Op::Eq, value.clone()))
        .collect())
}

/// Deletes of many entities by key, chunked to stay under [`MAX_BIND_PARAMS`].
pub fn build_delete_by_keys<T>(meta: &EntityMetadata<T>, keys: &[Vec<SqlValue>]) -> Vec<Statement> {
    let width = meta.key_len().max(1);
    let names: Vec<&str> = meta.key_fields().map(|f| f.name()).collect();
    let per_statement = (MAX_BIND_PARAMS / width).max(1);

    keys.chunks(per_statement)
        .map(|chunk| {
            let sql = if width == 1 {
                format!("DELETE FROM {} WHERE {} IN ({})", meta.table(), names[0], placeholders(chunk.len()))
            } else {
                let row = format!(
                    "({})",
                    names.iter().map(|n| format!("{} = ?", n)).collect::<Vec<_>>().join(" AND ")
                );
                format!("DELETE FROM {} WHERE {}", meta.table(), vec![row; chunk.len()].join(" OR "))
            };
            Statement::new(sql, chunk.iter().flatten().cloned().collect())
        })
        .collect()
}

/// Rebuild an entity from a row whose columns follow field order.
pub fn rehydrate<T: Default>(meta: &EntityMetadata<T>, row: Row) -> Result<T, RehydrateError> {
    if row.len() != meta.fields().len() {
        return Err(RehydrateError::Shape {
            expected: meta.fields().len(),
            got: row.len(),
        });
    }
    let mut entity = T::default();
    for (field, value) in meta.fields().iter().zip(row.into_values()) {
        field
            .write(&mut entity, value)
            .map_err(|source| RehydrateError::Field {
                field: field.name(),
                source,
            })?;
    }
    Ok(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Entity;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct User {
        id: i64,
        email: String,
        active: bool,
    }

    crate::entity!(User => "users" {
        key: [id],
        fields: [id, email, active],
    });

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Member {
        chat_id: i64,
        user_id: i64,
    }

    crate::entity!(Member => "members" {
        key: [chat_id, user_id],
        fields: [chat_id, user_id],
    });

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Tag {
        scope: String,
        name: String,
        label: Option<String>,
    }

    crate::entity!(Tag => "tags" {
        key: [scope, name],
        fields: [scope, name, label],
    });

    fn user(id: i64, email: &str) -> User {
        User { id, email: email.to_string(), active: true }
    }

    fn tag(scope: &str, name: &str) -> Tag {
        Tag { scope: scope.to_string(), name: name.to_string(), label: None }
    }

    #[test]
    fn test_insert_plain() {
        let stmt = build_insert(User::metadata(), &user(7, "a@x.com"), WritePolicy::Insert, Dialect::Sqlite);
        assert_eq!(stmt.sql, "INSERT INTO users (id, email, active) VALUES (?, ?, ?)");
        assert_eq!(
            stmt.params,
            vec![SqlValue::Integer(7), SqlValue::Text("a@x.com".into()), SqlValue::Bool(true)]
        );
    }

    #[test]
    fn test_upsert_per_dialect() {
        let sqlite = build_insert(User::metadata(), &user(1, "a"), WritePolicy::Upsert, Dialect::Sqlite);
        assert!(sqlite
            .sql
            .ends_with("ON CONFLICT(id) DO UPDATE SET email = excluded.email, active = excluded.active"));

        let mysql = build_insert(User::metadata(), &user(1, "a"), WritePolicy::Upsert, Dialect::MySql);
        assert!(mysql
            .sql
            .ends_with("ON DUPLICATE KEY UPDATE email = VALUES(email), active = VALUES(active)"));
    }

    #[test]
    fn test_upsert_of_key_only_entity() {
        let m = Member { chat_id: 1, user_id: 2 };
        let sqlite = build_insert(Member::metadata(), &m, WritePolicy::Upsert, Dialect::Sqlite);
        assert!(sqlite.sql.ends_with("ON CONFLICT(chat_id, user_id) DO NOTHING"));
        let mysql = build_insert(Member::metadata(), &m, WritePolicy::Upsert, Dialect::MySql);
        assert!(mysql.sql.ends_with("ON DUPLICATE KEY UPDATE chat_id = chat_id"));
    }

    #[test]
    fn test_insert_many_chunks_by_param_budget() {
        let users: Vec<User> = (0..700).map(|i| user(i, "x")).collect();
        let stmts = build_insert_many(User::metadata(), &users, WritePolicy::Insert, Dialect::Sqlite);
        // 3 params per row -> 300 rows per statement
        assert_eq!(stmts.len(), 3);
        assert_eq!(stmts[0].params.len(), 900);
        assert_eq!(stmts[2].params.len(), 300);
        assert!(stmts.iter().all(|s| s.params.len() <= MAX_BIND_PARAMS));
    }

    #[test]
    fn test_upsert_many_keeps_last_duplicate() {
        let users = vec![user(1, "old"), user(2, "b"), user(1, "new")];
        let stmts = build_insert_many(User::metadata(), &users, WritePolicy::Upsert, Dialect::Sqlite);
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].params.len(), 6);
        assert_eq!(stmts[0].params[1], SqlValue::Text("b".into()));
        assert_eq!(stmts[0].params[4], SqlValue::Text("new".into()));
    }

    #[test]
    fn test_upsert_many_keeps_keys_whose_display_collides() {
        // Both spell "a:b:c" once the parts are joined
        let tags = vec![tag("a:b", "c"), tag("a", "b:c"), tag("a", "b:c")];
        let stmts = build_insert_many(Tag::metadata(), &tags, WritePolicy::Upsert, Dialect::Sqlite);
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].params.len(), 6);
        assert_eq!(stmts[0].params[0], SqlValue::Text("a:b".into()));
        assert_eq!(stmts[0].params[3], SqlValue::Text("a".into()));
    }

    #[test]
    fn test_select_with_join_order_limit() {
        let spec = QuerySpec {
            filters: vec![
                Filter::new("active", Op::Eq, true),
                Filter::new("members.chat_id", Op::Eq, 5i64),
            ],
            joins: vec![Join {
                table: "members".into(),
                left_field: "id".into(),
                right_field: "user_id".into(),
            }],
            order: vec![OrderBy { field: "email".into(), direction: Direction::Desc }],
            limit: Some(10),
        };
        let stmt = build_select(User::metadata(), &spec).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT DISTINCT users.id, users.email, users.active FROM users \
             INNER JOIN members ON users.id = members.user_id \
             WHERE users.active = ? AND members.chat_id = ? \
             ORDER BY users.email DESC LIMIT 10"
        );
        assert_eq!(stmt.params, vec![SqlValue::Bool(true), SqlValue::Integer(5)]);
        assert_eq!(spec.tables("users"), vec!["users", "members"]);
    }

    #[test]
    fn test_select_operators() {
        let spec = QuerySpec {
            filters: vec![
                Filter::any_of("id", [1i64, 2, 3]),
                Filter::unary("email", Op::NotNull),
                Filter::new("email", Op::Like, "%@x.com"),
                Filter::new("email", Op::Eq, SqlValue::Null),
            ],
            ..Default::default()
        };
        let stmt = build_select(User::metadata(), &spec).unwrap();
        assert!(stmt.sql.ends_with(
            "WHERE users.id IN (?, ?, ?) AND users.email IS NOT NULL AND users.email LIKE ? AND users.email IS NULL"
        ));
        assert_eq!(stmt.params.len(), 4);
    }

    #[test]
    fn test_select_without_filters_is_table_scan() {
        let stmt = build_select(User::metadata(), &QuerySpec::default()).unwrap();
        assert_eq!(stmt.sql, "SELECT users.id, users.email, users.active FROM users");
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_select_rejects_bad_references() {
        let unknown = QuerySpec { filters: vec![Filter::new("nope", Op::Eq, 1i64)], ..Default::default() };
        assert!(matches!(build_select(User::metadata(), &unknown), Err(QueryError::UnknownField { .. })));

        let injected = QuerySpec {
            filters: vec![Filter::new("id; DROP TABLE users", Op::Eq, 1i64)],
            ..Default::default()
        };
        assert!(matches!(build_select(User::metadata(), &injected), Err(QueryError::InvalidIdentifier(_))));

        let unjoined = QuerySpec { filters: vec![Filter::new("chats.id", Op::Eq, 1i64)], ..Default::default() };
        assert_eq!(
            build_select(User::metadata(), &unjoined),
            Err(QueryError::UnknownTable("chats".into()))
        );

        let self_join = QuerySpec {
            joins: vec![Join { table: "users".into(), left_field: "id".into(), right_field: "id".into() }],
            ..Default::default()
        };
        assert_eq!(
            build_select(User::metadata(), &self_join),
            Err(QueryError::DuplicateTable("users".into()))
        );
    }

    #[test]
    fn test_arity_errors() {
        let empty_in = QuerySpec { filters: vec![Filter::any_of("id", Vec::<i64>::new())], ..Default::default() };
        assert!(matches!(build_select(User::metadata(), &empty_in), Err(QueryError::Arity { op: Op::In, .. })));

        let bad_unary = QuerySpec { filters: vec![Filter::new("id", Op::IsNull, 1i64)], ..Default::default() };
        assert!(matches!(build_select(User::metadata(), &bad_unary), Err(QueryError::Arity { .. })));
    }

    #[test]
    fn test_delete_plain() {
        let spec = QuerySpec { filters: vec![Filter::new("id", Op::Eq, 7i64)], ..Default::default() };
        let stmt = build_delete(User::metadata(), &spec).unwrap();
        assert_eq!(stmt.sql, "DELETE FROM users WHERE users.id = ?");
    }

    #[test]
    fn test_delete_with_join_uses_exists() {
        let spec = QuerySpec {
            filters: vec![
                Filter::new("members.chat_id", Op::Eq, 5i64),
                Filter::new("active", Op::Eq, false),
            ],
            joins: vec![Join {
                table: "members".into(),
                left_field: "users.id".into(),
                right_field: "members.user_id".into(),
            }],
            ..Default::default()
        };
        let stmt = build_delete(User::metadata(), &spec).unwrap();
        assert_eq!(
            stmt.sql,
            "DELETE FROM users WHERE users.active = ? AND EXISTS \
             (SELECT 1 FROM members WHERE users.id = members.user_id AND members.chat_id = ?)"
        );
        // outer params bind before the subquery's
        assert_eq!(stmt.params, vec![SqlValue::Bool(false), SqlValue::Integer(5)]);
    }

    #[test]
    fn test_delete_with_limit_wraps_key_subquery() {
        let spec = QuerySpec {
            filters: vec![Filter::new("chat_id", Op::Eq, 1i64)],
            limit: Some(5),
            ..Default::default()
        };
        let stmt = build_delete(Member::metadata(), &spec).unwrap();
        assert_eq!(
            stmt.sql,
            "DELETE FROM members WHERE (chat_id, user_id) IN (SELECT chat_id, user_id FROM \
             (SELECT members.chat_id, members.user_id FROM members WHERE members.chat_id = ? LIMIT 5) AS limited)"
        );
    }

    #[test]
    fn test_delete_rejects_order() {
        let spec = QuerySpec {
            order: vec![OrderBy { field: "id".into(), direction: Direction::Asc }],
            ..Default::default()
        };
        assert_eq!(build_delete(User::metadata(), &spec), Err(QueryError::OrderedDelete));
    }

    #[test]
    fn test_delete_by_keys() {
        let single = build_delete_by_keys(User::metadata(), &[vec![SqlValue::Integer(1)], vec![SqlValue::Integer(2)]]);
        assert_eq!(single[0].sql, "DELETE FROM users WHERE id IN (?, ?)");

        let composite = build_delete_by_keys(
            Member::metadata(),
            &[vec![SqlValue::Integer(1), SqlValue::Integer(2)], vec![SqlValue::Integer(1), SqlValue::Integer(3)]],
        );
        assert_eq!(
            composite[0].sql,
            "DELETE FROM members WHERE (chat_id = ? AND user_id = ?) OR (chat_id = ? AND user_id = ?)"
        );
        assert_eq!(composite[0].params.len(), 4);
    }

    #[test]
    fn test_key_filters_checks_arity() {
        assert_eq!(key_filters(User::metadata(), &Key::from(7i64)).unwrap().len(), 1);
        assert!(matches!(
            key_filters(Member::metadata(), &Key::from(7i64)),
            Err(QueryError::KeyArity { expected: 2, got: 1, .. })
        ));
    }

    #[test]
    fn test_rehydrate_round_trip() {
        let original = user(7, "a@x.com");
        let row = Row(User::metadata().row_of(&original));
        let back: User = rehydrate(User::metadata(), row).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn test_rehydrate_coerces_sqlite_booleans() {
        let row = Row(vec![SqlValue::Integer(1), SqlValue::Text("a".into()), SqlValue::Integer(0)]);
        let back: User = rehydrate(User::metadata(), row).unwrap();
        assert!(!back.active);
    }

    #[test]
    fn test_rehydrate_fails_loudly() {
        let short = Row(vec![SqlValue::Integer(1)]);
        assert_eq!(
            rehydrate::<User>(User::metadata(), short),
            Err(RehydrateError::Shape { expected: 3, got: 1 })
        );

        let mistyped = Row(vec![SqlValue::Text("x".into()), SqlValue::Text("a".into()), SqlValue::Bool(true)]);
        assert!(matches!(
            rehydrate::<User>(User::metadata(), mistyped),
            Err(RehydrateError::Field { field: "id", .. })
        ));
    }
}
