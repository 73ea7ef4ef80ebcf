// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Statement building, cache keys and the fluent query surface.

pub mod cache_key;
mod delete;
mod select;
mod statement;

pub use delete::DeleteQuery;
pub use select::SelectQuery;
pub use statement::{
    build_delete, build_delete_by_keys, build_insert, build_insert_many, build_select, key_filters, rehydrate,
    Direction, Filter, Join, Op, OrderBy, QueryError, QuerySpec, RehydrateError, MAX_BIND_PARAMS,
};
