// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity metadata registry.
//!
//! Maps Rust structs onto relational tables without per-call reflection.
//! Each entity type carries one immutable [`EntityMetadata`], built on
//! first use (or eagerly through [`Registry::register`]) and shared by
//! every caller for the life of the process.
//!
//! # Design
//!
//! - **Type-erased accessors**: every [`FieldDescriptor`] holds boxed
//!   read/write closures produced by the [`entity!`](crate::entity) macro
//! - **Strict coercion**: [`Column`] conversions fail loudly on mismatch
//! - **Composite keys**: key parts are joined with [`KEY_SEPARATOR`]
//! - **Thread-safe**: the registry uses `parking_lot::RwLock`

mod entity;
mod metadata;
mod registry;
mod value;

pub use metadata::{
    is_identifier, metadata_for, Entity, EntityMetadata, EntityMetadataBuilder, FieldDescriptor,
    Key, MetadataError, WritePolicy, KEY_SEPARATOR,
};
pub(crate) use metadata::check_identifier;
pub use registry::Registry;
pub use value::{Column, ConversionError, FieldType, SqlValue};
