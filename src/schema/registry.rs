// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Startup self-check for entity declarations.
//!
//! Registering every entity type once at startup surfaces a misconfigured
//! declaration immediately instead of on its first query.
//!
//! ```rust,ignore
//! let registry = Registry::new();
//! registry.register::<User>()?;
//! registry.register::<Message>()?;
//! assert!(registry.contains_table("users"));
//! ```

use std::any::type_name;
use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::debug;

use super::metadata::{Entity, MetadataError};

/// Table name -> owning entity type.
#[derive(Debug, Default)]
pub struct Registry {
    tables: RwLock<BTreeMap<&'static str, &'static str>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `T`'s declaration and record its table.
    ///
    /// Registering the same type twice is a no-op. A second type claiming
    /// an already-registered table is rejected.
    pub fn register<T: Entity>(&self) -> Result<(), MetadataError> {
        let meta = T::describe()?;
        let table = meta.table();
        let owner = type_name::<T>();

        let mut tables = self.tables.write();
        match tables.get(table) {
            Some(existing) if *existing == owner => Ok(()),
            Some(existing) => Err(MetadataError::TableClaimed {
                table: table.to_string(),
                owner: existing,
            }),
            None => {
                tables.insert(table, owner);
                debug!(table, entity = owner, fields = meta.fields().len(), "Registered entity");
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn contains_table(&self, table: &str) -> bool {
        self.tables.read().contains_key(table)
    }

    /// Type name registered for a table.
    #[must_use]
    pub fn owner_of(&self, table: &str) -> Option<&'static str> {
        self.tables.read().get(table).copied()
    }

    /// All registered tables, sorted.
    #[must_use]
    pub fn tables(&self) -> Vec<&'static str> {
        self.tables.read().keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }
}
