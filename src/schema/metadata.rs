// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-type entity metadata: table, ordered fields, natural key.
//!
//! Metadata is built once per entity type (see the [`entity!`](crate::entity)
//! macro), validated by [`EntityMetadataBuilder::build`], and then shared
//! read-only for the life of the process.

use std::fmt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use super::value::{Column, ConversionError, FieldType, SqlValue};

/// Separator between the parts of a composite natural key.
pub const KEY_SEPARATOR: &str = ":";

/// Misconfigured entity declaration, found by the registry self-check.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("entity table name is empty")]
    EmptyTable,
    #[error("'{0}' is not a valid SQL identifier")]
    InvalidIdentifier(String),
    #[error("table '{table}' declares field '{field}' twice")]
    DuplicateField { table: String, field: String },
    #[error("table '{table}' declares key field '{field}' that is not in its field list")]
    UnknownKeyField { table: String, field: String },
    #[error("table '{0}' declares no key fields")]
    NoKey(String),
    #[error("table '{0}' declares no fields")]
    NoFields(String),
    #[error("table '{table}' is already registered by {owner}")]
    TableClaimed { table: String, owner: &'static str },
}

/// What `save` does when a row with the same key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePolicy {
    /// Plain insert; a duplicate key is a store error.
    #[default]
    Insert,
    /// Insert, or overwrite every non-key column of the existing row.
    Upsert,
}

/// A persistable, identity-bearing value type.
///
/// Implement through [`entity!`](crate::entity) rather than by hand.
pub trait Entity: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static {
    /// Build a fresh description of this type, reporting misconfiguration.
    fn describe() -> Result<EntityMetadata<Self>, MetadataError>;

    /// The process-wide metadata instance for this type.
    fn metadata() -> &'static EntityMetadata<Self>;

    /// Entity-level invariant, checked before save and after rehydration.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Shorthand for `T::metadata()`.
#[must_use]
pub fn metadata_for<T: Entity>() -> &'static EntityMetadata<T> {
    T::metadata()
}

type Getter<T> = Box<dyn Fn(&T) -> SqlValue + Send + Sync>;
type Setter<T> = Box<dyn Fn(&mut T, SqlValue) -> Result<(), ConversionError> + Send + Sync>;

/// One field of an entity: name, declared type, type-erased accessors.
pub struct FieldDescriptor<T> {
    name: &'static str,
    field_type: FieldType,
    nullable: bool,
    get: Getter<T>,
    set: Setter<T>,
}

impl<T> FieldDescriptor<T> {
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    #[must_use]
    pub fn nullable(&self) -> bool {
        self.nullable
    }

    #[must_use]
    pub fn read(&self, entity: &T) -> SqlValue {
        (self.get)(entity)
    }

    pub fn write(&self, entity: &mut T, value: SqlValue) -> Result<(), ConversionError> {
        (self.set)(entity, value)
    }
}

impl<T> fmt::Debug for FieldDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("field_type", &self.field_type)
            .field("nullable", &self.nullable)
            .finish()
    }
}

/// Immutable description of an entity type.
#[derive(Debug)]
pub struct EntityMetadata<T> {
    table: &'static str,
    fields: Vec<FieldDescriptor<T>>,
    /// Indexes into `fields`, in key order
    key: Vec<usize>,
    policy: WritePolicy,
    outbox: bool,
}

impl<T> EntityMetadata<T> {
    #[must_use]
    pub fn builder(table: &'static str) -> EntityMetadataBuilder<T> {
        EntityMetadataBuilder {
            table,
            fields: Vec::new(),
            key: Vec::new(),
            policy: WritePolicy::default(),
            outbox: false,
        }
    }

    #[must_use]
    pub fn table(&self) -> &'static str {
        self.table
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldDescriptor<T>] {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor<T>> {
        self.fields.iter().find(|f| f.name == name)
    }

    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Key fields in declaration order.
    pub fn key_fields(&self) -> impl Iterator<Item = &FieldDescriptor<T>> + '_ {
        self.key.iter().map(move |&i| &self.fields[i])
    }

    #[must_use]
    pub fn is_key_field(&self, name: &str) -> bool {
        self.key_fields().any(|f| f.name == name)
    }

    #[must_use]
    pub fn key_len(&self) -> usize {
        self.key.len()
    }

    #[must_use]
    pub fn default_policy(&self) -> WritePolicy {
        self.policy
    }

    /// Whether saves of this type append an outbox record.
    #[must_use]
    pub fn emits_outbox(&self) -> bool {
        self.outbox
    }

    /// Key column values, in key order.
    #[must_use]
    pub fn key_values(&self, entity: &T) -> Vec<SqlValue> {
        self.key_fields().map(|f| f.read(entity)).collect()
    }

    /// Stable string form of the natural key, parts joined by [`KEY_SEPARATOR`].
    #[must_use]
    pub fn key_of(&self, entity: &T) -> String {
        self.key_values(entity)
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(KEY_SEPARATOR)
    }

    /// Column values for every field, in declaration order.
    #[must_use]
    pub fn row_of(&self, entity: &T) -> Vec<SqlValue> {
        self.fields.iter().map(|f| f.read(entity)).collect()
    }
}

/// Accumulates field declarations; [`build`](Self::build) runs the self-check.
pub struct EntityMetadataBuilder<T> {
    table: &'static str,
    fields: Vec<FieldDescriptor<T>>,
    key: Vec<&'static str>,
    policy: WritePolicy,
    outbox: bool,
}

impl<T: 'static> EntityMetadataBuilder<T> {
    /// Declare a field through a pair of projections onto the struct.
    #[must_use]
    pub fn field<C: Column + 'static>(
        mut self,
        name: &'static str,
        get: fn(&T) -> &C,
        get_mut: fn(&mut T) -> &mut C,
    ) -> Self {
        self.fields.push(FieldDescriptor {
            name,
            field_type: C::FIELD_TYPE,
            nullable: C::NULLABLE,
            get: Box::new(move |entity| get(entity).to_value()),
            set: Box::new(move |entity, value| {
                *get_mut(entity) = C::from_value(value)?;
                Ok(())
            }),
        });
        self
    }

    #[must_use]
    pub fn key(mut self, fields: &[&'static str]) -> Self {
        self.key = fields.to_vec();
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: WritePolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn outbox(mut self, enabled: bool) -> Self {
        self.outbox = enabled;
        self
    }

    pub fn build(self) -> Result<EntityMetadata<T>, MetadataError> {
        if self.table.is_empty() {
            return Err(MetadataError::EmptyTable);
        }
        check_identifier(self.table)?;
        if self.fields.is_empty() {
            return Err(MetadataError::NoFields(self.table.to_string()));
        }

        for (i, field) in self.fields.iter().enumerate() {
            check_identifier(field.name)?;
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(MetadataError::DuplicateField {
                    table: self.table.to_string(),
                    field: field.name.to_string(),
                });
            }
        }

        if self.key.is_empty() {
            return Err(MetadataError::NoKey(self.table.to_string()));
        }
        let mut key = Vec::with_capacity(self.key.len());
        for name in &self.key {
            let index = self
                .fields
                .iter()
                .position(|f| f.name == *name)
                .ok_or_else(|| MetadataError::UnknownKeyField {
                    table: self.table.to_string(),
                    field: name.to_string(),
                })?;
            key.push(index);
        }

        Ok(EntityMetadata {
            table: self.table,
            fields: self.fields,
            key,
            policy: self.policy,
            outbox: self.outbox,
        })
    }
}

/// Whether `name` is safe to splice into statement text.
#[must_use]
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn check_identifier(name: &str) -> Result<(), MetadataError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(MetadataError::InvalidIdentifier(name.to_string()))
    }
}

/// Natural key of one entity, as positional values.
#[derive(Debug, Clone, PartialEq)]
pub struct Key(pub Vec<SqlValue>);

impl Key {
    #[must_use]
    pub fn parts(&self) -> &[SqlValue] {
        &self.0
    }
}

impl From<Vec<SqlValue>> for Key {
    fn from(parts: Vec<SqlValue>) -> Self {
        Self(parts)
    }
}

impl From<SqlValue> for Key {
    fn from(part: SqlValue) -> Self {
        Self(vec![part])
    }
}

impl From<i64> for Key {
    fn from(id: i64) -> Self {
        Self(vec![SqlValue::Integer(id)])
    }
}

impl From<i32> for Key {
    fn from(id: i32) -> Self {
        Self(vec![SqlValue::from(id)])
    }
}

impl From<&str> for Key {
    fn from(id: &str) -> Self {
        Self(vec![SqlValue::from(id)])
    }
}

impl From<String> for Key {
    fn from(id: String) -> Self {
        Self(vec![SqlValue::Text(id)])
    }
}

impl<A: Into<SqlValue>, B: Into<SqlValue>> From<(A, B)> for Key {
    fn from((a, b): (A, B)) -> Self {
        Self(vec![a.into(), b.into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Member {
        chat_id: i64,
        user_id: i64,
        nickname: Option<String>,
    }

    fn member_builder() -> EntityMetadataBuilder<Member> {
        EntityMetadata::builder("members")
            .field("chat_id", |m: &Member| &m.chat_id, |m: &mut Member| &mut m.chat_id)
            .field("user_id", |m: &Member| &m.user_id, |m: &mut Member| &mut m.user_id)
            .field("nickname", |m: &Member| &m.nickname, |m: &mut Member| &mut m.nickname)
    }

    #[test]
    fn test_composite_key_string() {
        let meta = member_builder().key(&["chat_id", "user_id"]).build().unwrap();
        let m = Member { chat_id: 3, user_id: 9, nickname: None };
        assert_eq!(meta.key_of(&m), "3:9");
        assert_eq!(meta.key_len(), 2);
        assert!(meta.is_key_field("user_id"));
        assert!(!meta.is_key_field("nickname"));
    }

    #[test]
    fn test_fields_keep_declaration_order_and_types() {
        let meta = member_builder().key(&["chat_id"]).build().unwrap();
        let names: Vec<_> = meta.fields().iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["chat_id", "user_id", "nickname"]);
        let nickname = meta.field("nickname").unwrap();
        assert_eq!(nickname.field_type(), FieldType::Text);
        assert!(nickname.nullable());
    }

    #[test]
    fn test_accessors_read_and_write() {
        let meta = member_builder().key(&["chat_id"]).build().unwrap();
        let mut m = Member::default();
        meta.field("nickname").unwrap().write(&mut m, SqlValue::Text("bob".into())).unwrap();
        assert_eq!(m.nickname.as_deref(), Some("bob"));
        assert_eq!(meta.row_of(&m)[2], SqlValue::Text("bob".into()));
        assert!(meta.field("chat_id").unwrap().write(&mut m, SqlValue::Text("x".into())).is_err());
    }

    #[test]
    fn test_self_check_rejects_unknown_key_field() {
        let err = member_builder().key(&["id"]).build().unwrap_err();
        assert_eq!(
            err,
            MetadataError::UnknownKeyField { table: "members".into(), field: "id".into() }
        );
    }

    #[test]
    fn test_self_check_rejects_missing_key_and_bad_names() {
        assert!(matches!(member_builder().build(), Err(MetadataError::NoKey(_))));

        let bad_table = EntityMetadata::<Member>::builder("members; drop")
            .field("chat_id", |m: &Member| &m.chat_id, |m: &mut Member| &mut m.chat_id)
            .key(&["chat_id"])
            .build();
        assert!(matches!(bad_table, Err(MetadataError::InvalidIdentifier(_))));

        let empty = EntityMetadata::<Member>::builder("").key(&["chat_id"]).build();
        assert_eq!(empty.unwrap_err(), MetadataError::EmptyTable);
    }

    #[test]
    fn test_self_check_rejects_duplicate_field() {
        let err = member_builder()
            .field("chat_id", |m: &Member| &m.chat_id, |m: &mut Member| &mut m.chat_id)
            .key(&["chat_id"])
            .build()
            .unwrap_err();
        assert!(matches!(err, MetadataError::DuplicateField { .. }));
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_identifier("users"));
        assert!(is_identifier("_chat_2"));
        assert!(!is_identifier("2chat"));
        assert!(!is_identifier("users.id"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn test_key_conversions() {
        assert_eq!(Key::from(7i64).parts(), &[SqlValue::Integer(7)]);
        assert_eq!(Key::from("abc").parts(), &[SqlValue::Text("abc".into())]);
        assert_eq!(
            Key::from((1i64, "x")).parts(),
            &[SqlValue::Integer(1), SqlValue::Text("x".into())]
        );
    }
}
