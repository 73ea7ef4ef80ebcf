// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scalar values exchanged with the relational store.
//!
//! Every entity field maps to one [`FieldType`] and crosses the
//! Execution Port as a [`SqlValue`]. The [`Column`] trait is the bridge
//! between a Rust field type and those two.
//!
//! Coercion is strict: an `Integer` can become a `bool` only when it is
//! `0` or `1`, a `Real` never becomes an integer, and `NULL` only lands in
//! an `Option<_>` field.
//!
//! ```
//! use entity_persistence::schema::{Column, FieldType, SqlValue};
//!
//! assert_eq!(<i64 as Column>::FIELD_TYPE, FieldType::Integer);
//! assert_eq!(bool::from_value(SqlValue::Integer(1)).unwrap(), true);
//! assert!(i64::from_value(SqlValue::Real(1.5)).is_err());
//! ```

use std::fmt;
use thiserror::Error;

/// Declared type of an entity field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Integer,
    Real,
    Text,
    Boolean,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer => write!(f, "integer"),
            Self::Real => write!(f, "real"),
            Self::Text => write!(f, "text"),
            Self::Boolean => write!(f, "boolean"),
        }
    }
}

/// A positional value bound to, or read back from, a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
}

impl SqlValue {
    /// Name of the variant, used in coercion errors.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Bool(_) => "boolean",
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Convert a scalar JSON value. Arrays and objects have no column form.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(Self::Null),
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Integer)
                .or_else(|| n.as_f64().map(Self::Real)),
            serde_json::Value::String(s) => Some(Self::Text(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }

    /// JSON form; non-finite reals become `null`.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Integer(i) => serde_json::Value::from(*i),
            Self::Real(r) => serde_json::Number::from_f64(*r)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Bool(b) => serde_json::Value::Bool(*b),
        }
    }
}

impl fmt::Display for SqlValue {
    /// Renders the value the way natural keys are spelled.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Real(r) => write!(f, "{}", r),
            Self::Text(s) => write!(f, "{}", s),
            Self::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// A stored value could not be assigned to a field of the declared type.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("cannot read {found} value {value} as {expected}")]
pub struct ConversionError {
    pub expected: FieldType,
    pub found: &'static str,
    pub value: String,
}

impl ConversionError {
    fn new(expected: FieldType, value: &SqlValue) -> Self {
        Self {
            expected,
            found: value.kind(),
            value: format!("{:?}", value),
        }
    }
}

/// A Rust type that can live in an entity column.
pub trait Column: Sized {
    const FIELD_TYPE: FieldType;
    const NULLABLE: bool = false;

    fn to_value(&self) -> SqlValue;
    fn from_value(value: SqlValue) -> Result<Self, ConversionError>;
}

impl Column for i64 {
    const FIELD_TYPE: FieldType = FieldType::Integer;

    fn to_value(&self) -> SqlValue {
        SqlValue::Integer(*self)
    }

    fn from_value(value: SqlValue) -> Result<Self, ConversionError> {
        match value {
            SqlValue::Integer(i) => Ok(i),
            SqlValue::Bool(b) => Ok(i64::from(b)),
            other => Err(ConversionError::new(FieldType::Integer, &other)),
        }
    }
}

impl Column for i32 {
    const FIELD_TYPE: FieldType = FieldType::Integer;

    fn to_value(&self) -> SqlValue {
        SqlValue::Integer(i64::from(*self))
    }

    fn from_value(value: SqlValue) -> Result<Self, ConversionError> {
        let wide = i64::from_value(value)?;
        i32::try_from(wide).map_err(|_| ConversionError::new(FieldType::Integer, &SqlValue::Integer(wide)))
    }
}

impl Column for u32 {
    const FIELD_TYPE: FieldType = FieldType::Integer;

    fn to_value(&self) -> SqlValue {
        SqlValue::Integer(i64::from(*self))
    }

    fn from_value(value: SqlValue) -> Result<Self, ConversionError> {
        let wide = i64::from_value(value)?;
        u32::try_from(wide).map_err(|_| ConversionError::new(FieldType::Integer, &SqlValue::Integer(wide)))
    }
}

impl Column for bool {
    const FIELD_TYPE: FieldType = FieldType::Boolean;

    fn to_value(&self) -> SqlValue {
        SqlValue::Bool(*self)
    }

    fn from_value(value: SqlValue) -> Result<Self, ConversionError> {
        match value {
            SqlValue::Bool(b) => Ok(b),
            SqlValue::Integer(0) => Ok(false),
            SqlValue::Integer(1) => Ok(true),
            other => Err(ConversionError::new(FieldType::Boolean, &other)),
        }
    }
}

impl Column for f64 {
    const FIELD_TYPE: FieldType = FieldType::Real;

    fn to_value(&self) -> SqlValue {
        SqlValue::Real(*self)
    }

    fn from_value(value: SqlValue) -> Result<Self, ConversionError> {
        match value {
            SqlValue::Real(r) => Ok(r),
            // SQLite hands back whole-number REALs as integers
            SqlValue::Integer(i) => Ok(i as f64),
            other => Err(ConversionError::new(FieldType::Real, &other)),
        }
    }
}

impl Column for f32 {
    const FIELD_TYPE: FieldType = FieldType::Real;

    fn to_value(&self) -> SqlValue {
        SqlValue::Real(f64::from(*self))
    }

    /// Only values an `f32` holds exactly; anything else would be rounded.
    fn from_value(value: SqlValue) -> Result<Self, ConversionError> {
        let wide = f64::from_value(value)?;
        let narrow = wide as f32;
        if wide.is_finite() && f64::from(narrow) != wide {
            return Err(ConversionError::new(FieldType::Real, &SqlValue::Real(wide)));
        }
        Ok(narrow)
    }
}

impl Column for String {
    const FIELD_TYPE: FieldType = FieldType::Text;

    fn to_value(&self) -> SqlValue {
        SqlValue::Text(self.clone())
    }

    fn from_value(value: SqlValue) -> Result<Self, ConversionError> {
        match value {
            SqlValue::Text(s) => Ok(s),
            other => Err(ConversionError::new(FieldType::Text, &other)),
        }
    }
}

impl<C: Column> Column for Option<C> {
    const FIELD_TYPE: FieldType = C::FIELD_TYPE;
    const NULLABLE: bool = true;

    fn to_value(&self) -> SqlValue {
        match self {
            Some(inner) => inner.to_value(),
            None => SqlValue::Null,
        }
    }

    fn from_value(value: SqlValue) -> Result<Self, ConversionError> {
        if value.is_null() {
            Ok(None)
        } else {
            C::from_value(value).map(Some)
        }
    }
}
