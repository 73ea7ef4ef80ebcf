// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache key derivation.
//!
//! An entry key commits to the exact statement, its bound values, and the
//! generation of every table the statement reads:
//!
//! ```text
//! <namespace>:<table>:<sha256 hex>
//! ```
//!
//! Each hashed part is tagged and length-prefixed, so no two distinct
//! inputs share an encoding (`"a","bc"` vs `"ab","c"`, `Integer(1)` vs
//! `Text("1")`). Once any involved table's generation moves, the old key
//! can no longer be produced and its entry is left to expire.

use sha2::{Digest, Sha256};

use crate::schema::SqlValue;
use crate::storage::Statement;

/// Middle segment of generation counter keys.
pub const GENERATION_SEGMENT: &str = "__gen__";

/// Key holding the generation counter of `table`.
#[must_use]
pub fn generation_key(namespace: &str, table: &str) -> String {
    format!("{}:{}:{}", namespace, GENERATION_SEGMENT, table)
}

/// Prefix shared by every entry whose primary table is `table`.
#[must_use]
pub fn table_prefix(namespace: &str, table: &str) -> String {
    format!("{}:{}:", namespace, table)
}

/// Prefix shared by every key the engine writes, counters included.
#[must_use]
pub fn namespace_prefix(namespace: &str) -> String {
    format!("{}:", namespace)
}

/// Type tag and bytes of one value; no two distinct values share both.
fn tagged(value: &SqlValue) -> (u8, Vec<u8>) {
    match value {
        SqlValue::Null => (b'N', Vec::new()),
        SqlValue::Integer(i) => (b'I', i.to_le_bytes().to_vec()),
        SqlValue::Real(r) => (b'R', r.to_bits().to_le_bytes().to_vec()),
        SqlValue::Text(s) => (b'T', s.as_bytes().to_vec()),
        SqlValue::Bool(b) => (b'B', vec![u8::from(*b)]),
    }
}

/// Length-prefixed, tagged encoding of a value sequence.
///
/// Equal encodings mean equal sequences, unlike joined display strings.
pub(crate) fn encode_values(values: &[SqlValue]) -> Vec<u8> {
    let mut out = Vec::new();
    for value in values {
        let (tag, bytes) = tagged(value);
        out.push(tag);
        out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        out.extend_from_slice(&bytes);
    }
    out
}

struct KeyHasher(Sha256);

impl KeyHasher {
    fn part(&mut self, tag: u8, bytes: &[u8]) {
        self.0.update([tag]);
        self.0.update((bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
    }

    fn value(&mut self, value: &SqlValue) {
        let (tag, bytes) = tagged(value);
        self.part(tag, &bytes);
    }
}

/// Entry key for `statement` under the given `(table, generation)` snapshot.
#[must_use]
pub fn entry_key(namespace: &str, primary_table: &str, statement: &Statement, generations: &[(&str, i64)]) -> String {
    let mut hasher = KeyHasher(Sha256::new());
    hasher.part(b'S', statement.sql.as_bytes());
    for param in &statement.params {
        hasher.value(param);
    }
    for (table, generation) in generations {
        hasher.part(b'G', table.as_bytes());
        hasher.part(b'g', &generation.to_le_bytes());
    }
    let digest = hex::encode(hasher.0.finalize());
    format!("{}{}", table_prefix(namespace, primary_table), digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(sql: &str, params: Vec<SqlValue>) -> Statement {
        Statement::new(sql, params)
    }

    #[test]
    fn test_entry_key_layout() {
        let key = entry_key("entity_cache", "users", &stmt("SELECT 1", vec![]), &[("users", 0)]);
        let (prefix, digest) = key.split_at("entity_cache:users:".len());
        assert_eq!(prefix, "entity_cache:users:");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_entry_key_is_deterministic() {
        let s = stmt("SELECT * FROM users WHERE id = ?", vec![SqlValue::Integer(7)]);
        assert_eq!(
            entry_key("ns", "users", &s, &[("users", 3)]),
            entry_key("ns", "users", &s, &[("users", 3)])
        );
    }

    #[test]
    fn test_generation_change_changes_key() {
        let s = stmt("SELECT * FROM users WHERE id = ?", vec![SqlValue::Integer(7)]);
        assert_ne!(
            entry_key("ns", "users", &s, &[("users", 3)]),
            entry_key("ns", "users", &s, &[("users", 4)])
        );
        assert_ne!(
            entry_key("ns", "users", &s, &[("users", 3), ("members", 0)]),
            entry_key("ns", "users", &s, &[("users", 3), ("members", 1)])
        );
    }

    #[test]
    fn test_params_are_unambiguous() {
        let a = stmt("q", vec![SqlValue::Text("a".into()), SqlValue::Text("bc".into())]);
        let b = stmt("q", vec![SqlValue::Text("ab".into()), SqlValue::Text("c".into())]);
        assert_ne!(entry_key("ns", "t", &a, &[]), entry_key("ns", "t", &b, &[]));

        let int = stmt("q", vec![SqlValue::Integer(1)]);
        let text = stmt("q", vec![SqlValue::Text("1".into())]);
        let boolean = stmt("q", vec![SqlValue::Bool(true)]);
        assert_ne!(entry_key("ns", "t", &int, &[]), entry_key("ns", "t", &text, &[]));
        assert_ne!(entry_key("ns", "t", &int, &[]), entry_key("ns", "t", &boolean, &[]));
    }

    #[test]
    fn test_prefixes() {
        assert_eq!(generation_key("ns", "users"), "ns:__gen__:users");
        assert_eq!(table_prefix("ns", "users"), "ns:users:");
        assert!(generation_key("ns", "users").starts_with(&namespace_prefix("ns")));
        assert!(!generation_key("ns", "users").starts_with(&table_prefix("ns", "users")));
    }

    #[test]
    fn test_encoded_values_keep_part_boundaries() {
        let text = |s: &str| SqlValue::Text(s.to_string());
        assert_ne!(encode_values(&[text("a:b"), text("c")]), encode_values(&[text("a"), text("b:c")]));
        assert_ne!(encode_values(&[text("null")]), encode_values(&[SqlValue::Null]));
        assert_eq!(encode_values(&[text("a"), SqlValue::Integer(1)]), encode_values(&[text("a"), SqlValue::Integer(1)]));
    }
}
