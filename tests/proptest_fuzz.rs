//! Property-based tests (fuzzing) for the persistence engine.
//!
//! Uses proptest to generate random entities, statements and identifiers
//! and verify mapping round-trips, cache-key determinism, and that the
//! statement builder only ever returns clean errors.
//!
//! Run with: `cargo test --test proptest_fuzz`

use proptest::prelude::*;
use serde::{Deserialize, Serialize};

use entity_persistence::batching::{BatchConfig, HybridBatcher};
use entity_persistence::entity;
use entity_persistence::query::cache_key::entry_key;
use entity_persistence::query::{build_select, rehydrate, Filter, Op, QueryError, QuerySpec};
use entity_persistence::schema::{is_identifier, Entity, SqlValue};
use entity_persistence::storage::{Row, Statement};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Profile {
    id: i64,
    handle: String,
    bio: Option<String>,
    verified: bool,
    score: f64,
    age: Option<u32>,
}

entity!(Profile => "profiles" {
    key: [id],
    fields: [id, handle, bio, verified, score, age],
});

// =============================================================================
// Strategies for generating test data
// =============================================================================

fn profile_strategy() -> impl Strategy<Value = Profile> {
    (
        any::<i64>(),
        ".{0,40}",
        proptest::option::of(".{0,80}"),
        any::<bool>(),
        -1.0e9f64..1.0e9f64,
        proptest::option::of(any::<u32>()),
    )
        .prop_map(|(id, handle, bio, verified, score, age)| Profile {
            id,
            handle,
            bio,
            verified,
            score,
            age,
        })
}

fn sql_value_strategy() -> impl Strategy<Value = SqlValue> {
    prop_oneof![
        Just(SqlValue::Null),
        any::<i64>().prop_map(SqlValue::Integer),
        (-1.0e12f64..1.0e12f64).prop_map(SqlValue::Real),
        ".{0,20}".prop_map(SqlValue::Text),
        any::<bool>().prop_map(SqlValue::Bool),
    ]
}

fn statement_strategy() -> impl Strategy<Value = Statement> {
    (".{0,60}", prop::collection::vec(sql_value_strategy(), 0..8))
        .prop_map(|(sql, params)| Statement::new(sql, params))
}

// =============================================================================
// Entity mapping
// =============================================================================

proptest! {
    #[test]
    fn prop_rehydrate_inverts_row_of(profile in profile_strategy()) {
        let meta = Profile::metadata();
        let row = Row(meta.row_of(&profile));
        let back = rehydrate(meta, row).unwrap();
        prop_assert_eq!(back, profile);
    }

    #[test]
    fn prop_short_rows_are_rejected(profile in profile_strategy(), keep in 0usize..6) {
        let meta = Profile::metadata();
        let mut values = meta.row_of(&profile);
        values.truncate(keep);
        prop_assert!(rehydrate(meta, Row(values)).is_err());
    }

    #[test]
    fn prop_json_scalars_round_trip(value in sql_value_strategy()) {
        let back = SqlValue::from_json(&value.to_json());
        match value {
            // JSON cannot tell 2.0 from 2
            SqlValue::Real(r) => match back {
                Some(SqlValue::Real(b)) => prop_assert_eq!(b, r),
                Some(SqlValue::Integer(i)) => prop_assert_eq!(i as f64, r),
                other => prop_assert!(false, "unexpected {:?}", other),
            },
            other => prop_assert_eq!(back, Some(other)),
        }
    }
}

// =============================================================================
// Cache keys
// =============================================================================

proptest! {
    #[test]
    fn prop_entry_key_deterministic(statement in statement_strategy(), gen in any::<i64>()) {
        let a = entry_key("ns", "users", &statement, &[("users", gen)]);
        let b = entry_key("ns", "users", &statement.clone(), &[("users", gen)]);
        prop_assert_eq!(&a, &b);
        prop_assert!(a.starts_with("ns:users:"));
    }

    #[test]
    fn prop_generation_changes_key(statement in statement_strategy(), gen in 0i64..i64::MAX) {
        let old = entry_key("ns", "users", &statement, &[("users", gen)]);
        let new = entry_key("ns", "users", &statement, &[("users", gen + 1)]);
        prop_assert_ne!(old, new);
    }

    #[test]
    fn prop_param_boundaries_matter(a in "[a-z]{1,10}", b in "[a-z]{1,10}") {
        let split = Statement::new("SELECT ?", vec![SqlValue::Text(a.clone()), SqlValue::Text(b.clone())]);
        let joined = Statement::new("SELECT ?", vec![SqlValue::Text(format!("{}{}", a, b))]);
        prop_assert_ne!(
            entry_key("ns", "t", &split, &[("t", 0)]),
            entry_key("ns", "t", &joined, &[("t", 0)])
        );
    }

    #[test]
    fn prop_value_type_matters(n in any::<i64>()) {
        let int = Statement::new("SELECT ?", vec![SqlValue::Integer(n)]);
        let text = Statement::new("SELECT ?", vec![SqlValue::Text(n.to_string())]);
        prop_assert_ne!(
            entry_key("ns", "t", &int, &[("t", 0)]),
            entry_key("ns", "t", &text, &[("t", 0)])
        );
    }
}

// =============================================================================
// Statement builder
// =============================================================================

proptest! {
    #[test]
    fn prop_arbitrary_field_names_never_reach_sql(field in "[^.]{0,30}") {
        let spec = QuerySpec {
            filters: vec![Filter::new(field.clone(), Op::Eq, 1i64)],
            ..Default::default()
        };
        match build_select(Profile::metadata(), &spec) {
            Ok(statement) => {
                let predicate = format!("profiles.{} = ?", field);
                prop_assert!(Profile::metadata().has_field(&field));
                prop_assert!(statement.sql.contains(&predicate));
            }
            Err(QueryError::InvalidIdentifier(_)) => prop_assert!(!is_identifier(&field)),
            Err(QueryError::UnknownField { .. }) => prop_assert!(is_identifier(&field)),
            Err(e) => prop_assert!(false, "unexpected error {}", e),
        }
    }

    #[test]
    fn prop_in_binds_every_value(values in prop::collection::vec(any::<i64>(), 1..50)) {
        let spec = QuerySpec {
            filters: vec![Filter::any_of("id", values.clone())],
            ..Default::default()
        };
        let statement = build_select(Profile::metadata(), &spec).unwrap();
        prop_assert_eq!(statement.params.len(), values.len());
        prop_assert_eq!(statement.sql.matches('?').count(), values.len());
    }
}

// =============================================================================
// Batch accumulator
// =============================================================================

proptest! {
    #[test]
    fn prop_batcher_keeps_order_across_requeue(
        items in prop::collection::vec(any::<u16>(), 1..200),
        later in prop::collection::vec(any::<u16>(), 0..50),
    ) {
        let mut batcher = HybridBatcher::new(BatchConfig { flush_ms: 60_000, flush_count: 0 });
        for item in &items {
            prop_assert!(batcher.push(*item).is_none());
        }
        let taken = batcher
            .force_flush_with_reason(entity_persistence::FlushReason::Manual)
            .unwrap();
        for item in &later {
            batcher.push(*item);
        }
        batcher.requeue_front(taken.items);

        let all = batcher
            .force_flush_with_reason(entity_persistence::FlushReason::Manual)
            .unwrap();
        let expected: Vec<u16> = items.iter().chain(later.iter()).copied().collect();
        prop_assert_eq!(all.items, expected);
    }

    #[test]
    fn prop_count_threshold(count in 1usize..50, pushed in 0usize..100) {
        let mut batcher = HybridBatcher::new(BatchConfig { flush_ms: 60_000, flush_count: count });
        let mut signalled = false;
        for i in 0..pushed {
            signalled |= batcher.push(i).is_some();
        }
        prop_assert_eq!(signalled, pushed >= count);
        prop_assert_eq!(batcher.count_reached(), pushed >= count);
    }
}
