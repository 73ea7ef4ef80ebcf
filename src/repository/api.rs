// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! CRUD operations and the cache-aside read path.

use tracing::{debug, warn};

use super::Repository;
use crate::error::PersistError;
use crate::metrics;
use crate::outbox::Operation;
use crate::query::cache_key::{entry_key, namespace_prefix};
use crate::query::{
    build_delete, build_delete_by_keys, build_insert, build_insert_many, build_select, key_filters,
    rehydrate, DeleteQuery, Filter, Op, QuerySpec, SelectQuery,
};
use crate::schema::{Entity, EntityMetadata, Key, SqlValue, WritePolicy};
use crate::storage::{Row, Statement};

fn check_invariant<T: Entity>(entity: &T) -> Result<(), PersistError> {
    entity.validate().map_err(|reason| PersistError::Invariant {
        table: T::metadata().table(),
        reason,
    })
}

fn rehydrate_row<T: Entity>(meta: &EntityMetadata<T>, row: Row) -> Result<T, PersistError> {
    rehydrate(meta, row).map_err(|e| PersistError::Rehydrate {
        table: meta.table(),
        reason: e.to_string(),
    })
}

/// JSON object of the key fields, used as the outbox payload of a delete.
fn key_payload<T>(meta: &EntityMetadata<T>, key: &[SqlValue]) -> String {
    let object: serde_json::Map<String, serde_json::Value> = meta
        .key_fields()
        .zip(key)
        .map(|(field, value)| (field.name().to_string(), value.to_json()))
        .collect();
    serde_json::Value::Object(object).to_string()
}

impl Repository {
    /// Start a fluent select over `T`.
    #[must_use]
    pub fn select<T: Entity>(&self) -> SelectQuery<T> {
        SelectQuery::new(self.clone())
    }

    /// Start a fluent delete over `T`.
    #[must_use]
    pub fn delete<T: Entity>(&self) -> DeleteQuery<T> {
        DeleteQuery::new(self.clone())
    }

    /// Insert `entity` under its declared write policy.
    pub async fn save<T: Entity>(&self, entity: &T) -> Result<(), PersistError> {
        self.save_with(entity, T::metadata().default_policy()).await
    }

    /// Insert `entity`, choosing plain insert or upsert explicitly.
    pub async fn save_with<T: Entity>(&self, entity: &T, policy: WritePolicy) -> Result<(), PersistError> {
        self.save_all_with(std::slice::from_ref(entity), policy).await
    }

    /// Insert many entities; all or none commit.
    pub async fn save_all<T: Entity>(&self, entities: &[T]) -> Result<(), PersistError> {
        self.save_all_with(entities, T::metadata().default_policy()).await
    }

    pub async fn save_all_with<T: Entity>(&self, entities: &[T], policy: WritePolicy) -> Result<(), PersistError> {
        if entities.is_empty() {
            return Ok(());
        }
        let meta = T::metadata();
        for entity in entities {
            check_invariant(entity)?;
        }

        let dialect = self.inner.executor.dialect();
        let mut statements = match entities {
            [single] => vec![build_insert(meta, single, policy, dialect)],
            many => build_insert_many(meta, many, policy, dialect),
        };
        if meta.emits_outbox() {
            let payloads = entities
                .iter()
                .map(serde_json::to_string)
                .collect::<Result<Vec<_>, _>>()?;
            statements.extend(self.inner.outbox.append_many(meta.table(), Operation::Save, payloads));
        }

        self.execute_writes(&statements).await?;
        self.invalidate(meta.table()).await;
        debug!(table = meta.table(), count = entities.len(), ?policy, "Saved entities");
        Ok(())
    }

    /// Look up one entity by natural key.
    pub async fn find_one<T: Entity>(&self, key: impl Into<Key>) -> Result<Option<T>, PersistError> {
        let spec = QuerySpec {
            filters: key_filters(T::metadata(), &key.into())?,
            limit: Some(1),
            ..Default::default()
        };
        Ok(self.run_select::<T>(&spec).await?.into_iter().next())
    }

    /// Every entity whose `field` equals `value`.
    pub async fn find_by_field<T: Entity>(
        &self,
        field: &str,
        value: impl Into<SqlValue>,
    ) -> Result<Vec<T>, PersistError> {
        let spec = QuerySpec {
            filters: vec![Filter::new(field, Op::Eq, value)],
            ..Default::default()
        };
        self.run_select::<T>(&spec).await
    }

    /// Delete by natural key; returns rows removed.
    pub async fn delete_by_id<T: Entity>(&self, key: impl Into<Key>) -> Result<u64, PersistError> {
        let key = key.into();
        key_filters(T::metadata(), &key)?;
        self.delete_keys::<T>(vec![key.0]).await
    }

    pub async fn delete_entity<T: Entity>(&self, entity: &T) -> Result<u64, PersistError> {
        self.delete_keys::<T>(vec![T::metadata().key_values(entity)]).await
    }

    /// Delete many entities by key; all or none commit.
    pub async fn delete_batch<T: Entity>(&self, entities: &[T]) -> Result<u64, PersistError> {
        let meta = T::metadata();
        self.delete_keys::<T>(entities.iter().map(|e| meta.key_values(e)).collect())
            .await
    }

    /// Drop every key in the cache namespace, generation counters included.
    ///
    /// Returns how many keys were removed; a cache failure is logged and reads as 0.
    pub async fn clear_cache(&self) -> u64 {
        let prefix = namespace_prefix(&self.inner.config.cache.namespace);
        match self.inner.cache.remove_prefix(&prefix).await {
            Ok(removed) => {
                debug!(prefix, removed, "Cache namespace cleared");
                removed
            }
            Err(e) => {
                warn!(prefix, error = %e, "Cache clear failed");
                metrics::record_cache_error("clear");
                0
            }
        }
    }

    /// Orphan every cache entry that reads `table`.
    pub async fn invalidate(&self, table: &str) -> bool {
        self.inner.generations.bump(table).await
    }

    async fn delete_keys<T: Entity>(&self, keys: Vec<Vec<SqlValue>>) -> Result<u64, PersistError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let meta = T::metadata();
        let mut statements = build_delete_by_keys(meta, &keys);
        let deletes = statements.len();
        if meta.emits_outbox() {
            let payloads = keys.iter().map(|k| key_payload(meta, k)).collect();
            statements.extend(self.inner.outbox.append_many(meta.table(), Operation::Delete, payloads));
        }

        let counts = self.execute_writes(&statements).await?;
        let affected: u64 = counts.iter().take(deletes).sum();
        if affected > 0 {
            self.invalidate(meta.table()).await;
        }
        debug!(table = meta.table(), affected, "Deleted entities");
        Ok(affected)
    }

    /// One statement runs alone; several run as a transaction.
    async fn execute_writes(&self, statements: &[Statement]) -> Result<Vec<u64>, PersistError> {
        let executor = &self.inner.executor;
        match statements {
            [] => Ok(Vec::new()),
            [single] => Ok(vec![executor.execute(single).await?]),
            many => Ok(executor.execute_atomic(many).await?),
        }
    }

    pub(crate) async fn run_select<T: Entity>(&self, spec: &QuerySpec) -> Result<Vec<T>, PersistError> {
        if spec.limit == Some(0) {
            return Ok(Vec::new());
        }

        let meta = T::metadata();
        let table = meta.table();
        let statement = build_select(meta, spec)?;
        let cache = &self.inner.cache;
        let cache_config = &self.inner.config.cache;

        let key = self
            .inner
            .generations
            .snapshot(&spec.tables(table))
            .await
            .map(|generations| entry_key(&cache_config.namespace, table, &statement, &generations));

        if let Some(key) = &key {
            match cache.get(key).await {
                Ok(Some(payload)) => match serde_json::from_str::<Vec<T>>(&payload) {
                    Ok(entities) if entities.iter().all(|e| e.validate().is_ok()) => {
                        metrics::record_cache_lookup(table, "hit");
                        return Ok(entities);
                    }
                    Ok(_) => {
                        warn!(table, key = %key, "Cached entities fail their invariant, treating as miss");
                        metrics::record_cache_lookup(table, "error");
                    }
                    Err(e) => {
                        warn!(table, key = %key, error = %e, "Corrupt cache entry, treating as miss");
                        metrics::record_cache_lookup(table, "error");
                    }
                },
                Ok(None) => metrics::record_cache_lookup(table, "miss"),
                Err(e) => {
                    warn!(table, error = %e, "Cache read failed, treating as miss");
                    metrics::record_cache_lookup(table, "error");
                }
            }
        }

        let rows = self.inner.executor.fetch(&statement).await?;
        let entities = rows
            .into_iter()
            .map(|row| {
                let entity = rehydrate_row(meta, row)?;
                check_invariant(&entity)?;
                Ok(entity)
            })
            .collect::<Result<Vec<T>, PersistError>>()?;

        if let Some(key) = key {
            match serde_json::to_string(&entities) {
                Ok(payload) => {
                    if let Err(e) = cache.set(&key, &payload, cache_config.jittered_ttl()).await {
                        warn!(table, error = %e, "Cache write failed");
                        metrics::record_cache_error("set");
                    }
                }
                Err(e) => warn!(table, error = %e, "Could not serialize result for cache"),
            }
        }

        Ok(entities)
    }

    pub(crate) async fn run_delete<T: Entity>(&self, spec: &QuerySpec) -> Result<u64, PersistError> {
        if spec.limit == Some(0) {
            return Ok(0);
        }
        let meta = T::metadata();

        if meta.emits_outbox() {
            // Resolve matches to keys so each removal carries its outbox record
            let select = build_select(meta, &QuerySpec { order: Vec::new(), ..spec.clone() })?;
            let rows = self.inner.executor.fetch(&select).await?;
            let keys = rows
                .into_iter()
                .map(|row| rehydrate_row(meta, row).map(|e| meta.key_values(&e)))
                .collect::<Result<Vec<_>, _>>()?;
            return self.delete_keys::<T>(keys).await;
        }

        let statement = build_delete(meta, spec)?;
        let affected = self.inner.executor.execute(&statement).await?;
        if affected > 0 {
            self.invalidate(meta.table()).await;
        }
        debug!(table = meta.table(), affected, "Deleted by query");
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::RepositoryConfig;
    use crate::storage::{CachePort, Dialect, ExecutionPort, MemoryCache, StorageError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: i64,
        body: String,
    }

    fn non_empty(note: &Note) -> Result<(), String> {
        if note.body.is_empty() {
            Err("empty body".into())
        } else {
            Ok(())
        }
    }

    crate::entity!(Note => "notes" {
        key: [id],
        fields: [id, body],
        outbox: true,
        validate: non_empty,
    });

    /// Records statements; answers fetches from a canned row set.
    #[derive(Default)]
    struct Recorder {
        statements: Mutex<Vec<Statement>>,
        atomic_batches: Mutex<Vec<usize>>,
        rows: Mutex<Vec<Row>>,
    }

    #[async_trait]
    impl ExecutionPort for Recorder {
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        async fn fetch(&self, statement: &Statement) -> Result<Vec<Row>, StorageError> {
            self.statements.lock().push(statement.clone());
            Ok(self.rows.lock().clone())
        }

        async fn execute(&self, statement: &Statement) -> Result<u64, StorageError> {
            self.statements.lock().push(statement.clone());
            Ok(1)
        }

        async fn execute_atomic(&self, statements: &[Statement]) -> Result<Vec<u64>, StorageError> {
            self.atomic_batches.lock().push(statements.len());
            self.statements.lock().extend(statements.iter().cloned());
            Ok(vec![1; statements.len()])
        }
    }

    fn repo() -> (Repository, Arc<Recorder>, Arc<MemoryCache>) {
        let exec = Arc::new(Recorder::default());
        let cache = Arc::new(MemoryCache::new());
        let repo = Repository::new(exec.clone(), cache.clone(), RepositoryConfig::default()).unwrap();
        (repo, exec, cache)
    }

    #[tokio::test]
    async fn test_save_writes_entity_and_outbox_atomically() {
        let (repo, exec, cache) = repo();
        repo.save(&Note { id: 1, body: "hi".into() }).await.unwrap();

        assert_eq!(*exec.atomic_batches.lock(), vec![2]);
        let statements = exec.statements.lock();
        assert!(statements[0].sql.starts_with("INSERT INTO notes"));
        assert!(statements[1].sql.starts_with("INSERT INTO outbox"));
        assert_eq!(statements[1].params[0], SqlValue::Text("notes".into()));
        assert_eq!(
            cache.get("entity_cache:__gen__:notes").await.unwrap().as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn test_invariant_blocks_save() {
        let (repo, exec, _) = repo();
        let err = repo.save(&Note { id: 1, body: String::new() }).await.unwrap_err();
        assert!(matches!(err, PersistError::Invariant { table: "notes", .. }));
        assert!(exec.statements.lock().is_empty());
    }

    #[tokio::test]
    async fn test_delete_payload_is_key_object() {
        let (repo, exec, _) = repo();
        assert_eq!(repo.delete_by_id::<Note>(7).await.unwrap(), 1);
        let statements = exec.statements.lock();
        assert_eq!(statements[0].sql, "DELETE FROM notes WHERE id IN (?)");
        assert_eq!(statements[1].params[1], SqlValue::Text("delete".into()));
        assert_eq!(statements[1].params[2], SqlValue::Text("{\"id\":7}".into()));
    }

    #[tokio::test]
    async fn test_delete_by_wrong_key_arity() {
        let (repo, _, _) = repo();
        let err = repo.delete_by_id::<Note>((1i64, 2i64)).await.unwrap_err();
        assert!(matches!(err, PersistError::Query(_)));
    }

    #[tokio::test]
    async fn test_query_delete_on_outbox_entity_goes_through_keys() {
        let (repo, exec, _) = repo();
        *exec.rows.lock() = vec![
            Row(vec![SqlValue::Integer(3), SqlValue::Text("a".into())]),
            Row(vec![SqlValue::Integer(4), SqlValue::Text("b".into())]),
        ];
        let affected = repo.delete::<Note>().where_eq("body", "a").execute().await.unwrap();
        assert_eq!(affected, 1);

        let statements = exec.statements.lock();
        assert!(statements[0].sql.starts_with("SELECT notes.id, notes.body FROM notes"));
        assert_eq!(statements[1].sql, "DELETE FROM notes WHERE id IN (?, ?)");
        assert!(statements[2].sql.starts_with("INSERT INTO outbox"));
    }

    #[tokio::test]
    async fn test_limit_zero_touches_nothing() {
        let (repo, exec, cache) = repo();
        let found = repo.select::<Note>().limit(0).execute().await.unwrap();
        assert!(found.is_empty());
        assert!(exec.statements.lock().is_empty());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_rehydrate_failure_is_typed() {
        let (repo, exec, _) = repo();
        *exec.rows.lock() = vec![Row(vec![SqlValue::Text("x".into())])];
        let err = repo.find_one::<Note>(1).await.unwrap_err();
        assert!(matches!(err, PersistError::Rehydrate { table: "notes", .. }));
    }

    #[tokio::test]
    async fn test_clear_cache_drops_namespace() {
        let (repo, _, cache) = repo();
        repo.save(&Note { id: 1, body: "hi".into() }).await.unwrap();
        cache.insert_raw("other:thing", "1");
        assert_eq!(repo.clear_cache().await, 1);
        assert_eq!(cache.keys(), vec!["other:thing".to_string()]);
    }
}
