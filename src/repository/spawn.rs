// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fire-and-join variants of the repository operations.
//!
//! Each call runs on the tokio runtime and hands back a [`JoinHandle`]
//! whose output is exactly what the awaited form returns.

use tokio::task::JoinHandle;

use super::Repository;
use crate::error::PersistError;
use crate::schema::{Entity, Key, SqlValue};

impl Repository {
    pub fn spawn_save<T: Entity>(&self, entity: T) -> JoinHandle<Result<(), PersistError>> {
        let repo = self.clone();
        tokio::spawn(async move { repo.save(&entity).await })
    }

    pub fn spawn_save_all<T: Entity>(&self, entities: Vec<T>) -> JoinHandle<Result<(), PersistError>> {
        let repo = self.clone();
        tokio::spawn(async move { repo.save_all(&entities).await })
    }

    pub fn spawn_find_one<T: Entity>(&self, key: impl Into<Key>) -> JoinHandle<Result<Option<T>, PersistError>> {
        let repo = self.clone();
        let key = key.into();
        tokio::spawn(async move { repo.find_one::<T>(key).await })
    }

    pub fn spawn_find_by_field<T: Entity>(
        &self,
        field: impl Into<String>,
        value: impl Into<SqlValue>,
    ) -> JoinHandle<Result<Vec<T>, PersistError>> {
        let repo = self.clone();
        let field = field.into();
        let value = value.into();
        tokio::spawn(async move { repo.find_by_field::<T>(&field, value).await })
    }

    pub fn spawn_delete_by_id<T: Entity>(&self, key: impl Into<Key>) -> JoinHandle<Result<u64, PersistError>> {
        let repo = self.clone();
        let key = key.into();
        tokio::spawn(async move { repo.delete_by_id::<T>(key).await })
    }

    pub fn spawn_delete_entity<T: Entity>(&self, entity: T) -> JoinHandle<Result<u64, PersistError>> {
        let repo = self.clone();
        tokio::spawn(async move { repo.delete_entity(&entity).await })
    }

    pub fn spawn_delete_batch<T: Entity>(&self, entities: Vec<T>) -> JoinHandle<Result<u64, PersistError>> {
        let repo = self.clone();
        tokio::spawn(async move { repo.delete_batch(&entities).await })
    }
}

#[cfg(test)]
mod tests {
    use crate::repository::{Repository, RepositoryConfig};
    use crate::storage::{MemoryCache, SqlExecutor};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Channel {
        id: i64,
        name: String,
    }

    crate::entity!(Channel => "channels" {
        key: [id],
        fields: [id, name],
        policy: Upsert,
    });

    #[tokio::test]
    async fn test_spawned_ops_match_awaited_ones() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("spawn.db").display());
        let executor = SqlExecutor::connect(&url, 2, Duration::from_secs(5)).await.unwrap();
        sqlx::query("CREATE TABLE channels (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .execute(&executor.pool())
            .await
            .unwrap();
        let repo = Repository::new(Arc::new(executor), Arc::new(MemoryCache::new()), RepositoryConfig::default())
            .unwrap();

        let channels = vec![
            Channel { id: 1, name: "general".into() },
            Channel { id: 2, name: "random".into() },
        ];
        repo.spawn_save_all(channels.clone()).await.unwrap().unwrap();

        let found = repo.spawn_find_one::<Channel>(2).await.unwrap().unwrap();
        assert_eq!(found, Some(channels[1].clone()));

        let by_name = repo.spawn_find_by_field::<Channel>("name", "general").await.unwrap().unwrap();
        assert_eq!(by_name, vec![channels[0].clone()]);

        assert_eq!(repo.spawn_delete_by_id::<Channel>(1).await.unwrap().unwrap(), 1);
        assert_eq!(repo.spawn_find_one::<Channel>(1).await.unwrap().unwrap(), None);
    }
}
