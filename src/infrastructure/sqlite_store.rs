// SQLite Stores - Durable reference implementations over sqlx
// Shard map with append-only history written in the same transaction, and a
// checkpoint table with strict per-plan version monotonicity.

use std::collections::VecDeque;
use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::strong_types::{ShardId, ShardKey, ShardKeyValue};
use crate::error::{QueryError, ShardisResult, StoreError};
use crate::infrastructure::migration::checkpoint::{CheckpointStore, MigrationCheckpoint};
use crate::infrastructure::shard_map::{
    AssignOutcome, AssignmentChangedHook, EnumerableShardMapStore, ShardMapEntry, ShardMapStore,
};

const ENUMERATE_PAGE_SIZE: i64 = 500;

fn store_err(what: &str, err: sqlx::Error) -> StoreError {
    StoreError::connectivity(what.to_string(), err.into())
}

fn decode_key<K: ShardKeyValue>(raw: &str) -> ShardisResult<ShardKey<K>> {
    let value = K::from_canonical(raw).ok_or_else(|| {
        StoreError::serialization(format!("stored key {:?} is not a valid key value", raw))
    })?;
    Ok(ShardKey::new(value))
}

/// SQLite-backed shard map store. Layout:
/// `shard_map(shard_key PK, shard_id)` plus
/// `shard_map_history(id PK, shard_key, old_shard_id, new_shard_id, changed_at_utc)`.
pub struct SqliteShardMapStore<K: ShardKeyValue> {
    pool: SqlitePool,
    hook: std::sync::RwLock<Option<AssignmentChangedHook<K>>>,
    _marker: PhantomData<fn() -> K>,
}

impl<K: ShardKeyValue> SqliteShardMapStore<K> {
    pub async fn new_in_memory() -> ShardisResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| store_err("failed to connect to in-memory SQLite", e))?;
        let store = Self::from_pool(pool);
        store.initialize().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            hook: std::sync::RwLock::new(None),
            _marker: PhantomData,
        }
    }

    /// Create the shard map tables
    pub async fn initialize(&self) -> ShardisResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS shard_map (
                shard_key TEXT PRIMARY KEY,
                shard_id TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("failed to create shard_map table", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS shard_map_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                shard_key TEXT NOT NULL,
                old_shard_id TEXT,
                new_shard_id TEXT NOT NULL,
                changed_at_utc TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("failed to create shard_map_history table", e))?;
        Ok(())
    }

    /// Install the assignment-changed hook. Replaces any previous hook.
    pub fn on_assignment_changed(&self, hook: AssignmentChangedHook<K>) {
        *self.hook.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(hook);
    }

    /// Number of history rows, oldest first ordering is by insertion id
    pub async fn history_len(&self) -> ShardisResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM shard_map_history")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| store_err("failed to count history", e))?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    fn fire_hook(&self, key: &ShardKey<K>, old: Option<&ShardId>, new: &ShardId) {
        let hook = self
            .hook
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(hook) = hook {
            hook(key, old, new);
        }
    }
}

#[async_trait]
impl<K: ShardKeyValue> ShardMapStore<K> for SqliteShardMapStore<K> {
    async fn try_get(&self, key: &ShardKey<K>) -> ShardisResult<Option<ShardId>> {
        let row = sqlx::query("SELECT shard_id FROM shard_map WHERE shard_key = ?1")
            .bind(key.canonical_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_err("failed to read shard_map", e))?;
        Ok(row.map(|r| ShardId::new(r.get::<String, _>("shard_id"))))
    }

    async fn assign(&self, key: &ShardKey<K>, shard_id: &ShardId) -> ShardisResult<()> {
        let key_text = key.canonical_string();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_err("failed to begin transaction", e))?;

        let old: Option<String> =
            sqlx::query("SELECT shard_id FROM shard_map WHERE shard_key = ?1")
                .bind(&key_text)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| store_err("failed to read shard_map", e))?
                .map(|r| r.get("shard_id"));

        sqlx::query(
            "INSERT INTO shard_map (shard_key, shard_id) VALUES (?1, ?2) \
             ON CONFLICT(shard_key) DO UPDATE SET shard_id = excluded.shard_id",
        )
        .bind(&key_text)
        .bind(shard_id.value())
        .execute(&mut *tx)
        .await
        .map_err(|e| store_err("failed to upsert shard_map", e))?;

        sqlx::query(
            "INSERT INTO shard_map_history (shard_key, old_shard_id, new_shard_id, changed_at_utc) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&key_text)
        .bind(&old)
        .bind(shard_id.value())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| store_err("failed to append history", e))?;

        tx.commit()
            .await
            .map_err(|e| store_err("failed to commit assignment", e))?;

        let old_id = old.map(ShardId::new);
        self.fire_hook(key, old_id.as_ref(), shard_id);
        Ok(())
    }

    async fn try_assign(
        &self,
        key: &ShardKey<K>,
        shard_id: &ShardId,
    ) -> ShardisResult<AssignOutcome<K>> {
        let key_text = key.canonical_string();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_err("failed to begin transaction", e))?;

        let result = sqlx::query(
            "INSERT INTO shard_map (shard_key, shard_id) VALUES (?1, ?2) \
             ON CONFLICT(shard_key) DO NOTHING",
        )
        .bind(&key_text)
        .bind(shard_id.value())
        .execute(&mut *tx)
        .await
        .map_err(|e| store_err("failed to insert shard_map", e))?;

        let created = result.rows_affected() == 1;
        if created {
            sqlx::query(
                "INSERT INTO shard_map_history (shard_key, old_shard_id, new_shard_id, changed_at_utc) \
                 VALUES (?1, NULL, ?2, ?3)",
            )
            .bind(&key_text)
            .bind(shard_id.value())
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(|e| store_err("failed to append history", e))?;
        }

        // Read the winning mapping inside the same transaction so losers
        // never observe a stale value
        let current: String = sqlx::query("SELECT shard_id FROM shard_map WHERE shard_key = ?1")
            .bind(&key_text)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| store_err("failed to read winning mapping", e))?
            .get("shard_id");

        tx.commit()
            .await
            .map_err(|e| store_err("failed to commit assignment", e))?;

        if created {
            self.fire_hook(key, None, shard_id);
        }
        Ok(AssignOutcome {
            created,
            mapping: ShardMapEntry {
                key: key.clone(),
                shard_id: ShardId::new(current),
            },
        })
    }
}

#[async_trait]
impl<K: ShardKeyValue> EnumerableShardMapStore<K> for SqliteShardMapStore<K> {
    async fn enumerate(
        &self,
        cancel: &CancellationToken,
    ) -> ShardisResult<BoxStream<'static, ShardisResult<ShardMapEntry<K>>>> {
        struct PageState {
            pool: SqlitePool,
            last_key: Option<String>,
            buffer: VecDeque<(String, String)>,
            token: CancellationToken,
            exhausted: bool,
            done: bool,
        }

        let state = PageState {
            pool: self.pool.clone(),
            last_key: None,
            buffer: VecDeque::new(),
            token: cancel.clone(),
            exhausted: false,
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            if st.token.is_cancelled() {
                st.done = true;
                return Some((Err(QueryError::canceled().into()), st));
            }
            if st.buffer.is_empty() && !st.exhausted {
                let query = match &st.last_key {
                    Some(last) => sqlx::query(
                        "SELECT shard_key, shard_id FROM shard_map \
                         WHERE shard_key > ?1 ORDER BY shard_key LIMIT ?2",
                    )
                    .bind(last.clone())
                    .bind(ENUMERATE_PAGE_SIZE),
                    None => sqlx::query(
                        "SELECT shard_key, shard_id FROM shard_map \
                         ORDER BY shard_key LIMIT ?1",
                    )
                    .bind(ENUMERATE_PAGE_SIZE),
                };
                match query.fetch_all(&st.pool).await {
                    Ok(rows) => {
                        if (rows.len() as i64) < ENUMERATE_PAGE_SIZE {
                            st.exhausted = true;
                        }
                        for row in rows {
                            st.buffer
                                .push_back((row.get("shard_key"), row.get("shard_id")));
                        }
                    }
                    Err(e) => {
                        st.done = true;
                        return Some((
                            Err(store_err("failed to page shard_map", e).into()),
                            st,
                        ));
                    }
                }
            }
            match st.buffer.pop_front() {
                Some((raw_key, shard_id)) => {
                    st.last_key = Some(raw_key.clone());
                    let entry = decode_key::<K>(&raw_key).map(|key| ShardMapEntry {
                        key,
                        shard_id: ShardId::new(shard_id),
                    });
                    if entry.is_err() {
                        st.done = true;
                    }
                    Some((entry, st))
                }
                None => None,
            }
        });
        Ok(stream.boxed())
    }
}

/// SQLite-backed checkpoint store. Layout:
/// `migration_checkpoint(plan_id PK, version, updated_at_utc, payload)` with
/// the JSON payload shape shared by all checkpoint stores.
pub struct SqliteCheckpointStore<K: ShardKeyValue> {
    pool: SqlitePool,
    _marker: PhantomData<fn() -> K>,
}

impl<K: ShardKeyValue> SqliteCheckpointStore<K> {
    pub async fn new_in_memory() -> ShardisResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| store_err("failed to connect to in-memory SQLite", e))?;
        let store = Self::from_pool(pool);
        store.initialize().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }

    pub async fn initialize(&self) -> ShardisResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS migration_checkpoint (
                plan_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                updated_at_utc TEXT NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("failed to create migration_checkpoint table", e))?;
        Ok(())
    }

    /// Remove a completed plan's row
    pub async fn remove(&self, plan_id: Uuid) -> ShardisResult<()> {
        sqlx::query("DELETE FROM migration_checkpoint WHERE plan_id = ?1")
            .bind(plan_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| store_err("failed to delete checkpoint", e))?;
        Ok(())
    }
}

#[async_trait]
impl<K: ShardKeyValue> CheckpointStore<K> for SqliteCheckpointStore<K> {
    async fn load(&self, plan_id: Uuid) -> ShardisResult<Option<MigrationCheckpoint<K>>> {
        let row = sqlx::query("SELECT payload FROM migration_checkpoint WHERE plan_id = ?1")
            .bind(plan_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_err("failed to read checkpoint", e))?;
        match row {
            Some(row) => {
                let payload: String = row.get("payload");
                Ok(Some(MigrationCheckpoint::from_payload_json(&payload)?))
            }
            None => Ok(None),
        }
    }

    async fn persist(&self, checkpoint: &MigrationCheckpoint<K>) -> ShardisResult<()> {
        let payload = checkpoint.to_payload_json()?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_err("failed to begin transaction", e))?;

        let current: Option<i64> =
            sqlx::query("SELECT version FROM migration_checkpoint WHERE plan_id = ?1")
                .bind(checkpoint.plan_id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| store_err("failed to read checkpoint version", e))?
                .map(|r| r.get("version"));

        if let Some(current) = current {
            if checkpoint.version as i64 <= current {
                return Err(crate::error::MigrationError::new(
                    crate::error::MigrationErrorKind::CheckpointPersistFailed,
                    crate::error::MigrationPhase::Checkpoint,
                    checkpoint.plan_id,
                    format!(
                        "version {} is not greater than persisted version {}",
                        checkpoint.version, current
                    ),
                )
                .into());
            }
        }

        sqlx::query(
            "INSERT INTO migration_checkpoint (plan_id, version, updated_at_utc, payload) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(plan_id) DO UPDATE SET \
             version = excluded.version, \
             updated_at_utc = excluded.updated_at_utc, \
             payload = excluded.payload",
        )
        .bind(checkpoint.plan_id.to_string())
        .bind(checkpoint.version as i64)
        .bind(checkpoint.updated_at_utc.to_rfc3339())
        .bind(&payload)
        .execute(&mut *tx)
        .await
        .map_err(|e| store_err("failed to upsert checkpoint", e))?;

        tx.commit()
            .await
            .map_err(|e| store_err("failed to commit checkpoint", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::migration::plan::KeyMoveState;
    use std::collections::HashMap;

    fn key(s: &str) -> ShardKey<String> {
        ShardKey::new(s.to_string())
    }

    #[tokio::test]
    async fn test_try_assign_atomic_and_history() {
        let store: SqliteShardMapStore<String> =
            SqliteShardMapStore::new_in_memory().await.unwrap();

        let first = store.try_assign(&key("k1"), &ShardId::new("s1")).await.unwrap();
        assert!(first.created);
        let second = store.try_assign(&key("k1"), &ShardId::new("s2")).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.mapping.shard_id, ShardId::new("s1"));

        assert_eq!(store.history_len().await.unwrap(), 1);
        store.assign(&key("k1"), &ShardId::new("s2")).await.unwrap();
        assert_eq!(store.history_len().await.unwrap(), 2);
        assert_eq!(
            store.try_get(&key("k1")).await.unwrap(),
            Some(ShardId::new("s2"))
        );
    }

    #[tokio::test]
    async fn test_enumerate_pages_in_key_order() {
        let store: SqliteShardMapStore<String> =
            SqliteShardMapStore::new_in_memory().await.unwrap();
        for i in (0..20).rev() {
            store
                .try_assign(&key(&format!("key-{:02}", i)), &ShardId::new("s1"))
                .await
                .unwrap();
        }

        let mut stream = store.enumerate(&CancellationToken::new()).await.unwrap();
        let mut keys = Vec::new();
        while let Some(entry) = stream.next().await {
            keys.push(entry.unwrap().key.canonical_string());
        }
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys.len(), 20);
    }

    #[tokio::test]
    async fn test_checkpoint_store_monotonic() {
        let store: SqliteCheckpointStore<String> =
            SqliteCheckpointStore::new_in_memory().await.unwrap();
        let plan_id = Uuid::new_v4();

        let mut states = HashMap::new();
        states.insert(key("k1"), KeyMoveState::Copied);
        let ckpt = MigrationCheckpoint {
            plan_id,
            version: 1,
            updated_at_utc: Utc::now(),
            states,
            last_processed_index: 0,
        };
        store.persist(&ckpt).await.unwrap();

        let stale = MigrationCheckpoint { version: 1, ..ckpt.clone() };
        assert!(store.persist(&stale).await.is_err());

        let next = MigrationCheckpoint { version: 2, ..ckpt };
        store.persist(&next).await.unwrap();

        let loaded = store.load(plan_id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.states.get(&key("k1")), Some(&KeyMoveState::Copied));
    }
}
