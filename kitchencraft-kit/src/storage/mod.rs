//! Storage capability
//!
//! Actors see storage only as `execute(query, params) -> rows`. The runtime
//! uses the same capability to persist each instance's context, region
//! states and revision so a recreated instance resumes where it left off.

mod sqlite;

pub use sqlite::SqliteStorage;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use crate::types::{ActorKey, Revision};

/// One result row, keyed by column name
pub type Row = serde_json::Map<String, Value>;

/// Storage failures
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StorageError {
    #[error("failed to open storage: {0}")]
    Connect(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("failed to decode row: {0}")]
    Decode(String),
}

/// The opaque query capability
#[async_trait]
pub trait Storage: Send + Sync {
    async fn execute(&self, query: &str, params: &[Value]) -> Result<Vec<Row>, StorageError>;
}

const CREATE_STATE_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS actor_state (
        actor_type TEXT NOT NULL,
        actor_id TEXT NOT NULL,
        revision INTEGER NOT NULL,
        context TEXT NOT NULL,
        state_value TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (actor_type, actor_id)
    )
";

const SELECT_STATE: &str = r"
    SELECT revision, context, state_value
    FROM actor_state
    WHERE actor_type = ? AND actor_id = ?
";

const UPSERT_STATE: &str = r"
    INSERT INTO actor_state (actor_type, actor_id, revision, context, state_value, updated_at)
    VALUES (?, ?, ?, ?, ?, ?)
    ON CONFLICT (actor_type, actor_id) DO UPDATE SET
        revision = excluded.revision,
        context = excluded.context,
        state_value = excluded.state_value,
        updated_at = excluded.updated_at
";

/// Persisted form of one instance
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedState {
    pub revision: Revision,
    pub context: Value,
    pub states: BTreeMap<String, String>,
}

/// Storage bound to a single instance
#[derive(Clone)]
pub struct ScopedStorage {
    inner: Arc<dyn Storage>,
    key: ActorKey,
}

impl ScopedStorage {
    pub fn new(inner: Arc<dyn Storage>, key: ActorKey) -> Self {
        Self { inner, key }
    }

    pub fn key(&self) -> &ActorKey {
        &self.key
    }

    pub async fn execute(&self, query: &str, params: &[Value]) -> Result<Vec<Row>, StorageError> {
        self.inner.execute(query, params).await
    }

    pub async fn load_state(&self) -> Result<Option<PersistedState>, StorageError> {
        self.execute(CREATE_STATE_TABLE, &[]).await?;
        let rows = self
            .execute(
                SELECT_STATE,
                &[
                    Value::from(self.key.actor_type.as_str()),
                    Value::from(self.key.actor_id.as_str()),
                ],
            )
            .await?;

        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };

        let revision = row
            .get("revision")
            .and_then(Value::as_u64)
            .ok_or_else(|| StorageError::Decode("revision".into()))?;
        let context = decode_json_column(&row, "context")?;
        let states = serde_json::from_value(decode_json_column(&row, "state_value")?)
            .map_err(|e| StorageError::Decode(format!("state_value: {e}")))?;

        Ok(Some(PersistedState {
            revision: Revision(revision),
            context,
            states,
        }))
    }

    pub async fn save_state(&self, state: &PersistedState) -> Result<(), StorageError> {
        let context = serde_json::to_string(&state.context)
            .map_err(|e| StorageError::Query(e.to_string()))?;
        let states = serde_json::to_string(&state.states)
            .map_err(|e| StorageError::Query(e.to_string()))?;

        self.execute(
            UPSERT_STATE,
            &[
                Value::from(self.key.actor_type.as_str()),
                Value::from(self.key.actor_id.as_str()),
                Value::from(state.revision.get()),
                Value::from(context),
                Value::from(states),
                Value::from(Utc::now().to_rfc3339()),
            ],
        )
        .await?;
        Ok(())
    }
}

fn decode_json_column(row: &Row, column: &str) -> Result<Value, StorageError> {
    let text = row
        .get(column)
        .and_then(Value::as_str)
        .ok_or_else(|| StorageError::Decode(column.to_string()))?;
    serde_json::from_str(text).map_err(|e| StorageError::Decode(format!("{column}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_state_round_trip_through_capability() {
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let scoped = ScopedStorage::new(storage.clone(), ActorKey::new("user", "u1"));

        assert_eq!(scoped.load_state().await.unwrap(), None);

        let mut states = BTreeMap::new();
        states.insert("Row".to_string(), "Created".to_string());
        let first = PersistedState {
            revision: Revision(1),
            context: json!({"public": {"ownerId": "u1"}, "private": {}}),
            states,
        };
        scoped.save_state(&first).await.unwrap();

        let second = PersistedState {
            revision: Revision(2),
            ..first.clone()
        };
        scoped.save_state(&second).await.unwrap();

        assert_eq!(scoped.load_state().await.unwrap(), Some(second));

        let other = ScopedStorage::new(storage, ActorKey::new("user", "u2"));
        assert_eq!(other.load_state().await.unwrap(), None);
    }
}
