//! SQLite implementation of the storage capability

use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as _, SqlitePool, TypeInfo, ValueRef};
use tracing::debug;

use super::{Row, Storage, StorageError};

/// Storage backed by a sqlx SQLite pool
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if needed) the database at `url`
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StorageError::Connect(e.to_string()))?
            .create_if_missing(true);

        // An in-memory database lives only as long as its one connection.
        let in_memory = url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 8 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connect(e.to_string()))?;

        debug!(url, "storage opened");
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, StorageError> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn execute(&self, query: &str, params: &[Value]) -> Result<Vec<Row>, StorageError> {
        let mut q = sqlx::query(query);
        for param in params {
            q = match param {
                Value::Null => q.bind(Option::<String>::None),
                Value::Bool(b) => q.bind(*b),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => q.bind(i),
                    None => q.bind(n.as_f64()),
                },
                Value::String(s) => q.bind(s.clone()),
                other => q.bind(other.to_string()),
            };
        }

        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;
        rows.iter().map(row_to_json).collect()
    }
}

fn row_to_json(row: &SqliteRow) -> Result<Row, StorageError> {
    let decode = |e: sqlx::Error| StorageError::Decode(e.to_string());
    let mut out = Row::new();

    for column in row.columns() {
        let index = column.ordinal();
        let raw = row.try_get_raw(index).map_err(decode)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let storage_class = raw.type_info().name().to_string();
            match storage_class.as_str() {
                "INTEGER" | "BOOLEAN" => Value::from(row.try_get::<i64, _>(index).map_err(decode)?),
                "REAL" => Value::from(row.try_get::<f64, _>(index).map_err(decode)?),
                "BLOB" => {
                    let bytes: Vec<u8> = row.try_get(index).map_err(decode)?;
                    Value::from(String::from_utf8_lossy(&bytes).into_owned())
                }
                _ => Value::from(row.try_get::<String, _>(index).map_err(decode)?),
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}
