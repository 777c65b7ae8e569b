//! Keyspace durable privado del coordinador: snapshot de la cola y backlog.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sqlx::{types::Json, PgPool};
use thiserror::Error;

pub const QUEUE_KEY: &str = "queue";
pub const BACKLOG_PREFIX: &str = "gcs:";
pub const BACKLOG_INDEX_PREFIX: &str = "gct:";

pub fn backlog_key(sortable_id: &str) -> String {
    format!("{}{}", BACKLOG_PREFIX, sortable_id)
}

pub fn backlog_index_key(task_id: &str) -> String {
    format!("{}{}", BACKLOG_INDEX_PREFIX, task_id)
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("error de base de datos: {0}")]
    Database(#[from] sqlx::Error),
    #[error("valor corrupto en {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("storage no disponible")]
    Unavailable,
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError>;
    async fn delete(&self, keys: &[String]) -> Result<(), StorageError>;
    /// Hasta `limit` entradas con el prefijo dado, en orden ascendente de clave.
    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<(String, Value)>, StorageError>;
}

pub async fn get_json<T: DeserializeOwned>(
    storage: &dyn Storage,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match storage.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|source| StorageError::Corrupt {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

pub async fn put_json<T: Serialize>(
    storage: &dyn Storage,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let value = serde_json::to_value(value).map_err(|source| StorageError::Corrupt {
        key: key.to_string(),
        source,
    })?;
    storage.put(key, value).await
}

/// Implementación en memoria, para desarrollo y tests.
#[derive(Debug)]
pub struct MemoryStorage {
    data: Mutex<BTreeMap<String, Value>>,
    available: AtomicBool,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Con `false` todas las operaciones fallan, como un storage caído.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn data(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Value>>, StorageError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable);
        }
        self.data.lock().map_err(|_| StorageError::Unavailable)
    }

    pub fn keys(&self) -> Vec<String> {
        self.data()
            .map(|data| data.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.data()?.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.data()?.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StorageError> {
        let mut data = self.data()?;
        for key in keys {
            data.remove(key);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<(String, Value)>, StorageError> {
        Ok(self
            .data()?
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Keyspace sobre una tabla de Postgres.
#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
}

// Los ids del backlog son base62 con mayúsculas y minúsculas: el orden
// tiene que ser por bytes ("C"), no el de la collation de la base.
const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS coordinator_kv \
     (key TEXT COLLATE \"C\" PRIMARY KEY, value JSONB NOT NULL)";
const LIST_SQL: &str = "SELECT key, value FROM coordinator_kv WHERE starts_with(key, $1) \
     ORDER BY key COLLATE \"C\" LIMIT $2";

impl PgStorage {
    pub async fn connect(pool: PgPool) -> Result<Self, StorageError> {
        sqlx::query(CREATE_TABLE_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let row: Option<(Json<Value>,)> =
            sqlx::query_as("SELECT value FROM coordinator_kv WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(Json(value),)| value))
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO coordinator_kv (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(Json(value))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StorageError> {
        if keys.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM coordinator_kv WHERE key = ANY($1)")
            .bind(keys)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<(String, Value)>, StorageError> {
        let rows: Vec<(String, Json<Value>)> = sqlx::query_as(LIST_SQL)
            .bind(prefix)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(k, Json(v))| (k, v)).collect())
    }
}
