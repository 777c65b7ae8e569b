//! Frontera con la base relacional que guarda el historial de tareas.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{QueryV1Message, TaskId, TaskResult, TaskState, BLANK_PNG};
use sqlx::PgPool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordsError {
    #[error("error de base de datos: {0}")]
    Database(#[from] sqlx::Error),
    #[error("estado desconocido {0} en la tabla task")]
    UnknownState(i16),
    #[error("base de datos no disponible")]
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub state: TaskState,
    pub translation_mask: Option<String>,
    pub last_attempted_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Lo que se le responde a un cliente cuando el coordinador ya no conoce la tarea.
    pub fn to_query(&self, exposed_base: &str) -> QueryV1Message {
        match self.state {
            TaskState::Done => QueryV1Message::Result {
                result: TaskResult {
                    translation_mask: match &self.translation_mask {
                        Some(mask) => format!("{}/{}", exposed_base, mask),
                        None => BLANK_PNG.to_string(),
                    },
                },
            },
            TaskState::Error => QueryV1Message::Error {
                error_id: None,
                error: None,
            },
            TaskState::Pending | TaskState::Running => QueryV1Message::Status {
                status: "pending".to_string(),
            },
        }
    }
}

#[async_trait]
pub trait TaskRecords: Send + Sync {
    /// Guarda el estado final. Devuelve `false` si la fila no existe.
    async fn commit_result(
        &self,
        id: &str,
        state: TaskState,
        translation_mask: Option<&str>,
    ) -> Result<bool, RecordsError>;

    async fn mark_errored(&self, ids: &[TaskId]) -> Result<(), RecordsError>;

    async fn touch_last_attempted(&self, id: &str, at: DateTime<Utc>) -> Result<(), RecordsError>;

    async fn find(&self, id: &str) -> Result<Option<TaskRecord>, RecordsError>;
}

#[derive(Debug, Clone)]
pub struct PgTaskRecords {
    pool: PgPool,
}

impl PgTaskRecords {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskRecords for PgTaskRecords {
    async fn commit_result(
        &self,
        id: &str,
        state: TaskState,
        translation_mask: Option<&str>,
    ) -> Result<bool, RecordsError> {
        let row: Option<(String,)> = sqlx::query_as(
            "UPDATE task SET state = $1, translation_mask = $2 WHERE id = $3 RETURNING id",
        )
        .bind(state.code())
        .bind(translation_mask)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn mark_errored(&self, ids: &[TaskId]) -> Result<(), RecordsError> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE task SET state = $1 WHERE id = ANY($2)")
            .bind(TaskState::Error.code())
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_last_attempted(&self, id: &str, at: DateTime<Utc>) -> Result<(), RecordsError> {
        sqlx::query("UPDATE task SET last_attempted_at = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<TaskRecord>, RecordsError> {
        let row: Option<(i16, Option<String>, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT state, translation_mask, last_attempted_at FROM task WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(state, translation_mask, last_attempted_at)| {
            Ok(TaskRecord {
                state: TaskState::from_code(state).ok_or(RecordsError::UnknownState(state))?,
                translation_mask,
                last_attempted_at,
            })
        })
        .transpose()
    }
}

/// Tabla `task` en memoria. `set_available(false)` simula una base caída.
#[derive(Debug)]
pub struct MemoryTaskRecords {
    rows: Mutex<HashMap<TaskId, TaskRecord>>,
    available: AtomicBool,
}

impl Default for MemoryTaskRecords {
    fn default() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryTaskRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Crea la fila como lo haría la capa HTTP al aceptar un upload.
    pub fn insert_pending(&self, id: &str) {
        if let Ok(mut rows) = self.rows.lock() {
            rows.insert(
                id.to_string(),
                TaskRecord {
                    state: TaskState::Pending,
                    translation_mask: None,
                    last_attempted_at: None,
                },
            );
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn get(&self, id: &str) -> Option<TaskRecord> {
        self.rows.lock().ok().and_then(|rows| rows.get(id).cloned())
    }

    fn rows(&self) -> Result<std::sync::MutexGuard<'_, HashMap<TaskId, TaskRecord>>, RecordsError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(RecordsError::Unavailable);
        }
        self.rows.lock().map_err(|_| RecordsError::Unavailable)
    }
}

#[async_trait]
impl TaskRecords for MemoryTaskRecords {
    async fn commit_result(
        &self,
        id: &str,
        state: TaskState,
        translation_mask: Option<&str>,
    ) -> Result<bool, RecordsError> {
        let mut rows = self.rows()?;
        match rows.get_mut(id) {
            Some(row) => {
                row.state = state;
                row.translation_mask = translation_mask.map(str::to_string);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_errored(&self, ids: &[TaskId]) -> Result<(), RecordsError> {
        let mut rows = self.rows()?;
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                row.state = TaskState::Error;
            }
        }
        Ok(())
    }

    async fn touch_last_attempted(&self, id: &str, at: DateTime<Utc>) -> Result<(), RecordsError> {
        if let Some(row) = self.rows()?.get_mut(id) {
            row.last_attempted_at = Some(at);
        }
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<TaskRecord>, RecordsError> {
        Ok(self.rows()?.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(state: TaskState, mask: Option<&str>) -> TaskRecord {
        TaskRecord {
            state,
            translation_mask: mask.map(str::to_string),
            last_attempted_at: None,
        }
    }

    #[test]
    fn fallback_messages() {
        let base = "https://r2.example";
        assert_eq!(
            record(TaskState::Done, Some("mask/t1.png")).to_query(base),
            QueryV1Message::Result {
                result: TaskResult {
                    translation_mask: "https://r2.example/mask/t1.png".into()
                }
            }
        );
        assert_eq!(
            record(TaskState::Done, None).to_query(base),
            QueryV1Message::Result {
                result: TaskResult {
                    translation_mask: BLANK_PNG.into()
                }
            }
        );
        assert!(matches!(
            record(TaskState::Error, None).to_query(base),
            QueryV1Message::Error { error: None, .. }
        ));
        assert_eq!(
            record(TaskState::Running, None).to_query(base),
            QueryV1Message::Status {
                status: "pending".into()
            }
        );
    }

    #[tokio::test]
    async fn commit_reports_missing_rows() {
        let records = MemoryTaskRecords::new();
        records.insert_pending("t1");

        assert!(records
            .commit_result("t1", TaskState::Done, Some("mask/t1.png"))
            .await
            .unwrap());
        assert!(!records
            .commit_result("nope", TaskState::Done, None)
            .await
            .unwrap());

        let row = records.get("t1").unwrap();
        assert_eq!(row.state, TaskState::Done);
        assert_eq!(row.translation_mask.as_deref(), Some("mask/t1.png"));
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let records = MemoryTaskRecords::new();
        records.insert_pending("t1");
        records.set_available(false);
        assert!(records.find("t1").await.is_err());
        assert!(records
            .commit_result("t1", TaskState::Done, None)
            .await
            .is_err());
        records.set_available(true);
        assert!(records.find("t1").await.unwrap().is_some());
    }
}
