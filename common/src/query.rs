use serde::{Deserialize, Serialize};

use crate::task::TaskId;

/// PNG transparente de 1x1; se usa cuando el worker no produjo máscara.
pub const BLANK_PNG: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVQI12NgYAAAAAMAASDVlMcAAAAASUVORK5CYII=";

pub const ERROR_WORKER: &str = "error-worker";
pub const ERROR_DB: &str = "error-db";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub translation_mask: String,
}

/// Mensaje que ven los listeners y el endpoint de estado.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryV1Message {
    /// Sigue en cola; `pos` empieza en 1
    Pending { pos: usize },
    Status { status: String },
    Result { result: TaskResult },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    NotFound,
}

impl QueryV1Message {
    pub fn error(code: &str) -> Self {
        QueryV1Message::Error {
            error_id: None,
            error: Some(code.to_string()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, QueryV1Message::NotFound)
    }
}

/// Igual que `QueryV1Message` pero con el id de la tarea, para listeners de grupo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupQueryV1Message {
    pub id: TaskId,
    #[serde(flatten)]
    pub message: QueryV1Message,
}
