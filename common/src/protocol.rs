use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::TaskId;

/// Mensajes entre coordinador y workers. Viajan como JSON dentro de
/// frames binarios del websocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "case", rename_all = "kebab-case")]
pub enum WorkerMessage {
    /// coordinador -> worker
    NewTask(NewTask),
    /// worker -> coordinador
    Status { id: TaskId, status: String },
    /// worker -> coordinador
    FinishTask {
        id: TaskId,
        success: bool,
        has_translation_mask: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub id: TaskId,
    pub source_image_url: String,
    pub target_language: String,
    pub detector: String,
    pub direction: String,
    pub translator: String,
    pub size: String,
    pub translation_mask_upload_url: String,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("mensaje de worker inválido: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
