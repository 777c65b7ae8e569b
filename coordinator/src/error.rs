use common::ProtocolError;
use thiserror::Error;

use crate::storage::StorageError;
use crate::token::TokenError;

/// Rechazos de admisión: se devuelven al cliente sin tocar el estado.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("group-limit")]
    GroupLimit,
    #[error("queue-full")]
    QueueFull,
}

impl AdmissionError {
    pub fn code(self) -> &'static str {
        match self {
            AdmissionError::GroupLimit => "group-limit",
            AdmissionError::QueueFull => "queue-full",
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error("token: {0}")]
    Token(#[from] TokenError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("el coordinador no está corriendo")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
