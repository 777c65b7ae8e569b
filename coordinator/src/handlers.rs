use std::borrow::Cow;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use common::{QueryV1Message, SubmitRequest, SubmitResponse, Task, ERROR_DB, MAX_GROUP_KEY_LEN};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::actor::close_code;
use crate::error::{AdmissionError, CoordinatorError};
use crate::socket::serve_socket;
use crate::state::AppState;

pub const SECRET_HEADER: &str = "x-secret";

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(queue_status))
        .route("/submit", put(submit))
        .route("/status/:id", get(task_status))
        .route("/event/:id", get(task_events))
        .route("/group/event/:group", get(group_events))
        .route("/worker_ws", get(worker_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn queue_status(State(state): State<AppState>) -> Response {
    match state.coordinator.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            error!("no se pudieron leer las estadísticas: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn valid_group(group: &Option<String>) -> bool {
    match group {
        Some(g) => !g.is_empty() && g.chars().count() <= MAX_GROUP_KEY_LEN,
        None => true,
    }
}

async fn submit(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> (StatusCode, Json<SubmitResponse>) {
    if !valid_group(&req.group) {
        return (
            StatusCode::BAD_REQUEST,
            Json(SubmitResponse::rejected("invalid-group")),
        );
    }

    let task = Task::from(req);
    let id = task.id.clone();
    match state.coordinator.submit(task).await {
        Ok(pos) => {
            info!("tarea {} en cola, posición {}", id, pos);
            (StatusCode::OK, Json(SubmitResponse::Accepted { id, pos }))
        }
        Err(CoordinatorError::Admission(e)) => {
            let status = match e {
                AdmissionError::GroupLimit => StatusCode::BAD_REQUEST,
                AdmissionError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, Json(SubmitResponse::rejected(e.code())))
        }
        Err(e) => {
            error!("falló el submit de {}: {}", id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(SubmitResponse::rejected("internal")),
            )
        }
    }
}

/// Lo que se sabe de una tarea que el coordinador ya no tiene.
async fn fallback_status(state: &AppState, id: &str) -> QueryV1Message {
    match state.records.find(id).await {
        Ok(Some(record)) => record.to_query(&state.urls.public_exposed_base),
        Ok(None) => QueryV1Message::NotFound,
        Err(e) => {
            error!("no se pudo consultar la tarea {}: {}", id, e);
            QueryV1Message::error(ERROR_DB)
        }
    }
}

async fn task_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.coordinator.query_status(id.clone()).await {
        Ok(status) if !status.is_not_found() => Json(status).into_response(),
        Ok(_) => Json(fallback_status(&state, &id).await).into_response(),
        Err(e) => {
            error!("no se pudo consultar el coordinador: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/* ---------------- WebSockets ---------------- */

async fn task_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let conn = Uuid::now_v7();
        let (tx, rx) = mpsc::unbounded_channel();
        match state
            .coordinator
            .open_task_listener(id.clone(), conn, tx)
            .await
        {
            Ok(true) => serve_socket(socket, conn, rx, state.coordinator.clone()).await,
            Ok(false) => {
                let message = fallback_status(&state, &id).await;
                send_and_close(socket, &message).await;
            }
            Err(e) => {
                error!("no se pudo abrir el listener de {}: {}", id, e);
                send_and_close(socket, &QueryV1Message::error(ERROR_DB)).await;
            }
        }
    })
}

/// Manda un único mensaje y cierra el socket normalmente.
async fn send_and_close(mut socket: WebSocket, message: &QueryV1Message) {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            error!("no se pudo serializar la respuesta: {}", e);
            return;
        }
    };
    if socket.send(Message::Text(text)).await.is_ok() {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: Cow::Borrowed(""),
            })))
            .await;
    }
}

async fn group_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let conn = Uuid::now_v7();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = state.coordinator.open_group_listener(group, conn, tx).await {
            error!("no se pudo abrir el listener de grupo: {}", e);
            return;
        }
        serve_socket(socket, conn, rx, state.coordinator.clone()).await;
    })
}

fn secret_matches(headers: &HeaderMap, expected: &str) -> bool {
    let Some(given) = headers.get(SECRET_HEADER) else {
        return false;
    };
    Sha256::digest(given.as_bytes()) == Sha256::digest(expected.as_bytes())
}

async fn worker_ws(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if !secret_matches(&headers, &state.worker_secret) {
        warn!("conexión de worker rechazada: secreto inválido");
        return StatusCode::FORBIDDEN.into_response();
    }
    let Some(ws) = ws else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    ws.on_upgrade(move |socket| async move {
        let conn = Uuid::now_v7();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = state.coordinator.worker_connected(conn, tx).await {
            error!("no se pudo registrar el worker: {}", e);
            return;
        }
        serve_socket(socket, conn, rx, state.coordinator.clone()).await;
    })
}
