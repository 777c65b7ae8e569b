//! Registro de conexiones: workers, listeners de tarea y listeners de grupo.

use std::time::Instant;

use common::{
    GroupKey, GroupQueryV1Message, QueryV1Message, TaskId, TaskResult, TaskState, WorkerMessage,
    BLANK_PNG, ERROR_DB, ERROR_WORKER,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::Coordinator;

pub type ConnId = Uuid;

pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const INTERNAL: u16 = 1011;
}

/// Lo que el actor le pide escribir a un socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: &'static str },
}

/// Frame de datos recibido de un socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

/// Tarea asignada a un worker y todavía sin terminar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub id: TaskId,
    pub status: String,
    /// Clave de la máscara en el storage público
    pub translation_mask: String,
    pub groups: Vec<GroupKey>,
}

#[derive(Debug, Clone)]
pub enum Attachment {
    Worker {
        in_flight: Vec<InFlight>,
        // ya se le mandó Close; se borra cuando llegue SocketClosed
        closing: bool,
    },
    Listener {
        task_id: TaskId,
    },
    GroupListener {
        group: GroupKey,
        renewed_at: Instant,
    },
}

#[derive(Debug)]
pub(crate) struct Connection {
    pub tx: mpsc::UnboundedSender<Outbound>,
    pub attachment: Attachment,
}

impl Connection {
    fn send(&self, msg: Outbound) {
        // si el socket ya se fue, el SocketClosed está en camino
        let _ = self.tx.send(msg);
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("no se pudo serializar el mensaje: {}", e);
            None
        }
    }
}

impl Coordinator {
    /// Workers que pueden recibir tareas, en orden de conexión.
    pub(crate) fn worker_ids(&self) -> Vec<ConnId> {
        self.connections
            .iter()
            .filter(|(_, c)| matches!(c.attachment, Attachment::Worker { closing: false, .. }))
            .map(|(id, _)| *id)
            .collect()
    }

    pub(crate) async fn on_worker_connected(
        &mut self,
        conn: ConnId,
        tx: mpsc::UnboundedSender<Outbound>,
    ) {
        info!("worker {} conectado", conn);
        self.connections.insert(
            conn,
            Connection {
                tx,
                attachment: Attachment::Worker {
                    in_flight: Vec::new(),
                    closing: false,
                },
            },
        );
        self.assign(Some(conn), true).await;
    }

    pub(crate) fn on_open_task_listener(
        &mut self,
        id: TaskId,
        conn: ConnId,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> bool {
        let status = self.find_task_status(&id);
        if status.is_not_found() {
            return false;
        }

        let connection = Connection {
            tx,
            attachment: Attachment::Listener { task_id: id },
        };
        if let Some(text) = to_json(&status) {
            connection.send(Outbound::Text(text));
        }
        self.connections.insert(conn, connection);
        true
    }

    pub(crate) fn on_open_group_listener(
        &mut self,
        group: GroupKey,
        conn: ConnId,
        tx: mpsc::UnboundedSender<Outbound>,
    ) {
        // el grupo puede no existir todavía: el listener se conecta antes del submit
        debug!("listener de grupo {} conectado", group);
        self.connections.insert(
            conn,
            Connection {
                tx,
                attachment: Attachment::GroupListener {
                    group,
                    renewed_at: Instant::now(),
                },
            },
        );
    }

    pub(crate) async fn on_socket_message(&mut self, conn: ConnId, msg: Inbound) {
        let is_worker = match self.connections.get(&conn) {
            Some(c) => matches!(c.attachment, Attachment::Worker { .. }),
            None => return,
        };
        if !is_worker {
            // los listeners no mandan nada por ahora
            self.close_connection(conn, close_code::INTERNAL, "Invalid message");
            return;
        }

        let bytes = match msg {
            Inbound::Binary(bytes) => bytes,
            Inbound::Text(_) => {
                self.close_connection(conn, close_code::INTERNAL, "Invalid message");
                return;
            }
        };

        match WorkerMessage::decode(&bytes) {
            Ok(WorkerMessage::Status { id, status }) => self.on_worker_status(conn, id, status),
            Ok(WorkerMessage::FinishTask {
                id,
                success,
                has_translation_mask,
            }) => {
                self.on_worker_finish(conn, id, success, has_translation_mask)
                    .await
            }
            Ok(WorkerMessage::NewTask(_)) | Err(_) => {
                warn!("worker {} mandó un mensaje desconocido", conn);
                self.close_connection(conn, close_code::INTERNAL, "Unknown message type");
            }
        }
    }

    fn on_worker_status(&mut self, conn: ConnId, id: TaskId, status: String) {
        let mut groups = None;
        if let Some(Connection {
            attachment: Attachment::Worker { in_flight, .. },
            ..
        }) = self.connections.get_mut(&conn)
        {
            if let Some(task) = in_flight.iter_mut().find(|t| t.id == id) {
                task.status = status.clone();
                groups = Some(task.groups.clone());
            }
        }

        match groups {
            Some(groups) => {
                self.broadcast(&id, &groups, QueryV1Message::Status { status });
            }
            None => self.close_connection(conn, close_code::INTERNAL, "Unknown task"),
        }
    }

    async fn on_worker_finish(
        &mut self,
        conn: ConnId,
        id: TaskId,
        success: bool,
        has_translation_mask: bool,
    ) {
        let task = match self.connections.get_mut(&conn) {
            Some(Connection {
                attachment: Attachment::Worker { in_flight, .. },
                ..
            }) => in_flight
                .iter()
                .position(|t| t.id == id)
                .map(|idx| in_flight.remove(idx)),
            _ => None,
        };
        let Some(task) = task else {
            self.close_connection(conn, close_code::INTERNAL, "Unknown task");
            return;
        };

        let state = if success {
            TaskState::Done
        } else {
            TaskState::Error
        };
        let mask = has_translation_mask.then_some(task.translation_mask.as_str());

        match self.records.commit_result(&id, state, mask).await {
            Ok(true) if success => {
                let translation_mask = match mask {
                    Some(key) => format!("{}/{}", self.urls.public_exposed_base, key),
                    None => BLANK_PNG.to_string(),
                };
                info!("tarea {} terminada", id);
                self.broadcast(
                    &id,
                    &task.groups,
                    QueryV1Message::Result {
                        result: TaskResult { translation_mask },
                    },
                );
                self.close_task_listeners(&id, close_code::NORMAL, "Done");
            }
            Ok(true) => {
                info!("tarea {} terminó con error", id);
                self.broadcast(
                    &id,
                    &task.groups,
                    QueryV1Message::Error {
                        error_id: None,
                        error: None,
                    },
                );
                self.close_task_listeners(&id, close_code::INTERNAL, "Done");
            }
            outcome => {
                match outcome {
                    Err(e) => error!("no se pudo guardar el resultado de {}: {}", id, e),
                    _ => error!("la tarea {} no existe en la base", id),
                }
                self.broadcast(&id, &task.groups, QueryV1Message::error(ERROR_DB));
                self.close_task_listeners(&id, close_code::INTERNAL, "Database error");
            }
        }

        self.release_groups(&task.groups);
        self.assign(None, true).await;
    }

    pub(crate) fn on_socket_closed(&mut self, conn: ConnId) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };
        let Attachment::Worker { in_flight, .. } = connection.attachment else {
            return;
        };

        if in_flight.is_empty() {
            info!("worker {} desconectado", conn);
            return;
        }
        warn!(
            "worker {} desconectado con {} tareas en curso",
            conn,
            in_flight.len()
        );

        let ids: Vec<TaskId> = in_flight.iter().map(|t| t.id.clone()).collect();
        let records = self.records.clone();
        Self::log_spawn_error("marcar tareas con error", async move {
            records.mark_errored(&ids).await
        });

        for task in in_flight {
            self.broadcast(&task.id, &task.groups, QueryV1Message::error(ERROR_WORKER));
            self.close_task_listeners(&task.id, close_code::INTERNAL, "Worker error");
            self.release_groups(&task.groups);
        }
    }

    /// Decrementa los grupos de una tarea que salió del sistema y renueva
    /// a sus listeners de grupo.
    fn release_groups(&mut self, groups: &[GroupKey]) {
        for group in groups {
            self.dec_active_group(group);
        }
        self.renew_group_listeners(groups, Instant::now());
    }

    /// Manda el evento a los listeners de la tarea y a los de sus grupos.
    pub(crate) fn broadcast(&self, id: &str, groups: &[GroupKey], message: QueryV1Message) {
        let Some(text) = to_json(&message) else {
            return;
        };
        let group_text = to_json(&GroupQueryV1Message {
            id: id.to_string(),
            message,
        });

        for conn in self.connections.values() {
            match &conn.attachment {
                Attachment::Listener { task_id } if task_id == id => {
                    conn.send(Outbound::Text(text.clone()));
                }
                Attachment::GroupListener { group, .. } if groups.contains(group) => {
                    if let Some(group_text) = &group_text {
                        conn.send(Outbound::Text(group_text.clone()));
                    }
                }
                _ => {}
            }
        }
    }

    fn close_task_listeners(&mut self, id: &str, code: u16, reason: &'static str) {
        let listeners: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|(_, c)| matches!(&c.attachment, Attachment::Listener { task_id } if task_id == id))
            .map(|(conn, _)| *conn)
            .collect();
        for conn in listeners {
            self.close_connection(conn, code, reason);
        }
    }

    pub(crate) fn renew_group_listeners(&mut self, groups: &[GroupKey], now: Instant) {
        for conn in self.connections.values_mut() {
            if let Attachment::GroupListener { group, renewed_at } = &mut conn.attachment {
                if groups.contains(group) {
                    *renewed_at = now;
                }
            }
        }
    }

    /// Le pide al socket que cierre. Los listeners salen del registro en el
    /// acto; un worker queda marcado hasta que su socket avise que cerró.
    pub(crate) fn close_connection(&mut self, conn: ConnId, code: u16, reason: &'static str) {
        let remove = match self.connections.get_mut(&conn) {
            Some(c) => {
                c.send(Outbound::Close { code, reason });
                match &mut c.attachment {
                    Attachment::Worker { closing, .. } => {
                        *closing = true;
                        false
                    }
                    _ => true,
                }
            }
            None => false,
        };
        if remove {
            self.connections.remove(&conn);
        }
    }

    /// Cierra los listeners de grupos sin tareas activas que no se
    /// renovaron en el último minuto. Devuelve cuántos cerró.
    pub(crate) fn cleanup_sockets(&mut self, now: Instant) -> usize {
        let timeout = self.config.group_listener_timeout;
        let groups = self.active_groups.as_ref();
        let stale: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|(_, c)| match &c.attachment {
                Attachment::GroupListener { group, renewed_at } => {
                    let active = groups.is_some_and(|g| g.contains_key(group));
                    !active && now.saturating_duration_since(*renewed_at) > timeout
                }
                _ => false,
            })
            .map(|(conn, _)| *conn)
            .collect();

        for conn in &stale {
            self.close_connection(*conn, close_code::INTERNAL, "Timeout");
        }
        stale.len()
    }
}
