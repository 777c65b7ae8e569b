//! El coordinador: un único task de tokio dueño de todo el estado mutable
//! (cola, backlog, grupos activos y conexiones). El resto del proceso le
//! habla por un mailbox; los comandos se procesan de a uno, así que no hay
//! locks internos.

mod assign;
mod gc;
mod groups;
mod hub;
mod queue;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use common::{GroupKey, QueryV1Message, Task, TaskId};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{CoordinatorConfig, StorageUrls};
use crate::error::{CoordinatorError, Result};
use crate::ids::SortableIdGenerator;
use crate::records::TaskRecords;
use crate::storage::{get_json, Storage, QUEUE_KEY};
use crate::token::TokenIssuer;
use crate::ttl::TtlSet;

pub use hub::{close_code, Attachment, ConnId, InFlight, Inbound, Outbound};
pub use queue::BacklogIndex;

use hub::Connection;

const MAILBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue: usize,
    pub workers: usize,
}

/// Mensajes del mailbox del coordinador.
#[derive(Debug)]
pub enum Command {
    Submit {
        task: Task,
        reply: oneshot::Sender<Result<usize>>,
    },
    QueryStatus {
        id: TaskId,
        reply: oneshot::Sender<QueryV1Message>,
    },
    Stats {
        reply: oneshot::Sender<QueueStats>,
    },
    WorkerConnected {
        conn: ConnId,
        tx: mpsc::UnboundedSender<Outbound>,
    },
    /// Responde `false` si la tarea no está ni en cola ni en vuelo
    OpenTaskListener {
        id: TaskId,
        conn: ConnId,
        tx: mpsc::UnboundedSender<Outbound>,
        reply: oneshot::Sender<bool>,
    },
    OpenGroupListener {
        group: GroupKey,
        conn: ConnId,
        tx: mpsc::UnboundedSender<Outbound>,
    },
    SocketMessage {
        conn: ConnId,
        msg: Inbound,
    },
    SocketClosed {
        conn: ConnId,
    },
    Tick,
}

/// Punto de entrada al coordinador para handlers y sockets.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    async fn send(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| CoordinatorError::Stopped)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| CoordinatorError::Stopped)
    }

    /// Encola la tarea y devuelve su posición (desde 1).
    pub async fn submit(&self, task: Task) -> Result<usize> {
        self.request(|reply| Command::Submit { task, reply }).await?
    }

    pub async fn query_status(&self, id: TaskId) -> Result<QueryV1Message> {
        self.request(|reply| Command::QueryStatus { id, reply }).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    pub async fn worker_connected(
        &self,
        conn: ConnId,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Result<()> {
        self.send(Command::WorkerConnected { conn, tx }).await
    }

    pub async fn open_task_listener(
        &self,
        id: TaskId,
        conn: ConnId,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Result<bool> {
        self.request(|reply| Command::OpenTaskListener {
            id,
            conn,
            tx,
            reply,
        })
        .await
    }

    pub async fn open_group_listener(
        &self,
        group: GroupKey,
        conn: ConnId,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Result<()> {
        self.send(Command::OpenGroupListener { group, conn, tx }).await
    }

    pub async fn socket_message(&self, conn: ConnId, msg: Inbound) -> Result<()> {
        self.send(Command::SocketMessage { conn, msg }).await
    }

    pub async fn socket_closed(&self, conn: ConnId) -> Result<()> {
        self.send(Command::SocketClosed { conn }).await
    }

    pub async fn tick(&self) -> Result<()> {
        self.send(Command::Tick).await
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    urls: StorageUrls,
    storage: Arc<dyn Storage>,
    records: Arc<dyn TaskRecords>,
    tokens: TokenIssuer,
    ids: SortableIdGenerator,

    queue: VecDeque<Task>,
    queue_dirty: bool,
    keep_alive: TtlSet<TaskId>,
    // None = hay que reconstruirlo desde la cola y los workers
    active_groups: Option<HashMap<GroupKey, usize>>,
    connections: BTreeMap<ConnId, Connection>,
    last_cleanup: Option<Instant>,
}

impl Coordinator {
    /// Levanta el coordinador retomando el snapshot de la cola.
    pub async fn load(
        config: CoordinatorConfig,
        urls: StorageUrls,
        storage: Arc<dyn Storage>,
        records: Arc<dyn TaskRecords>,
        tokens: TokenIssuer,
    ) -> Result<Self> {
        let queue: VecDeque<Task> = get_json(storage.as_ref(), QUEUE_KEY)
            .await?
            .unwrap_or_default();
        if !queue.is_empty() {
            info!("retomando {} tareas de la cola guardada", queue.len());
        }

        Ok(Self {
            keep_alive: TtlSet::new(config.keep_alive),
            config,
            urls,
            storage,
            records,
            tokens,
            ids: SortableIdGenerator::new(),
            queue,
            queue_dirty: false,
            active_groups: None,
            connections: BTreeMap::new(),
            last_cleanup: None,
        })
    }

    /// Lanza el loop del actor y devuelve el handle para hablarle.
    pub fn spawn(self) -> CoordinatorHandle {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        tokio::spawn(self.run(rx));
        CoordinatorHandle { tx }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd).await;
        }
        debug!("mailbox cerrado, el coordinador termina");
    }

    pub(crate) async fn handle(&mut self, cmd: Command) {
        self.ensure_active_groups();
        self.maybe_cleanup();

        match cmd {
            Command::Submit { task, reply } => {
                let result = self.submit(task).await;
                let _ = reply.send(result);
            }
            Command::QueryStatus { id, reply } => {
                self.keep_alive.insert(id.clone());
                let _ = reply.send(self.find_task_status(&id));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::WorkerConnected { conn, tx } => {
                self.on_worker_connected(conn, tx).await;
            }
            Command::OpenTaskListener {
                id,
                conn,
                tx,
                reply,
            } => {
                let _ = reply.send(self.on_open_task_listener(id, conn, tx));
            }
            Command::OpenGroupListener { group, conn, tx } => {
                self.on_open_group_listener(group, conn, tx);
            }
            Command::SocketMessage { conn, msg } => {
                self.on_socket_message(conn, msg).await;
            }
            Command::SocketClosed { conn } => {
                self.on_socket_closed(conn);
            }
            Command::Tick => {}
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queue: self.queue.len(),
            workers: self.worker_ids().len(),
        }
    }

    /// Estado de una tarea: en vuelo, en cola o desconocida.
    pub fn find_task_status(&self, id: &str) -> QueryV1Message {
        // suele haber menos workers que tareas, así que primero los workers
        for conn in self.connections.values() {
            if let Attachment::Worker { in_flight, .. } = &conn.attachment {
                if let Some(task) = in_flight.iter().find(|t| t.id == id) {
                    return QueryV1Message::Status {
                        status: task.status.clone(),
                    };
                }
            }
        }

        match self.queue.iter().position(|t| t.id == id) {
            Some(pos) => QueryV1Message::Pending { pos: pos + 1 },
            None => QueryV1Message::NotFound,
        }
    }

    /// Pasada de limpieza como mucho una vez por intervalo de actividad.
    fn maybe_cleanup(&mut self) {
        let now = Instant::now();
        let due = match self.last_cleanup {
            None => true,
            Some(last) => now.duration_since(last) > self.config.cleanup_interval,
        };
        if due {
            self.last_cleanup = Some(now);
            let closed = self.cleanup_sockets(now);
            if closed > 0 {
                info!("limpieza: {} listeners de grupo cerrados por inactividad", closed);
            }
        }
    }

    fn log_spawn_error<F, E>(what: &'static str, fut: F)
    where
        F: std::future::Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display,
    {
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                warn!("{} falló: {}", what, e);
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod testing;
