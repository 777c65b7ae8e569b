//! Arnés para manejar el coordinador a mano en los tests unitarios.

use std::sync::Arc;
use std::time::Duration;

use common::{Task, WorkerMessage};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::{Command, ConnId, Coordinator, Inbound, Outbound};
use crate::config::{CoordinatorConfig, StorageUrls};
use crate::error::Result;
use crate::records::MemoryTaskRecords;
use crate::storage::MemoryStorage;
use crate::token::test_keys::PRIVATE_KEY;
use crate::token::TokenIssuer;

pub type Rx = mpsc::UnboundedReceiver<Outbound>;

pub fn test_urls() -> StorageUrls {
    StorageUrls {
        private_base: "http://r2.test/private".to_string(),
        public_base: "http://r2.test/public".to_string(),
        public_exposed_base: "https://cdn.test".to_string(),
    }
}

pub fn task(id: &str, groups: &[&str]) -> Task {
    Task {
        id: id.to_string(),
        group: groups.iter().map(|g| g.to_string()).collect(),
        file: format!("upload/{}.png", id),
        target_language: "ENG".to_string(),
        detector: "default".to_string(),
        direction: "auto".to_string(),
        translator: "gpt3.5".to_string(),
        size: "M".to_string(),
    }
}

pub fn next_json(rx: &mut Rx) -> serde_json::Value {
    match rx.try_recv() {
        Ok(Outbound::Text(text)) => serde_json::from_str(&text).unwrap(),
        other => panic!("se esperaba texto, llegó {:?}", other),
    }
}

pub fn new_task_id(rx: &mut Rx) -> String {
    match rx.try_recv() {
        Ok(Outbound::Binary(bytes)) => match WorkerMessage::decode(&bytes).unwrap() {
            WorkerMessage::NewTask(t) => t.id,
            other => panic!("se esperaba new-task, llegó {:?}", other),
        },
        other => panic!("se esperaba binario, llegó {:?}", other),
    }
}

pub struct Harness {
    pub coord: Coordinator,
    pub storage: Arc<MemoryStorage>,
    pub records: Arc<MemoryTaskRecords>,
    last_conn: u128,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(CoordinatorConfig::default(), PRIVATE_KEY).await
    }

    pub async fn with_config(config: CoordinatorConfig) -> Self {
        Self::build(config, PRIVATE_KEY).await
    }

    pub async fn with_private_key(pem: &str) -> Self {
        Self::build(CoordinatorConfig::default(), pem).await
    }

    async fn build(config: CoordinatorConfig, pem: &str) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let records = Arc::new(MemoryTaskRecords::new());
        let tokens = TokenIssuer::new(pem, Duration::from_secs(300));
        let coord = Coordinator::load(
            config,
            test_urls(),
            storage.clone(),
            records.clone(),
            tokens,
        )
        .await
        .unwrap();
        Self {
            coord,
            storage,
            records,
            last_conn: 0,
        }
    }

    /// Ids crecientes, así el orden de conexión es el orden de creación.
    fn conn_id(&mut self) -> ConnId {
        self.last_conn += 1;
        Uuid::from_u128(self.last_conn)
    }

    pub async fn submit(&mut self, task: Task) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.coord.handle(Command::Submit { task, reply }).await;
        rx.await.unwrap()
    }

    pub async fn worker(&mut self) -> (ConnId, Rx) {
        let conn = self.conn_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.coord
            .handle(Command::WorkerConnected { conn, tx })
            .await;
        (conn, rx)
    }

    pub async fn task_listener(&mut self, id: &str) -> (ConnId, Rx) {
        let conn = self.conn_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let (reply, opened) = oneshot::channel();
        self.coord
            .handle(Command::OpenTaskListener {
                id: id.to_string(),
                conn,
                tx,
                reply,
            })
            .await;
        assert!(opened.await.unwrap(), "la tarea {} no existe", id);
        (conn, rx)
    }

    pub async fn group_listener(&mut self, group: &str) -> (ConnId, Rx) {
        let conn = self.conn_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.coord
            .handle(Command::OpenGroupListener {
                group: group.to_string(),
                conn,
                tx,
            })
            .await;
        (conn, rx)
    }

    pub async fn message(&mut self, conn: ConnId, msg: Inbound) {
        self.coord.handle(Command::SocketMessage { conn, msg }).await;
    }

    pub async fn worker_says(&mut self, conn: ConnId, msg: WorkerMessage) {
        self.message(conn, Inbound::Binary(msg.encode().unwrap()))
            .await;
    }

    pub async fn finish(&mut self, conn: ConnId, id: &str, success: bool, has_mask: bool) {
        self.worker_says(
            conn,
            WorkerMessage::FinishTask {
                id: id.to_string(),
                success,
                has_translation_mask: has_mask,
            },
        )
        .await;
    }

    pub async fn closed(&mut self, conn: ConnId) {
        self.coord.handle(Command::SocketClosed { conn }).await;
    }
}
