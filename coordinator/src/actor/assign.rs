//! Asignación de tareas de la cola a los workers conectados.

use std::collections::HashSet;

use chrono::Utc;
use common::{translation_mask_key, NewTask, Task, TaskId, WorkerMessage};
use tracing::{debug, error, warn};

use super::hub::Connection;
use super::{Attachment, ConnId, Coordinator, InFlight, Outbound};
use crate::error::Result;
use crate::token::{Audience, Grant, Verb};

impl Coordinator {
    /// Tareas en curso del worker, si puede recibir más.
    fn worker_load(&self, conn: &ConnId) -> Option<usize> {
        match self.connections.get(conn).map(|c| &c.attachment) {
            Some(Attachment::Worker {
                in_flight,
                closing: false,
            }) => Some(in_flight.len()),
            _ => None,
        }
    }

    /// Reparte la cola entre los workers (todos, o solo `only`), siempre
    /// al menos cargado y con un tope de `worker_slots` por worker.
    pub(crate) async fn assign(&mut self, only: Option<ConnId>, pickup: bool) {
        let candidates: Vec<ConnId> = match only {
            Some(conn) => self
                .worker_load(&conn)
                .map(|_| vec![conn])
                .unwrap_or_default(),
            None => self.worker_ids(),
        };
        if candidates.is_empty() {
            return;
        }

        if pickup {
            if let Err(e) = self.pickup().await {
                warn!("no se pudo recoger del backlog: {}", e);
            }
        }

        let mut processing: HashSet<TaskId> = self
            .connections
            .values()
            .filter_map(|c| match &c.attachment {
                Attachment::Worker { in_flight, .. } => Some(in_flight),
                _ => None,
            })
            .flatten()
            .map(|t| t.id.clone())
            .collect();

        let slots = self.config.worker_slots;
        let mut skipped: Vec<Task> = Vec::new();
        let mut changed = false;

        while !self.queue.is_empty() {
            // empate: el primero en orden de conexión
            let target = candidates
                .iter()
                .enumerate()
                .filter_map(|(i, conn)| {
                    let load = self.worker_load(conn)?;
                    (load < slots).then_some((load, i, *conn))
                })
                .min_by_key(|(load, i, _)| (*load, *i))
                .map(|(_, _, conn)| conn);
            let Some(conn) = target else {
                break;
            };
            let Some(task) = self.queue.pop_front() else {
                break;
            };
            changed = true;

            // el mismo id ya lo está procesando algún worker
            if processing.contains(&task.id) {
                skipped.push(task);
                continue;
            }

            match self.dispatch(conn, &task) {
                Ok(true) => {
                    debug!("tarea {} asignada al worker {}", task.id, conn);
                    let records = self.records.clone();
                    let id = task.id.clone();
                    Self::log_spawn_error("actualizar last_attempted_at", async move {
                        records.touch_last_attempted(&id, Utc::now()).await
                    });
                    processing.insert(task.id);
                }
                Ok(false) => {
                    skipped.push(task);
                    break;
                }
                Err(e) => {
                    error!("no se pudo despachar la tarea {}: {}", task.id, e);
                    skipped.push(task);
                    break;
                }
            }
        }

        if !changed {
            return;
        }
        // los saltados estaban antes que el resto de la cola
        for task in skipped.into_iter().rev() {
            self.queue.push_front(task);
        }
        self.queue_dirty = true;
        if let Err(e) = self.flush_queue().await {
            error!("no se pudo guardar la cola: {}", e);
        }
    }

    /// Firma los dos tokens, manda `new-task` y registra la tarea en vuelo.
    /// `false` si el worker ya no está.
    fn dispatch(&mut self, conn: ConnId, task: &Task) -> Result<bool> {
        let mask = translation_mask_key(&task.id);

        let source_token = self
            .tokens
            .issue(Grant::file(task.file.clone(), Verb::Get), Audience::Private)?;
        let mask_token = self
            .tokens
            .issue(Grant::file(mask.clone(), Verb::Put), Audience::Public)?;

        let msg = WorkerMessage::NewTask(NewTask {
            id: task.id.clone(),
            source_image_url: format!(
                "{}/{}?t={}",
                self.urls.private_base, task.file, source_token
            ),
            target_language: task.target_language.clone(),
            detector: task.detector.clone(),
            direction: task.direction.clone(),
            translator: task.translator.clone(),
            size: task.size.clone(),
            translation_mask_upload_url: format!(
                "{}/{}?t={}",
                self.urls.public_base, mask, mask_token
            ),
        });
        let bytes = msg.encode()?;

        match self.connections.get_mut(&conn) {
            Some(Connection {
                tx,
                attachment: Attachment::Worker { in_flight, .. },
            }) => {
                in_flight.push(InFlight {
                    id: task.id.clone(),
                    status: "pending".to_string(),
                    translation_mask: mask,
                    groups: task.group.clone(),
                });
                let _ = tx.send(Outbound::Binary(bytes));
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::QueryV1Message;

    use super::*;
    use crate::actor::testing::*;
    use crate::token::test_keys::PUBLIC_KEY;
    use crate::token::CapabilityVerifier;

    fn in_flight_ids(h: &Harness, conn: ConnId) -> Vec<String> {
        match &h.coord.connections[&conn].attachment {
            Attachment::Worker { in_flight, .. } => in_flight.iter().map(|t| t.id.clone()).collect(),
            _ => Vec::new(),
        }
    }

    #[tokio::test]
    async fn new_task_carries_scoped_urls() {
        let mut h = Harness::new().await;
        h.records.insert_pending("t1");
        let (_w, mut rx) = h.worker().await;
        h.submit(task("t1", &[])).await.unwrap();

        let Some(Outbound::Binary(bytes)) = rx.try_recv().ok() else {
            panic!("el worker no recibió la tarea");
        };
        let WorkerMessage::NewTask(new_task) = WorkerMessage::decode(&bytes).unwrap() else {
            panic!("mensaje inesperado");
        };
        assert_eq!(new_task.id, "t1");

        let (base, token) = new_task.source_image_url.split_once("?t=").unwrap();
        assert_eq!(base, "http://r2.test/private/upload/t1.png");
        let private = CapabilityVerifier::new(PUBLIC_KEY, Audience::Private).unwrap();
        assert!(private.verify(token, "upload/t1.png", Verb::Get).is_ok());

        let (base, token) = new_task.translation_mask_upload_url.split_once("?t=").unwrap();
        assert_eq!(base, "http://r2.test/public/mask/t1.png");
        let public = CapabilityVerifier::new(PUBLIC_KEY, Audience::Public).unwrap();
        assert!(public.verify(token, "mask/t1.png", Verb::Put).is_ok());
        assert!(public.verify(token, "mask/t1.png", Verb::Get).is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.records.get("t1").unwrap().last_attempted_at.is_some());
    }

    #[tokio::test]
    async fn spreads_to_least_loaded_with_two_slots() {
        let mut h = Harness::new().await;
        let (w1, _rx1) = h.worker().await;
        let (w2, _rx2) = h.worker().await;
        for i in 0..5 {
            h.submit(task(&format!("t{}", i), &[])).await.unwrap();
        }

        assert_eq!(in_flight_ids(&h, w1), vec!["t0", "t2"]);
        assert_eq!(in_flight_ids(&h, w2), vec!["t1", "t3"]);
        assert_eq!(
            h.coord.find_task_status("t4"),
            QueryV1Message::Pending { pos: 1 }
        );

        // un worker nuevo se lleva lo que quedó
        let (w3, _rx3) = h.worker().await;
        assert_eq!(in_flight_ids(&h, w3), vec!["t4"]);
        assert!(h.coord.queue.is_empty());
    }

    #[tokio::test]
    async fn same_id_is_not_processed_twice() {
        let mut h = Harness::new().await;
        let (w1, _rx1) = h.worker().await;
        h.submit(task("t1", &[])).await.unwrap();
        let (w2, mut rx2) = h.worker().await;

        // reintento mientras t1 sigue en w1
        h.submit(task("t1", &[])).await.unwrap();
        h.submit(task("t2", &[])).await.unwrap();

        assert_eq!(in_flight_ids(&h, w1), vec!["t1"]);
        assert_eq!(in_flight_ids(&h, w2), vec!["t2"]);
        assert_eq!(new_task_id(&mut rx2), "t2");
        assert_eq!(
            h.coord.find_task_status("t1"),
            QueryV1Message::Status {
                status: "pending".into()
            }
        );
        // la copia sigue en la cabeza esperando
        assert_eq!(h.coord.queue.front().map(|t| t.id.as_str()), Some("t1"));
    }

    #[tokio::test]
    async fn bad_signing_key_leaves_task_queued() {
        let mut h = Harness::with_private_key("not a pem").await;
        let (w, mut rx) = h.worker().await;
        h.submit(task("t1", &[])).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(in_flight_ids(&h, w).is_empty());
        assert_eq!(
            h.coord.find_task_status("t1"),
            QueryV1Message::Pending { pos: 1 }
        );
    }
}
