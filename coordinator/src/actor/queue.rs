//! Admisión de tareas y snapshot durable de la cola.

use common::{merge_groups, GroupKey, Task};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::Coordinator;
use crate::error::{AdmissionError, Result};
use crate::storage::{backlog_index_key, backlog_key, get_json, put_json, StorageError, QUEUE_KEY};

/// Índice inverso del backlog (`gct:{id}` → `[sid, {group}]`), para
/// encontrar la entrada `gcs:` de una tarea que se vuelve a enviar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogIndex(String, BacklogGroups);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct BacklogGroups {
    group: Vec<GroupKey>,
}

impl BacklogIndex {
    pub fn new(sid: impl Into<String>, group: Vec<GroupKey>) -> Self {
        Self(sid.into(), BacklogGroups { group })
    }

    pub fn sid(&self) -> &str {
        &self.0
    }

    pub fn groups(&self) -> &[GroupKey] {
        &self.1.group
    }
}

impl Coordinator {
    /// Admite una tarea nueva o reemplaza la que ya está en cola con el
    /// mismo id. Devuelve la posición (desde 1).
    pub(crate) async fn submit(&mut self, mut task: Task) -> Result<usize> {
        let limit = self.config.group_limit;

        let pos = match self.queue.iter().position(|t| t.id == task.id) {
            // reintento forzado mientras la original sigue en cola
            Some(idx) => {
                let old = self.queue[idx].group.clone();
                let merged = merge_groups(&old, &task.group);
                if merged.len() > limit {
                    return Err(AdmissionError::GroupLimit.into());
                }
                for g in merged.iter().filter(|g| !old.contains(g)) {
                    self.inc_active_group(g);
                }
                task.group = merged;
                debug!("tarea {} reemplazada en la posición {}", task.id, idx + 1);
                self.queue[idx] = task.clone();
                idx + 1
            }
            None => {
                let index_key = backlog_index_key(&task.id);
                let backlogged: Option<BacklogIndex> =
                    get_json(self.storage.as_ref(), &index_key).await?;
                if let Some(entry) = &backlogged {
                    let merged = merge_groups(entry.groups(), &task.group);
                    if merged.len() > limit {
                        return Err(AdmissionError::GroupLimit.into());
                    }
                    task.group = merged;
                }

                if self.queue.len() >= self.config.queue_cap
                    && !self.evict(false, &task.group).await?
                {
                    info!("cola llena, se rechaza {}", task.id);
                    return Err(AdmissionError::QueueFull.into());
                }

                if let Some(entry) = backlogged {
                    debug!("tarea {} vuelve del backlog", task.id);
                    self.storage
                        .delete(&[index_key, backlog_key(entry.sid())])
                        .await?;
                }

                for g in &task.group {
                    self.inc_active_group(g);
                }
                self.queue.push_back(task.clone());
                self.queue.len()
            }
        };

        self.keep_alive.insert(task.id);
        self.queue_dirty = true;

        self.assign(None, false).await;
        self.flush_queue().await?;

        Ok(pos)
    }

    pub(crate) async fn flush_queue(&mut self) -> std::result::Result<(), StorageError> {
        if self.queue_dirty {
            put_json(self.storage.as_ref(), QUEUE_KEY, &self.queue).await?;
            self.queue_dirty = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::{QueryV1Message, Task};

    use super::*;
    use crate::actor::testing::*;
    use crate::config::CoordinatorConfig;
    use crate::error::CoordinatorError;
    use crate::storage::Storage;

    #[tokio::test]
    async fn positions_are_one_based() {
        let mut h = Harness::new().await;
        assert_eq!(h.submit(task("t1", &[])).await.unwrap(), 1);
        assert_eq!(h.submit(task("t2", &[])).await.unwrap(), 2);
        assert_eq!(
            h.coord.find_task_status("t2"),
            QueryV1Message::Pending { pos: 2 }
        );
        assert_eq!(h.coord.find_task_status("nope"), QueryV1Message::NotFound);
    }

    #[tokio::test]
    async fn snapshot_is_flushed_before_reply() {
        let mut h = Harness::new().await;
        h.submit(task("t1", &["g"])).await.unwrap();
        let saved: Vec<Task> = get_json(h.storage.as_ref(), QUEUE_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].group, vec!["g".to_string()]);
        assert!(!h.coord.queue_dirty);
    }

    #[tokio::test]
    async fn resubmission_replaces_in_place_and_merges_groups() {
        let mut h = Harness::new().await;
        h.submit(task("t0", &[])).await.unwrap();
        h.submit(task("t1", &["a"])).await.unwrap();

        let mut retry = task("t1", &["b"]);
        retry.size = "L".into();
        assert_eq!(h.submit(retry).await.unwrap(), 2);

        assert_eq!(h.coord.queue.len(), 2);
        let queued = &h.coord.queue[1];
        assert_eq!(queued.group, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(queued.size, "L");
        assert_eq!(h.coord.active_group_count("a"), 1);
        assert_eq!(h.coord.active_group_count("b"), 1);

        // repetir un grupo que ya tenía no suma
        h.submit(task("t1", &["a"])).await.unwrap();
        assert_eq!(h.coord.active_group_count("a"), 1);
    }

    #[tokio::test]
    async fn group_limit_rejects_without_mutation() {
        let mut h = Harness::new().await;
        h.submit(task("t1", &["a"])).await.unwrap();
        for g in ["b", "c", "d"] {
            h.submit(task("t1", &[g])).await.unwrap();
        }
        assert_eq!(h.coord.queue[0].group.len(), 4);

        let err = h.submit(task("t1", &["e"])).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Admission(AdmissionError::GroupLimit)
        ));
        assert_eq!(h.coord.queue[0].group.len(), 4);
        assert_eq!(h.coord.active_group_count("e"), 0);
    }

    #[tokio::test]
    async fn backlogged_task_comes_back_with_merged_groups() {
        let mut h = Harness::new().await;
        let stored = task("t9", &["a"]);
        put_json(h.storage.as_ref(), "gcs:0001", &stored).await.unwrap();
        put_json(
            h.storage.as_ref(),
            "gct:t9",
            &BacklogIndex::new("0001", vec!["a".to_string()]),
        )
        .await
        .unwrap();

        assert_eq!(h.submit(task("t9", &["b"])).await.unwrap(), 1);
        assert_eq!(
            h.coord.queue[0].group,
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(h.coord.active_group_count("a"), 1);
        assert_eq!(h.coord.active_group_count("b"), 1);
        assert!(h.storage.get("gcs:0001").await.unwrap().is_none());
        assert!(h.storage.get("gct:t9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn full_queue_evicts_unwatched_tasks_and_they_come_back() {
        let mut h = Harness::with_config(CoordinatorConfig {
            queue_cap: 4,
            gc_target: 2,
            keep_alive: Duration::ZERO,
            ..CoordinatorConfig::default()
        })
        .await;
        for i in 0..4 {
            h.submit(task(&format!("t{}", i), &["g"])).await.unwrap();
        }
        assert_eq!(h.coord.active_group_count("g"), 4);

        // cola llena: se desalojan las dos más viejas y entra la nueva
        assert_eq!(h.submit(task("t4", &["x"])).await.unwrap(), 3);
        let ids: Vec<&str> = h.coord.queue.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t2", "t3", "t4"]);
        assert_eq!(h.coord.active_group_count("g"), 2);
        assert_eq!(h.coord.active_group_count("x"), 1);

        let index: BacklogIndex = get_json(h.storage.as_ref(), "gct:t0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(index.groups(), &["g".to_string()]);
        let stored: Task = get_json(h.storage.as_ref(), &backlog_key(index.sid()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, "t0");
        assert_eq!(h.storage.list("gcs:", 10).await.unwrap().len(), 2);

        // reenviarla la trae del backlog con los grupos unidos
        assert_eq!(h.submit(task("t0", &["y"])).await.unwrap(), 4);
        assert_eq!(
            h.coord.queue[3].group,
            vec!["g".to_string(), "y".to_string()]
        );
        assert_eq!(h.coord.active_group_count("g"), 3);
        assert_eq!(h.coord.active_group_count("y"), 1);
        assert!(h.storage.get("gct:t0").await.unwrap().is_none());
        assert_eq!(h.storage.list("gcs:", 10).await.unwrap().len(), 1);
    }

    #[test]
    fn backlog_index_wire_shape() {
        let entry = BacklogIndex::new("sid", vec!["g".into()]);
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            serde_json::json!(["sid", {"group": ["g"]}])
        );
    }
}
