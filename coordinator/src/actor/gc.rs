//! Desalojo de tareas sin observadores al backlog y su recogida posterior.

use std::collections::VecDeque;

use common::{GroupKey, Task};
use tracing::{info, warn};

use super::{Attachment, BacklogIndex, Coordinator};
use crate::storage::{backlog_index_key, backlog_key, put_json, StorageError, BACKLOG_PREFIX};

impl Coordinator {
    /// Una tarea está viva si alguien la consultó hace poco o tiene un
    /// listener propio o de alguno de sus grupos.
    pub(crate) fn is_task_alive(&self, task: &Task) -> bool {
        if self.keep_alive.contains(&task.id) {
            return true;
        }
        self.connections.values().any(|c| match &c.attachment {
            Attachment::Listener { task_id } => *task_id == task.id,
            Attachment::GroupListener { group, .. } => task.group.contains(group),
            Attachment::Worker { .. } => false,
        })
    }

    /// Mueve tareas de la cola al backlog hasta dejarla en `gc_target`,
    /// desde la cabeza. No toca tareas vivas ni las de `skip_groups`.
    /// Devuelve si desalojó algo.
    pub(crate) async fn evict(
        &mut self,
        force: bool,
        skip_groups: &[GroupKey],
    ) -> Result<bool, StorageError> {
        let target = self.config.gc_target;
        if !force && self.queue.len() <= target {
            return Ok(false);
        }

        let mut left = self.queue.len().saturating_sub(target);
        let mut rest = std::mem::take(&mut self.queue).into_iter();
        let mut kept = VecDeque::with_capacity(rest.len());
        let mut evicted = 0usize;

        while let Some(task) = rest.next() {
            if left == 0 {
                kept.push_back(task);
                kept.extend(rest);
                break;
            }
            if task.in_any_group(skip_groups) || self.is_task_alive(&task) {
                kept.push_back(task);
                continue;
            }

            let sid = self.ids.next_id();
            if let Err(e) = self.write_backlog(&sid, &task).await {
                // lo que no se pudo escribir vuelve a su lugar
                kept.push_back(task);
                kept.extend(rest);
                self.queue = kept;
                if evicted > 0 {
                    self.queue_dirty = true;
                    if let Err(flush_err) = self.flush_queue().await {
                        warn!("no se pudo guardar la cola tras un GC parcial: {}", flush_err);
                    }
                }
                return Err(e);
            }

            for g in &task.group {
                self.dec_active_group(g);
            }
            evicted += 1;
            left -= 1;
        }
        self.queue = kept;

        if evicted == 0 {
            return Ok(false);
        }
        info!(
            "GC: {} tareas al backlog, quedan {} en cola",
            evicted,
            self.queue.len()
        );
        self.queue_dirty = true;
        self.flush_queue().await?;
        Ok(true)
    }

    async fn write_backlog(&self, sid: &str, task: &Task) -> Result<(), StorageError> {
        let entry_key = backlog_key(sid);
        put_json(self.storage.as_ref(), &entry_key, task).await?;

        let index = BacklogIndex::new(sid, task.group.clone());
        if let Err(e) = put_json(self.storage.as_ref(), &backlog_index_key(&task.id), &index).await
        {
            let _ = self.storage.delete(&[entry_key]).await;
            return Err(e);
        }
        Ok(())
    }

    /// Con la cola casi vacía, trae al final las tareas más viejas del backlog.
    pub(crate) async fn pickup(&mut self) -> Result<(), StorageError> {
        if self.queue.len() > self.config.gc_pickup_threshold {
            return Ok(());
        }

        let entries = self
            .storage
            .list(BACKLOG_PREFIX, self.config.gc_pickup_count)
            .await?;
        if entries.is_empty() {
            return Ok(());
        }

        let mut keys = Vec::with_capacity(entries.len() * 2);
        let mut tasks = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match serde_json::from_value::<Task>(value) {
                Ok(task) => {
                    keys.push(backlog_index_key(&task.id));
                    tasks.push(task);
                }
                Err(e) => warn!("entrada {} del backlog corrupta, se descarta: {}", key, e),
            }
            keys.push(key);
        }
        self.storage.delete(&keys).await?;

        info!("recogidas {} tareas del backlog", tasks.len());
        for task in tasks {
            for g in &task.group {
                self.inc_active_group(g);
            }
            self.queue.push_back(task);
        }
        self.queue_dirty = true;
        self.flush_queue().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::actor::testing::*;
    use crate::config::CoordinatorConfig;
    use crate::storage::{get_json, Storage};

    fn small() -> CoordinatorConfig {
        CoordinatorConfig {
            queue_cap: 6,
            gc_target: 3,
            gc_pickup_threshold: 1,
            gc_pickup_count: 2,
            keep_alive: Duration::ZERO,
            ..CoordinatorConfig::default()
        }
    }

    fn queued_ids(h: &Harness) -> Vec<String> {
        h.coord.queue.iter().map(|t| t.id.clone()).collect()
    }

    #[tokio::test]
    async fn evicts_unwatched_head_down_to_target() {
        let mut h = Harness::with_config(small()).await;
        for i in 0..6 {
            h.submit(task(&format!("t{}", i), &["g"])).await.unwrap();
        }
        // t0 está observada
        let (_l, _rx) = h.task_listener("t0").await;

        assert!(h.coord.evict(false, &[]).await.unwrap());
        assert_eq!(queued_ids(&h), vec!["t0", "t4", "t5"]);
        assert_eq!(h.coord.active_group_count("g"), 3);

        let index: BacklogIndex = get_json(h.storage.as_ref(), "gct:t1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(index.groups(), &["g".to_string()]);
        let stored: Task = get_json(h.storage.as_ref(), &backlog_key(index.sid()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, "t1");

        // el snapshot refleja la cola nueva
        let saved: Vec<Task> = get_json(h.storage.as_ref(), "queue")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.len(), 3);
    }

    #[tokio::test]
    async fn skip_groups_and_group_listeners_protect_tasks() {
        let mut h = Harness::with_config(small()).await;
        for (id, g) in [("a1", "a"), ("b1", "b"), ("c1", "c"), ("c2", "c"), ("c3", "c")] {
            h.submit(task(id, &[g])).await.unwrap();
        }
        let (_gl, _grx) = h.group_listener("b").await;

        assert!(h.coord.evict(false, &["a".to_string()]).await.unwrap());
        assert_eq!(queued_ids(&h), vec!["a1", "b1", "c3"]);
        assert_eq!(h.coord.active_group_count("c"), 1);
    }

    #[tokio::test]
    async fn nothing_to_evict_when_everyone_is_watching() {
        let mut h = Harness::with_config(small()).await;
        for i in 0..5 {
            h.submit(task(&format!("t{}", i), &["g"])).await.unwrap();
        }
        let (_gl, _grx) = h.group_listener("g").await;
        assert!(!h.coord.evict(false, &[]).await.unwrap());
        assert_eq!(h.coord.queue.len(), 5);
        assert!(h.storage.list("gcs:", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_keeps_queue_intact() {
        let mut h = Harness::with_config(small()).await;
        for i in 0..5 {
            h.submit(task(&format!("t{}", i), &[])).await.unwrap();
        }
        h.storage.set_available(false);
        assert!(h.coord.evict(false, &[]).await.is_err());
        assert_eq!(queued_ids(&h), vec!["t0", "t1", "t2", "t3", "t4"]);
    }

    #[tokio::test]
    async fn pickup_appends_oldest_backlog_entries() {
        let mut h = Harness::with_config(small()).await;
        for (sid, id) in [("0002", "b"), ("0001", "a"), ("0003", "c")] {
            put_json(h.storage.as_ref(), &backlog_key(sid), &task(id, &["g"]))
                .await
                .unwrap();
            put_json(
                h.storage.as_ref(),
                &backlog_index_key(id),
                &BacklogIndex::new(sid, vec!["g".into()]),
            )
            .await
            .unwrap();
        }

        h.coord.pickup().await.unwrap();
        assert_eq!(queued_ids(&h), vec!["a", "b"]);
        assert_eq!(h.coord.active_group_count("g"), 2);
        assert!(h.storage.get("gct:a").await.unwrap().is_none());
        assert!(h.storage.get("gct:c").await.unwrap().is_some());

        // por encima del umbral no se recoge nada más
        h.coord.pickup().await.unwrap();
        assert_eq!(h.coord.queue.len(), 2);
    }

    #[tokio::test]
    async fn corrupt_backlog_entries_are_dropped() {
        let mut h = Harness::with_config(small()).await;
        h.storage.put("gcs:0001", json!("garbage")).await.unwrap();
        h.coord.pickup().await.unwrap();
        assert!(h.coord.queue.is_empty());
        assert!(h.storage.get("gcs:0001").await.unwrap().is_none());
    }
}
