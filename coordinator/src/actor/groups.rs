//! Conteo de referencias de grupos activos.
//!
//! Un grupo está activo mientras alguna tarea en cola o en vuelo lo tenga.
//! Las tareas en backlog no cuentan: al desalojar se decrementa y al
//! retomarlas se vuelve a incrementar.

use std::collections::HashMap;
use std::time::Instant;

use common::GroupKey;

use super::{Attachment, Coordinator};

impl Coordinator {
    /// Reconstruye el mapa desde la cola y los workers si no está cargado.
    pub(crate) fn ensure_active_groups(&mut self) {
        if self.active_groups.is_some() {
            return;
        }

        let mut groups: HashMap<GroupKey, usize> = HashMap::new();
        for conn in self.connections.values() {
            if let Attachment::Worker { in_flight, .. } = &conn.attachment {
                for task in in_flight {
                    for g in &task.groups {
                        *groups.entry(g.clone()).or_default() += 1;
                    }
                }
            }
        }
        for task in &self.queue {
            for g in &task.group {
                *groups.entry(g.clone()).or_default() += 1;
            }
        }
        self.active_groups = Some(groups);
    }

    fn groups_mut(&mut self) -> &mut HashMap<GroupKey, usize> {
        self.ensure_active_groups();
        self.active_groups.get_or_insert_with(HashMap::new)
    }

    /// Incrementar cuenta como renovación del grupo.
    pub(crate) fn inc_active_group(&mut self, group: &GroupKey) {
        *self.groups_mut().entry(group.clone()).or_default() += 1;
        self.renew_group_listeners(std::slice::from_ref(group), Instant::now());
    }

    /// Devuelve `true` si el grupo dejó de estar activo.
    pub(crate) fn dec_active_group(&mut self, group: &str) -> bool {
        let groups = self.groups_mut();
        let remaining = groups.get(group).copied().unwrap_or(0).saturating_sub(1);
        if remaining == 0 {
            groups.remove(group);
            true
        } else {
            groups.insert(group.to_string(), remaining);
            false
        }
    }

    pub fn active_group_count(&self, group: &str) -> usize {
        self.active_groups
            .as_ref()
            .and_then(|g| g.get(group).copied())
            .unwrap_or(0)
    }
}
