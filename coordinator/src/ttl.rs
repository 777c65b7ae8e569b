use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Conjunto cuyos elementos expiran `ttl` después de su último `insert`.
#[derive(Debug)]
pub struct TtlSet<T> {
    ttl: Duration,
    entries: HashMap<T, Instant>,
    last_pruned: Instant,
}

impl<T: Eq + Hash> TtlSet<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            last_pruned: Instant::now(),
        }
    }

    pub fn insert(&mut self, value: T) {
        self.insert_at(value, Instant::now());
    }

    pub fn insert_at(&mut self, value: T, now: Instant) {
        // poda perezosa, a lo sumo una vez por ttl
        if now.saturating_duration_since(self.last_pruned) > self.ttl {
            self.last_pruned = now;
            let ttl = self.ttl;
            self.entries
                .retain(|_, at| now.saturating_duration_since(*at) < ttl);
        }
        self.entries.insert(value, now);
    }

    pub fn contains(&self, value: &T) -> bool {
        self.contains_at(value, Instant::now())
    }

    pub fn contains_at(&self, value: &T, now: Instant) -> bool {
        self.entries
            .get(value)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.ttl)
    }

    #[cfg(test)]
    pub fn remove(&mut self, value: &T) -> bool {
        self.entries.remove(value).is_some()
    }

    /// Cantidad de entradas guardadas, incluidas las vencidas aún sin podar.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
