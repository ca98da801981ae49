use std::collections::HashMap;

use crate::models::CacheRecord;

/// Keyed cache capped at `max_size` entries. When full, the entry with the
/// oldest record timestamp is evicted (ties broken by id).
#[derive(Debug, Clone)]
pub struct BoundedCache<V> {
    entries: HashMap<String, V>,
    max_size: usize,
}

impl<V: CacheRecord + Clone> BoundedCache<V> {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_size: max_size.max(1),
        }
    }

    /// Inserts or replaces by id. Returns whatever was evicted to stay within capacity.
    pub fn insert(&mut self, value: V) -> Vec<V> {
        self.entries.insert(value.record_id().to_string(), value);
        let mut evicted = Vec::new();
        while self.entries.len() > self.max_size {
            let oldest = self
                .entries
                .values()
                .min_by(|a, b| {
                    a.record_timestamp()
                        .cmp(&b.record_timestamp())
                        .then_with(|| a.record_id().cmp(b.record_id()))
                })
                .map(|v| v.record_id().to_string());
            match oldest.and_then(|id| self.entries.remove(&id)) {
                Some(value) => evicted.push(value),
                None => break,
            }
        }
        evicted
    }

    pub fn get(&self, id: &str) -> Option<&V> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut V> {
        self.entries.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<V> {
        self.entries.remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Values ordered newest first.
    pub fn snapshot(&self) -> Vec<V> {
        let mut values: Vec<V> = self.entries.values().cloned().collect();
        values.sort_by(|a, b| {
            b.record_timestamp()
                .cmp(&a.record_timestamp())
                .then_with(|| a.record_id().cmp(b.record_id()))
        });
        values
    }
}
