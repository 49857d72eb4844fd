// src/store.rs
//
// Bounded, ordered, deduplicated in-memory alarm feed.
//
// Invariants held after every operation:
// - at most one entry per event id
// - iteration order is id descending (newest first)
// - never more than `capacity` entries; overflow evicts the lowest ids
//
// Authorization is not checked here. Callers filter before mutating.

use crate::event::{AlertEvent, EventId};
use std::collections::BTreeMap;
use tracing::trace;

/// Live-tracked feed contents
#[derive(Debug, Clone)]
pub struct FeedStore {
    entries: BTreeMap<EventId, AlertEvent>,
    capacity: usize,
}

impl FeedStore {
    /// Create an empty store. A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Highest id currently held
    pub fn newest_id(&self) -> Option<EventId> {
        self.entries.keys().next_back().copied()
    }

    /// Insert a new event. Returns `false` when the id was already present
    /// (the existing entry is left untouched) or the event was immediately
    /// evicted for being older than everything in a full store.
    pub fn insert(&mut self, event: AlertEvent) -> bool {
        let id = event.id;
        if self.entries.contains_key(&id) {
            trace!("Ignoring duplicate insert for event {}", id);
            return false;
        }
        self.entries.insert(id, event);
        self.trim();
        self.entries.contains_key(&id)
    }

    /// Replace the entry with the same id. Returns `false` if absent.
    pub fn apply_update(&mut self, event: AlertEvent) -> bool {
        match self.entries.get_mut(&event.id) {
            Some(slot) => {
                *slot = event;
                true
            }
            None => {
                trace!("Ignoring update for unknown event {}", event.id);
                false
            }
        }
    }

    /// Remove the entry with this id. Returns `false` if absent.
    pub fn apply_delete(&mut self, id: EventId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Swap the whole collection. Duplicates keep the first occurrence.
    pub fn replace_all(&mut self, events: impl IntoIterator<Item = AlertEvent>) {
        let mut entries = BTreeMap::new();
        for event in events {
            entries.entry(event.id).or_insert(event);
        }
        self.entries = entries;
        self.trim();
    }

    /// Ordered copy of the contents, newest first
    pub fn snapshot(&self) -> Vec<AlertEvent> {
        self.entries.values().rev().cloned().collect()
    }

    /// The newest `limit` entries
    pub fn view(&self, limit: usize) -> Vec<AlertEvent> {
        self.entries.values().rev().take(limit).cloned().collect()
    }

    /// Mutable access to every entry, for filling derived fields such as
    /// station names. Ids must not be changed.
    pub(crate) fn for_each_mut(&mut self, mut f: impl FnMut(&mut AlertEvent)) {
        for event in self.entries.values_mut() {
            f(event);
        }
    }

    fn trim(&mut self) {
        while self.entries.len() > self.capacity {
            if let Some((evicted, _)) = self.entries.pop_first() {
                trace!("Evicted event {} (capacity {})", evicted, self.capacity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(id: i64, station: u64, message: &str) -> AlertEvent {
        AlertEvent::new(id, message, Utc::now(), 2, station)
    }

    fn ids(store: &FeedStore) -> Vec<i64> {
        store.snapshot().iter().map(|e| e.id).collect()
    }

    #[test]
    fn test_insert_orders_newest_first() {
        let mut store = FeedStore::new(10);
        for id in [4, 1, 9, 3] {
            store.insert(event(id, 1, "x"));
        }
        assert_eq!(ids(&store), vec![9, 4, 3, 1]);
        assert_eq!(store.newest_id(), Some(9));
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let mut store = FeedStore::new(10);
        assert!(store.insert(event(5, 1, "first")));
        assert!(!store.insert(event(5, 1, "second")));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].message, "first");
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut store = FeedStore::new(2);
        for id in 1..=3 {
            store.insert(event(id, 1, "x"));
        }
        assert_eq!(ids(&store), vec![3, 2]);

        // Older than everything in a full store: dropped straight away
        assert!(!store.insert(event(1, 1, "late")));
        assert_eq!(ids(&store), vec![3, 2]);
    }

    #[test]
    fn test_update_in_place() {
        let mut store = FeedStore::new(10);
        store.insert(event(5, 10, "original"));
        store.insert(event(6, 10, "other"));
        assert!(store.apply_update(event(5, 10, "X")));
        let snapshot = store.snapshot();
        assert_eq!(ids(&store), vec![6, 5]);
        assert_eq!(snapshot[1].message, "X");

        assert!(!store.apply_update(event(99, 10, "ghost")));
        assert!(!store.contains(99));
    }

    #[test]
    fn test_delete() {
        let mut store = FeedStore::new(10);
        store.insert(event(1, 1, "x"));
        assert!(store.apply_delete(1));
        assert!(!store.apply_delete(1));
        assert!(store.is_empty());
    }

    #[test]
    fn test_replace_all_dedups_and_trims() {
        let mut store = FeedStore::new(3);
        store.insert(event(100, 1, "stale"));
        store.replace_all(vec![
            event(1, 1, "a"),
            event(7, 1, "b"),
            event(7, 1, "dup"),
            event(3, 1, "c"),
            event(5, 1, "d"),
        ]);
        assert_eq!(ids(&store), vec![7, 5, 3]);
        assert_eq!(store.snapshot()[0].message, "b");
    }

    #[test]
    fn test_view_limit() {
        let mut store = FeedStore::new(100);
        store.replace_all((1..=50).map(|id| event(id, 1, "x")));
        let view = store.view(30);
        assert_eq!(view.len(), 30);
        assert_eq!(view[0].id, 50);
        assert_eq!(view[29].id, 21);
    }

    #[test]
    fn test_zero_capacity_raised() {
        let mut store = FeedStore::new(0);
        store.insert(event(1, 1, "x"));
        store.insert(event(2, 1, "y"));
        assert_eq!(store.capacity(), 1);
        assert_eq!(ids(&store), vec![2]);
    }
}
