// src/server/notify.rs

//! Subscription tables mapping a client connection to a watch set of job ids
//! or machine names, per §4.3's ALL/set/no-op semantics.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Watch<T> {
    All,
    Set(HashSet<T>),
}

/// A subscription table for one kind of watch (jobs or machines), keyed by
/// session id.
#[derive(Default)]
pub struct WatchTable<T> {
    watches: HashMap<u64, Watch<T>>,
}

impl<T: Eq + Hash + Clone> WatchTable<T> {
    pub fn new() -> Self {
        Self {
            watches: HashMap::new(),
        }
    }

    /// `notify_X()` with no argument: subscribe to ALL.
    pub fn subscribe_all(&mut self, session_id: u64) {
        self.watches.insert(session_id, Watch::All);
    }

    /// `notify_X(id)`: if ALL, no-op; else add id to the set.
    pub fn subscribe_one(&mut self, session_id: u64, item: T) {
        match self.watches.get_mut(&session_id) {
            Some(Watch::All) => {}
            Some(Watch::Set(set)) => {
                set.insert(item);
            }
            None => {
                self.watches
                    .insert(session_id, Watch::Set(HashSet::from([item])));
            }
        }
    }

    /// `no_notify_X(id)`: if ALL, no-op; else discard id, removing the entry
    /// entirely if the set becomes empty.
    pub fn unsubscribe_one(&mut self, session_id: u64, item: &T) {
        let Some(watch) = self.watches.get_mut(&session_id) else {
            return;
        };
        if let Watch::Set(set) = watch {
            set.remove(item);
            if set.is_empty() {
                self.watches.remove(&session_id);
            }
        }
    }

    /// `no_notify_X()` with no argument: remove the watch entry entirely.
    pub fn unsubscribe_all(&mut self, session_id: u64) {
        self.watches.remove(&session_id);
    }

    /// Called when a client disconnects; discards any watch it held.
    pub fn remove_session(&mut self, session_id: u64) {
        self.watches.remove(&session_id);
    }

    /// Computes the intersection of `changed` with this session's watch, if
    /// subscribed and the intersection is non-empty. `None` when nothing
    /// should be sent this iteration.
    pub fn matching(&self, session_id: u64, changed: &HashSet<T>) -> Option<Vec<T>>
    where
        T: Ord,
    {
        let watch = self.watches.get(&session_id)?;
        let mut matched: Vec<T> = match watch {
            Watch::All => changed.iter().cloned().collect(),
            Watch::Set(set) => set.intersection(changed).cloned().collect(),
        };
        if matched.is_empty() {
            return None;
        }
        matched.sort();
        Some(matched)
    }

    pub fn subscribed_sessions(&self) -> impl Iterator<Item = u64> + '_ {
        self.watches.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_one_after_all_is_a_no_op() {
        let mut table: WatchTable<u64> = WatchTable::new();
        table.subscribe_all(1);
        table.subscribe_one(1, 5);
        assert_eq!(table.watches.get(&1), Some(&Watch::All));
    }

    #[test]
    fn unsubscribe_one_removes_empty_set_entry() {
        let mut table: WatchTable<u64> = WatchTable::new();
        table.subscribe_one(1, 5);
        table.unsubscribe_one(1, &5);
        assert_eq!(table.watches.get(&1), None);
    }

    #[test]
    fn unsubscribe_one_on_all_is_a_no_op() {
        let mut table: WatchTable<u64> = WatchTable::new();
        table.subscribe_all(1);
        table.unsubscribe_one(1, &5);
        assert_eq!(table.watches.get(&1), Some(&Watch::All));
    }

    #[test]
    fn unsubscribe_all_on_unsubscribed_client_is_a_no_op() {
        let mut table: WatchTable<u64> = WatchTable::new();
        table.unsubscribe_all(42);
        assert!(table.watches.is_empty());
    }

    #[test]
    fn matching_returns_none_when_intersection_empty() {
        let mut table: WatchTable<u64> = WatchTable::new();
        table.subscribe_one(1, 5);
        let changed = HashSet::from([6, 7]);
        assert_eq!(table.matching(1, &changed), None);
    }

    #[test]
    fn matching_all_returns_full_changed_set_sorted() {
        let mut table: WatchTable<u64> = WatchTable::new();
        table.subscribe_all(1);
        let changed = HashSet::from([3, 1, 2]);
        assert_eq!(table.matching(1, &changed), Some(vec![1, 2, 3]));
    }
}
