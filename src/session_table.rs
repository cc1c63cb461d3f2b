use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::hash::Hash;
use std::sync::RwLock;

/// The concurrent table behind a listener's session demux and a dialer's id registry.
///  Lookups on the demux hot path take the shared lock; the rare mutations (session
///  creation and teardown) take the exclusive one.
///
/// Insertion goes through a vacant-entry check under the exclusive lock, so two frames
///  racing to create the same session collapse to a single winner and the loser gets
///  the winner's entry back.
pub struct SessionTable<K, V> {
    entries: RwLock<FxHashMap<K, V>>,
}

impl<K: Hash + Eq, V: Clone> SessionTable<K, V> {
    pub fn new() -> SessionTable<K, V> {
        SessionTable {
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.read().unwrap().get(key).cloned()
    }

    /// Load-or-insert in one step: stores `value` iff `key` is vacant. Returns the
    ///  occupant if there already was one, `None` if `value` went in.
    pub fn insert_if_vacant(&self, key: K, value: V) -> Option<V> {
        match self.entries.write().unwrap().entry(key) {
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(value);
                None
            }
        }
    }

    pub fn remove(&self, key: &K) {
        self.entries.write().unwrap().remove(key);
    }
}
