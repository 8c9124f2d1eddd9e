use slotmap::{Key, SlotMap};

use crate::renderer::sync_policy::{PolicyMutex, SyncPolicy};

/// Owning table of live native objects, addressed by generation-checked keys.
///
/// Only the table mutation happens under the lock; callers create and destroy the native
/// objects outside of it.
pub struct Registry<K: Key, V, S: SyncPolicy> {
    entries: S::Mutex<SlotMap<K, V>>,
}

impl<K: Key, V, S: SyncPolicy> Default for Registry<K, V, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, V, S: SyncPolicy> Registry<K, V, S> {
    pub fn new() -> Self {
        Self {
            entries: PolicyMutex::new(SlotMap::with_key()),
        }
    }

    pub fn insert(&self, value: V) -> K {
        self.entries.lock().insert(value)
    }

    pub fn remove(&self, key: K) -> Option<V> {
        self.entries.lock().remove(key)
    }

    pub fn contains(&self, key: K) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn with<R>(&self, key: K, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.entries.lock().get(key).map(f)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes every remaining entry, for teardown.
    pub fn drain(&mut self) -> Vec<V> {
        self.entries
            .get_mut()
            .drain()
            .map(|(_, value)| value)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::sync_policy::{Synchronized, Unsynchronized};

    slotmap::new_key_type! { struct TestKey; }

    #[test]
    fn stale_keys_do_not_resolve() {
        let registry = Registry::<TestKey, &str, Unsynchronized>::new();
        let first = registry.insert("first");
        assert_eq!(registry.remove(first), Some("first"));

        let second = registry.insert("second");
        assert_ne!(first, second);
        assert!(!registry.contains(first));
        assert_eq!(registry.remove(first), None);
        assert_eq!(registry.with(second, |v| v.len()), Some(6));
    }

    #[test]
    fn drain_empties_the_table() {
        let mut registry = Registry::<TestKey, u32, Synchronized>::new();
        registry.insert(1);
        registry.insert(2);
        assert_eq!(registry.len(), 2);

        let mut drained = registry.drain();
        drained.sort();
        assert_eq!(drained, vec![1, 2]);
        assert!(registry.is_empty());
    }
}
