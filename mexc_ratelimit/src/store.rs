use dashmap::DashMap;

/// Concurrent per-key state store
///
/// Thin interface over a sharded map: get, update, remove, retain. Mutations
/// run while the entry's shard lock is held, so updates to a single key are
/// atomic while distinct keys proceed in parallel.
pub(crate) struct KeyedStore<T> {
    map: DashMap<String, T>,
}

impl<T> KeyedStore<T> {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    /// Run `f` against the entry for `key`, materializing it with `default`
    /// first if absent. The shard lock is held for the duration of `f`.
    pub fn update<R>(&self, key: &str, default: impl FnOnce() -> T, f: impl FnOnce(&mut T) -> R) -> R {
        let mut entry = self.map.entry(key.to_string()).or_insert_with(default);
        f(entry.value_mut())
    }

    /// Run `f` against an existing entry, if any
    pub fn read<R>(&self, key: &str, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.map.get(key).map(|entry| f(entry.value()))
    }

    pub fn remove(&self, key: &str) -> Option<T> {
        self.map.remove(key).map(|(_, value)| value)
    }

    /// Keep only entries for which the predicate returns true. The predicate
    /// runs under the shard lock, so eligibility is re-verified at delete time.
    pub fn retain(&self, mut f: impl FnMut(&str, &mut T) -> bool) {
        self.map.retain(|key, value| f(key.as_str(), value));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn clear(&self) {
        self.map.clear();
    }

    pub fn snapshot_all(&self) -> Vec<(String, T)>
    where
        T: Clone,
    {
        self.map.iter().map(|entry| (entry.key().clone(), entry.value().clone())).collect()
    }
}

impl<T> Default for KeyedStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_materializes_default() {
        let store: KeyedStore<u64> = KeyedStore::new();

        let value = store.update("a", || 5, |v| {
            *v += 1;
            *v
        });

        assert_eq!(value, 6);
        assert_eq!(store.read("a", |v| *v), Some(6));
        assert_eq!(store.read("b", |v| *v), None);
    }

    #[test]
    fn test_remove_and_retain() {
        let store: KeyedStore<u64> = KeyedStore::new();
        store.update("a", || 0, |_| ());
        store.update("b", || 1, |_| ());

        assert_eq!(store.remove("a"), Some(0));
        assert_eq!(store.len(), 1);

        store.retain(|_, v| *v > 1);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_concurrent_updates_are_atomic() {
        use std::sync::Arc;

        let store: Arc<KeyedStore<u64>> = Arc::new(KeyedStore::new());
        let mut handles = vec![];

        // Spawn 10 threads each incrementing the same key 100 times
        for _ in 0..10 {
            let store_clone = Arc::clone(&store);
            let handle = std::thread::spawn(move || {
                for _ in 0..100 {
                    store_clone.update("counter", || 0, |v| *v += 1);
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.read("counter", |v| *v), Some(1000));
    }
}
