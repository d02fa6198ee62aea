//! Concurrent map whose values are computed at most once per key.

use std::hash::Hash;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

/// Every caller asking for the same key observes the value produced by a
/// single initializer run. The shard lock is only held while the cell is
/// looked up, never while the initializer runs, so initializers may call
/// back into the map for other keys.
#[derive(Debug)]
pub struct OnceMap<K, V>
where
    K: Eq + Hash,
{
    cells: DashMap<K, Arc<OnceLock<V>>>,
}

impl<K, V> Default for OnceMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            cells: DashMap::new(),
        }
    }
}

impl<K, V> OnceMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_init(&self, key: K, init: impl FnOnce() -> V) -> V {
        let cell = Arc::clone(self.cells.entry(key).or_default().value());
        cell.get_or_init(init).clone()
    }

    /// Value for `key` if it has been initialized.
    pub fn get(&self, key: &K) -> Option<V> {
        let cell = self.cells.get(key).map(|c| Arc::clone(c.value()))?;
        cell.get().cloned()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Initialized entries in key order.
    pub fn snapshot(&self) -> Vec<(K, V)>
    where
        K: Ord,
    {
        let cells: Vec<(K, Arc<OnceLock<V>>)> = self
            .cells
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        let mut out: Vec<(K, V)> = cells
            .into_iter()
            .filter_map(|(k, cell)| cell.get().cloned().map(|v| (k, v)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn concurrent_callers_share_one_value() {
        let map: OnceMap<&str, Arc<String>> = OnceMap::new();
        let runs = AtomicUsize::new(0);
        let barrier = Barrier::new(100);

        let values: Vec<Arc<String>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..100)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        map.get_or_init("key", || {
                            runs.fetch_add(1, Ordering::SeqCst);
                            Arc::new("value".to_string())
                        })
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
    }

    #[test]
    fn initializer_may_reenter_for_other_keys() {
        let map: OnceMap<u32, u32> = OnceMap::new();
        let v = map.get_or_init(1, || map.get_or_init(2, || 20) + 1);
        assert_eq!(v, 21);
        assert_eq!(map.get(&2), Some(20));
    }

    #[test]
    fn snapshot_is_sorted() {
        let map: OnceMap<u32, &str> = OnceMap::new();
        map.get_or_init(3, || "c");
        map.get_or_init(1, || "a");
        map.get_or_init(2, || "b");
        let keys: Vec<u32> = map.snapshot().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }
}
