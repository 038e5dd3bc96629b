use crossbeam_epoch::Guard;

/// Minimal concurrent map surface. Values are word-sized and copied out, so
/// lookups return them by value.
pub trait ConcurrentMap<K, V> {
    fn new() -> Self;
    fn get(&self, key: &K, guard: &Guard) -> Option<V>;
    /// Inserts only if the key is absent; returns whether it did.
    fn insert(&self, key: K, value: V, guard: &Guard) -> bool;
    fn remove(&self, key: &K, guard: &Guard) -> Option<V>;
}

#[cfg(test)]
pub mod tests {
    use super::ConcurrentMap;
    use crossbeam_epoch::pin;
    use crossbeam_utils::thread;
    use rand::prelude::*;

    const THREADS: u64 = 30;
    const ELEMENTS_PER_THREADS: u64 = 1000;

    pub fn smoke<M: ConcurrentMap<u64, u64> + Send + Sync>() {
        let map = &M::new();

        thread::scope(|s| {
            for t in 0..THREADS {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<u64> =
                        (0..ELEMENTS_PER_THREADS).map(|k| k * THREADS + t).collect();
                    keys.shuffle(&mut rng);
                    for i in keys {
                        assert!(map.insert(i, i + 1, &pin()));
                    }
                });
            }
        })
        .unwrap();

        thread::scope(|s| {
            for t in 0..(THREADS / 2) {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<u64> =
                        (0..ELEMENTS_PER_THREADS).map(|k| k * THREADS + t).collect();
                    keys.shuffle(&mut rng);
                    for i in keys {
                        assert_eq!(map.remove(&i, &pin()), Some(i + 1));
                    }
                });
            }
        })
        .unwrap();

        thread::scope(|s| {
            for t in (THREADS / 2)..THREADS {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<u64> =
                        (0..ELEMENTS_PER_THREADS).map(|k| k * THREADS + t).collect();
                    keys.shuffle(&mut rng);
                    for i in keys {
                        assert_eq!(map.get(&i, &pin()), Some(i + 1));
                    }
                });
            }
        })
        .unwrap();
    }
}
