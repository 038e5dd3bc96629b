//! Sharded counter for the change sums of very shallow nodes, where a single
//! fetch-add word would serialize every updating thread.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use rand::Rng;

pub(crate) struct MultiCounter {
    cells: Box<[CachePadded<AtomicUsize>]>,
}

impl MultiCounter {
    pub(crate) fn new() -> Self {
        let shards = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1);
        Self::with_shards(shards)
    }

    pub(crate) fn with_shards(shards: usize) -> Self {
        let shards = shards.max(1);
        MultiCounter {
            cells: (0..shards)
                .map(|_| CachePadded::new(AtomicUsize::new(0)))
                .collect(),
        }
    }

    /// Adds one to a randomly chosen shard to scatter contention.
    pub(crate) fn increment(&self) {
        let ix = rand::thread_rng().gen_range(0..self.cells.len());
        self.cells[ix].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn read(&self) -> usize {
        self.cells.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::MultiCounter;
    use crossbeam_utils::thread;

    #[test]
    fn sums_across_shards() {
        let counter = MultiCounter::with_shards(4);
        for _ in 0..1000 {
            counter.increment();
        }
        assert_eq!(counter.read(), 1000);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 10_000;
        let counter = &MultiCounter::new();
        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(move |_| {
                    for _ in 0..PER_THREAD {
                        counter.increment();
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(counter.read(), THREADS * PER_THREAD);
    }
}
