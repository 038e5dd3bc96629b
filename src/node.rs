//! Tree node, key/value pair record and rebuild descriptor.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::multicounter::MultiCounter;
use crate::word;

bitflags! {
    /// Flag bits of a node's `dirty` word. The key-count sum of a finished
    /// mark-and-count phase lives in the bits above them.
    pub(crate) struct Dirty: usize {
        const STARTED = 0b001;
        const FINISHED = 0b010;
        const MARKED_FOR_FREE = 0b100;
    }
}

const DIRTY_SUM_SHIFT: u32 = 3;

#[inline]
pub(crate) fn is_started(dirty: usize) -> bool {
    Dirty::from_bits_truncate(dirty).contains(Dirty::STARTED)
}

#[inline]
pub(crate) fn is_finished(dirty: usize) -> bool {
    Dirty::from_bits_truncate(dirty).contains(Dirty::FINISHED)
}

#[inline]
pub(crate) fn is_marked_for_free(dirty: usize) -> bool {
    Dirty::from_bits_truncate(dirty).contains(Dirty::MARKED_FOR_FREE)
}

#[inline]
pub(crate) fn finished_to_sum(dirty: usize) -> usize {
    debug_assert!(is_finished(dirty));
    dirty >> DIRTY_SUM_SHIFT
}

/// A finished state always carries the started bit, so a single CAS from
/// `STARTED` publishes both the bit and the sum.
#[inline]
pub(crate) fn sum_to_finished(sum: usize) -> usize {
    (sum << DIRTY_SUM_SHIFT) | (Dirty::STARTED | Dirty::FINISHED).bits()
}

/// A variable-arity tree node. `capacity` is fixed at creation; `degree`
/// doubles as the slot-reservation counter while the node is being built
/// cooperatively and is frozen at `capacity` once the node is published.
///
/// `keys`, `min_key` and `max_key` are plain cells: they are written before
/// the node becomes reachable, except during cooperative construction where
/// racing helpers derive identical values from the same frozen source subtree.
#[repr(align(8))]
pub(crate) struct Node<K> {
    capacity: usize,
    pub(crate) degree: AtomicUsize,
    pub(crate) init_size: AtomicUsize,
    pub(crate) dirty: AtomicUsize,
    pub(crate) next_mark_and_count: AtomicUsize,
    change_sum: AtomicUsize,
    external_counter: Option<Box<MultiCounter>>,
    min_key: UnsafeCell<K>,
    max_key: UnsafeCell<K>,
    keys: Box<[UnsafeCell<K>]>,
    pub(crate) slots: Box<[AtomicUsize]>,
}

impl<K: Copy + Default> Node<K> {
    pub(crate) fn new(capacity: usize, with_external_counter: bool) -> Self {
        debug_assert!(capacity >= 1);
        Node {
            capacity,
            degree: AtomicUsize::new(0),
            init_size: AtomicUsize::new(0),
            dirty: AtomicUsize::new(0),
            next_mark_and_count: AtomicUsize::new(0),
            change_sum: AtomicUsize::new(0),
            external_counter: if with_external_counter {
                Some(Box::new(MultiCounter::new()))
            } else {
                None
            },
            min_key: UnsafeCell::new(K::default()),
            max_key: UnsafeCell::new(K::default()),
            keys: (0..capacity - 1).map(|_| UnsafeCell::new(K::default())).collect(),
            slots: (0..capacity).map(|_| AtomicUsize::new(word::NULL_WORD)).collect(),
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(crate) fn degree(&self) -> usize {
        self.degree.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_degree(&self, degree: usize) {
        debug_assert!(degree <= self.capacity);
        self.degree.store(degree, Ordering::Release);
    }

    #[inline]
    pub(crate) fn key(&self, i: usize) -> K {
        debug_assert!(i + 1 < self.capacity);
        unsafe { *self.keys[i].get() }
    }

    #[inline]
    pub(crate) fn set_key(&self, i: usize, key: K) {
        debug_assert!(i + 1 < self.capacity);
        unsafe { *self.keys[i].get() = key }
    }

    #[inline]
    pub(crate) fn min_key(&self) -> K {
        unsafe { *self.min_key.get() }
    }

    #[inline]
    pub(crate) fn set_min_key(&self, key: K) {
        unsafe { *self.min_key.get() = key }
    }

    #[inline]
    pub(crate) fn max_key(&self) -> K {
        unsafe { *self.max_key.get() }
    }

    #[inline]
    pub(crate) fn set_max_key(&self, key: K) {
        unsafe { *self.max_key.get() = key }
    }

    pub(crate) fn increment_change_sum(&self) {
        match &self.external_counter {
            Some(counter) => counter.increment(),
            None => {
                self.change_sum.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn read_change_sum(&self) -> usize {
        match &self.external_counter {
            Some(counter) => counter.read(),
            None => self.change_sum.load(Ordering::Relaxed),
        }
    }
}

/// An immutable heap-allocated pair, standing in for a leaf of one.
#[repr(align(8))]
pub(crate) struct KVPair<K, V> {
    pub(crate) k: K,
    pub(crate) v: V,
}

/// Descriptor of an in-flight subtree replacement.
///
/// `new_root` transitions monotonically: null word, then the word of the
/// freshly built replacement, then the empty-val word once the replacement
/// itself has been claimed for reclamation by a wider rebuild.
#[repr(align(8))]
pub(crate) struct RebuildOp<K> {
    pub(crate) rebuild_root: *const Node<K>,
    pub(crate) parent: *const Node<K>,
    pub(crate) index: usize,
    pub(crate) depth: usize,
    pub(crate) new_root: AtomicUsize,
    pub(crate) success: AtomicBool,
    #[cfg(feature = "disable-rebuild-helping")]
    pub(crate) exclusive: AtomicUsize,
}

impl<K> RebuildOp<K> {
    pub(crate) fn new(
        rebuild_root: *const Node<K>,
        parent: *const Node<K>,
        index: usize,
        depth: usize,
    ) -> Self {
        RebuildOp {
            rebuild_root,
            parent,
            index,
            depth,
            new_root: AtomicUsize::new(word::NULL_WORD),
            success: AtomicBool::new(false),
            #[cfg(feature = "disable-rebuild-helping")]
            exclusive: AtomicUsize::new(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_encoding() {
        assert!(!is_started(0));
        assert!(!is_finished(0));
        let started = Dirty::STARTED.bits();
        assert!(is_started(started) && !is_finished(started));
        let finished = sum_to_finished(12345);
        assert!(is_started(finished) && is_finished(finished));
        assert!(!is_marked_for_free(finished));
        assert_eq!(finished_to_sum(finished), 12345);
        let marked = finished | Dirty::MARKED_FOR_FREE.bits();
        assert!(is_marked_for_free(marked) && is_finished(marked));
        assert_eq!(finished_to_sum(marked), 12345);
    }

    #[test]
    fn node_key_cells() {
        let node = Node::<u64>::new(4, false);
        node.set_key(0, 10);
        node.set_key(1, 20);
        node.set_key(2, 30);
        assert_eq!(node.key(1), 20);
        node.set_min_key(10);
        node.set_max_key(30);
        assert_eq!(node.min_key(), 10);
        assert_eq!(node.max_key(), 30);
    }

    #[test]
    fn change_sum_plain_and_sharded() {
        let plain = Node::<u64>::new(2, false);
        let sharded = Node::<u64>::new(2, true);
        for _ in 0..100 {
            plain.increment_change_sum();
            sharded.increment_change_sum();
        }
        assert_eq!(plain.read_change_sum(), 100);
        assert_eq!(sharded.read_change_sum(), 100);
    }
}
