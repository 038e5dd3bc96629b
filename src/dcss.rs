//! Double-compare-single-swap.
//!
//! `dcss` atomically stores `new2` into `addr2` iff `*addr1 == expected1` and
//! `*addr2 == expected2`, following the two-phase descriptor scheme: the
//! descriptor is CAS-installed into `addr2`, the first comparison decides the
//! outcome, and a final CAS replaces the descriptor with either the new or
//! the old word. Any thread that reads a descriptor word out of a slot must
//! help it to completion before interpreting the slot, which `read` does.
//!
//! The failure modes are distinguished so that callers know whether to retry
//! locally (the slot moved) or from the root (the guarding word tripped).

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::{Guard, Owned, Pointer, Shared};

use crate::word;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DcssResult {
    Success,
    FailedAddr1,
    FailedAddr2,
}

const PENDING: usize = 0;
const SUCCEEDED: usize = 1;
const FAILED: usize = 2;

#[repr(align(8))]
struct Descriptor {
    addr1: *const AtomicUsize,
    expected1: usize,
    addr2: *const AtomicUsize,
    expected2: usize,
    new2: usize,
    status: AtomicUsize,
}

pub(crate) fn dcss(
    addr1: &AtomicUsize,
    expected1: usize,
    addr2: &AtomicUsize,
    expected2: usize,
    new2: usize,
    guard: &Guard,
) -> DcssResult {
    debug_assert!(!word::is_dcss(expected2) && !word::is_dcss(new2));
    let desc = Owned::new(Descriptor {
        addr1: addr1 as *const _,
        expected1,
        addr2: addr2 as *const _,
        expected2,
        new2,
        status: AtomicUsize::new(PENDING),
    })
    .into_usize();
    let desc_word = word::dcss_to_word(desc);

    loop {
        match addr2.compare_exchange(expected2, desc_word, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => break,
            Err(current) => {
                if word::is_dcss(current) {
                    help(current);
                    continue;
                }
                // The slot holds something else; the descriptor was never
                // published, so it can be freed right away.
                drop(unsafe { Owned::<Descriptor>::from_usize(desc) });
                return DcssResult::FailedAddr2;
            }
        }
    }

    let desc_ref = unsafe { &*(desc as *const Descriptor) };
    complete(desc_ref, desc_word);
    let outcome = if desc_ref.status.load(Ordering::Acquire) == SUCCEEDED {
        DcssResult::Success
    } else {
        DcssResult::FailedAddr1
    };
    unsafe { guard.defer_destroy(Shared::<Descriptor>::from_usize(desc)) };
    outcome
}

/// Reads a slot, helping any in-flight operation out of the way first. The
/// returned word never carries the descriptor tag.
pub(crate) fn read(slot: &AtomicUsize, _guard: &Guard) -> usize {
    loop {
        let w = slot.load(Ordering::Acquire);
        if word::is_dcss(w) {
            help(w);
            continue;
        }
        return w;
    }
}

/// Safe to call from any thread holding a guard: a descriptor is only retired
/// after it has been unlinked from its slot.
fn help(desc_word: usize) {
    let desc = unsafe { &*(word::word_to_raw(desc_word) as *const Descriptor) };
    complete(desc, desc_word);
}

fn complete(desc: &Descriptor, desc_word: usize) {
    let v1 = unsafe { &*desc.addr1 }.load(Ordering::SeqCst);
    let proposal = if v1 == desc.expected1 { SUCCEEDED } else { FAILED };
    let _ = desc
        .status
        .compare_exchange(PENDING, proposal, Ordering::SeqCst, Ordering::SeqCst);
    let replacement = if desc.status.load(Ordering::SeqCst) == SUCCEEDED {
        desc.new2
    } else {
        desc.expected2
    };
    let _ = unsafe { &*desc.addr2 }.compare_exchange(
        desc_word,
        replacement,
        Ordering::SeqCst,
        Ordering::SeqCst,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch::pin;
    use crossbeam_utils::thread;

    #[test]
    fn success_and_failure_modes() {
        let control = AtomicUsize::new(0);
        let slot = AtomicUsize::new(word::val_to_word(1));
        let guard = pin();

        let old = word::val_to_word(1);
        let new = word::val_to_word(2);
        assert_eq!(dcss(&control, 0, &slot, old, new, &guard), DcssResult::Success);
        assert_eq!(slot.load(Ordering::Relaxed), new);

        // stale expectation on the slot
        assert_eq!(
            dcss(&control, 0, &slot, old, word::val_to_word(3), &guard),
            DcssResult::FailedAddr2
        );
        assert_eq!(slot.load(Ordering::Relaxed), new);

        // the guarding word tripped; the slot must stay untouched
        control.store(7, Ordering::Relaxed);
        assert_eq!(
            dcss(&control, 0, &slot, new, word::val_to_word(4), &guard),
            DcssResult::FailedAddr1
        );
        assert_eq!(slot.load(Ordering::Relaxed), new);
    }

    #[test]
    fn concurrent_increments_agree() {
        const THREADS: usize = 8;
        const ATTEMPTS: usize = 2_000;
        let control = &AtomicUsize::new(0);
        let slot = &AtomicUsize::new(word::val_to_word(0));

        let total: usize = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(move |_| {
                        let mut successes = 0;
                        for _ in 0..ATTEMPTS {
                            let guard = pin();
                            let current = read(slot, &guard);
                            let bumped = word::val_to_word(word::word_to_val(current) + 1);
                            if dcss(control, 0, slot, current, bumped, &guard)
                                == DcssResult::Success
                            {
                                successes += 1;
                            }
                        }
                        successes
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        })
        .unwrap();

        let guard = pin();
        assert_eq!(word::word_to_val(read(slot, &guard)), total);
    }
}
