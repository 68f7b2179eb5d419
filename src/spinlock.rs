//! Spin locks.
//!
//! The lock word is a single machine word driven by atomic swap (the abstract
//! test-and-set). Contending acquirers yield the CPU between attempts rather
//! than burning it; every hold time in this crate is a handful of loads and
//! stores, so the next attempt usually succeeds.

use std::sync::atomic::{AtomicI32, Ordering};

pub(crate) struct SpinLock {
    locked: AtomicI32,
}

impl SpinLock {
    pub const fn new() -> SpinLock {
        SpinLock {
            locked: AtomicI32::new(0),
        }
    }

    /// Spin on test-and-set, yielding the CPU on every failed attempt.
    pub fn acquire(&self) {
        while self.locked.swap(1, Ordering::Acquire) != 0 {
            unsafe {
                libc::sched_yield();
            }
        }
    }

    pub fn release(&self) {
        self.locked.store(0, Ordering::Release);
    }
}
