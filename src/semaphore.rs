//! Counting semaphores, POSIX 1003.1b style.
//!
//! The whole semaphore is one machine word. A count of N is encoded as
//! 2N+1 (low bit set); when threads are blocked, the word instead holds the
//! address of the most recently blocked waiter (low bit clear, descriptors
//! being pointer-aligned), chained through `next_waiting` down to the
//! sentinel 1 — the "count zero, no waiters" encoding. A semaphore
//! initialized to N walks through
//!
//!   2N+1, 2N-1, ..., 3, 1, &first_waiter, &second_waiter, ...
//!
//! under successive waits. All transitions are compare-and-swap; no lock.

use crate::cancel;
use crate::descriptor::{thread_self, Pthread, CANCELED};
use crate::join;
use crate::restart::{restart, suspend_with_cancellation};
use crate::thread::ensure_initialized;
use nix::errno::Errno;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const SEM_VALUE_MAX: usize = i32::max_value() as usize;

/// The count-zero-no-waiters state.
const SENTINEL: usize = 1;

pub struct Semaphore {
    state: AtomicUsize,
}

impl Semaphore {
    pub fn new(value: usize) -> Result<Semaphore, Errno> {
        if value > SEM_VALUE_MAX {
            return Err(Errno::EINVAL);
        }
        Ok(Semaphore {
            state: AtomicUsize::new((value << 1) + 1),
        })
    }

    /// Decrement, blocking while the count is zero. A cancellation point.
    pub fn wait(&self) {
        ensure_initialized();
        let self_ = thread_self();
        loop {
            let mut new;
            loop {
                let old = self.state.load(Ordering::Acquire);
                if old & 1 == 1 && old != SENTINEL {
                    new = old - 2;
                } else {
                    // Push ourselves as the new list head, stashing the old
                    // state (previous head or the sentinel) in our link.
                    new = self_ as usize;
                    unsafe {
                        (*self_)
                            .next_waiting
                            .store(old as Pthread, Ordering::Relaxed);
                    }
                }
                if self
                    .state
                    .compare_exchange(old, new, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
            if new & 1 == 1 {
                // We consumed a count.
                return;
            }
            unsafe {
                suspend_with_cancellation(self_);
                if cancel::cancellation_pending(self_) {
                    self.unlink_canceled(self_);
                    join::exit(CANCELED);
                }
            }
            // Woken by a post: race the other waiters for the fresh count.
        }
    }

    /// Take the canceled caller off the waiter list. There is a benign race
    /// with post here: the net result is only that the caller is no longer
    /// reachable from the state word by the time it exits.
    unsafe fn unlink_canceled(&self, self_: Pthread) {
        let mut old;
        loop {
            old = self.state.load(Ordering::Acquire);
            if old != self_ as usize {
                break;
            }
            let new = (*self_).next_waiting.load(Ordering::Relaxed) as usize;
            if self
                .state
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // We were the head and popped ourselves.
                (*self_).next_waiting.store(ptr::null_mut(), Ordering::Relaxed);
                return;
            }
        }
        if old & 1 == 0 {
            // Somewhere inside the list: splice ourselves out.
            let mut cursor = &(*(old as Pthread)).next_waiting;
            loop {
                let next = cursor.load(Ordering::Relaxed);
                if next as usize == SENTINEL || next.is_null() {
                    return;
                }
                if next == self_ {
                    cursor.store((*self_).next_waiting.load(Ordering::Relaxed), Ordering::Relaxed);
                    (*self_).next_waiting.store(ptr::null_mut(), Ordering::Relaxed);
                    return;
                }
                cursor = &(*next).next_waiting;
            }
        }
    }

    /// Decrement without blocking.
    pub fn trywait(&self) -> Result<(), Errno> {
        loop {
            let old = self.state.load(Ordering::Acquire);
            if old & 1 == 0 || old == SENTINEL {
                return Err(Errno::EAGAIN);
            }
            if self
                .state
                .compare_exchange(old, old - 2, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Increment. If threads were blocked, deposit a single count and wake
    /// the whole list; the woken threads race to consume it and the losers
    /// re-block.
    pub fn post(&self) -> Result<(), Errno> {
        loop {
            let old = self.state.load(Ordering::Acquire);
            let new = if old & 1 == 0 {
                3
            } else {
                if old >= SEM_VALUE_MAX {
                    return Err(Errno::ERANGE);
                }
                old + 2
            };
            if self
                .state
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                if old & 1 == 0 {
                    // The swapped-out word was the waiter list; it is ours
                    // alone now.
                    let mut th = old as Pthread;
                    while th as usize != SENTINEL {
                        unsafe {
                            let next = (*th).next_waiting.swap(ptr::null_mut(), Ordering::Relaxed);
                            restart(th);
                            th = next;
                        }
                    }
                }
                return Ok(());
            }
        }
    }

    /// The exposed count: zero whenever waiters are blocked.
    pub fn value(&self) -> usize {
        let state = self.state.load(Ordering::Acquire);
        if state & 1 == 1 {
            state >> 1
        } else {
            0
        }
    }

    /// Refused while waiters are present.
    pub fn destroy(&self) -> Result<(), Errno> {
        if self.state.load(Ordering::Acquire) & 1 == 0 {
            return Err(Errno::EBUSY);
        }
        Ok(())
    }
}
