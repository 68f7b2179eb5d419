//! Waiting queues: FIFO lists of thread descriptors chained through the
//! in-descriptor `next_waiting` pointer. A descriptor sits on at most one
//! queue at a time. Callers serialize access with the owning primitive's
//! spinlock.

use crate::descriptor::Pthread;
use std::ptr;
use std::sync::atomic::Ordering;

pub(crate) struct WaitQueue {
    head: Pthread,
    tail: Pthread,
}

impl WaitQueue {
    pub const fn new() -> WaitQueue {
        WaitQueue {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub unsafe fn enqueue(&mut self, th: Pthread) {
        debug_assert!((*th).next_waiting.load(Ordering::Relaxed).is_null());
        (*th).next_waiting.store(ptr::null_mut(), Ordering::Relaxed);
        if self.tail.is_null() {
            self.head = th;
            self.tail = th;
        } else {
            (*self.tail).next_waiting.store(th, Ordering::Relaxed);
            self.tail = th;
        }
    }

    pub unsafe fn dequeue(&mut self) -> Option<Pthread> {
        let th = self.head;
        if th.is_null() {
            return None;
        }
        self.head = (*th).next_waiting.load(Ordering::Relaxed);
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        (*th).next_waiting.store(ptr::null_mut(), Ordering::Relaxed);
        Some(th)
    }

    /// Remove `th` wherever it sits, preserving the order of the others.
    /// Returns whether `th` was present; absence is a legitimate outcome
    /// when a signaller dequeued it concurrently.
    pub unsafe fn remove(&mut self, th: Pthread) -> bool {
        if self.head.is_null() {
            return false;
        }
        if self.head == th {
            self.head = (*th).next_waiting.load(Ordering::Relaxed);
            if self.head.is_null() {
                self.tail = ptr::null_mut();
            }
            (*th).next_waiting.store(ptr::null_mut(), Ordering::Relaxed);
            return true;
        }
        let mut cursor = self.head;
        loop {
            let next = (*cursor).next_waiting.load(Ordering::Relaxed);
            if next.is_null() {
                return false;
            }
            if next == th {
                let after = (*th).next_waiting.load(Ordering::Relaxed);
                (*cursor).next_waiting.store(after, Ordering::Relaxed);
                if after.is_null() {
                    self.tail = cursor;
                }
                (*th).next_waiting.store(ptr::null_mut(), Ordering::Relaxed);
                return true;
            }
            cursor = next;
        }
    }

    /// Splice the whole queue out into a fresh one, leaving this one empty.
    pub fn take(&mut self) -> WaitQueue {
        let taken = WaitQueue {
            head: self.head,
            tail: self.tail,
        };
        self.head = ptr::null_mut();
        self.tail = ptr::null_mut();
        taken
    }
}
