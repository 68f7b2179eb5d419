//! Condition variables.
//!
//! A condition variable is a spinlock plus a FIFO queue of waiters. The
//! signaller dequeues before restarting — that order is what lets a timed
//! waiter distinguish "still queued, so I timed out" from "already dequeued,
//! so a wake is in flight".

use crate::cancel;
use crate::descriptor::{thread_self, CANCELED};
use crate::join;
use crate::mutex::Mutex;
use crate::queue::WaitQueue;
use crate::restart::{
    restart, suspend_with_cancellation, timed_suspend, TimedSuspendOutcome,
};
use crate::spinlock::SpinLock;
use crate::thread::ensure_initialized;
use nix::errno::Errno;
use std::cell::UnsafeCell;
use std::ptr;

pub struct CondVar {
    lock: SpinLock,
    waiting: UnsafeCell<WaitQueue>,
}

// SAFETY: the queue is only touched under `lock`.
unsafe impl Send for CondVar {}
unsafe impl Sync for CondVar {}

impl CondVar {
    pub const fn new() -> CondVar {
        CondVar {
            lock: SpinLock::new(),
            waiting: UnsafeCell::new(WaitQueue::new()),
        }
    }

    /// Atomically release `mutex` and wait to be signalled; reacquires
    /// `mutex` before returning. A cancellation point: a canceled waiter
    /// takes itself off the queue and exits holding `mutex` (its cleanup
    /// handlers are expected to release it).
    pub fn wait(&self, mutex: &Mutex) {
        ensure_initialized();
        let self_ = thread_self();
        self.lock.acquire();
        unsafe {
            (*self.waiting.get()).enqueue(self_);
        }
        self.lock.release();
        mutex.unlock();
        unsafe {
            suspend_with_cancellation(self_);
        }
        mutex.lock();
        unsafe {
            if cancel::cancellation_pending(self_) {
                // The signaller may have dequeued us concurrently; removal
                // is a no-op then.
                self.lock.acquire();
                (*self.waiting.get()).remove(self_);
                self.lock.release();
                join::exit(CANCELED);
            }
        }
    }

    /// Like `wait`, bounded by an absolute deadline (realtime clock).
    /// Returns `ETIMEDOUT` once the deadline passes, `EINTR` if a foreign
    /// signal cut the wait short.
    pub fn timedwait(&self, mutex: &Mutex, abstime: &libc::timespec) -> Result<(), Errno> {
        ensure_initialized();
        let self_ = thread_self();

        // The deadline is absolute; the sleep primitive wants an interval.
        let mut now = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        unsafe {
            libc::gettimeofday(&mut now, ptr::null_mut());
        }
        let mut reltime = libc::timespec {
            tv_sec: abstime.tv_sec - now.tv_sec,
            tv_nsec: abstime.tv_nsec - now.tv_usec * 1000,
        };
        if reltime.tv_nsec < 0 {
            reltime.tv_nsec += 1_000_000_000;
            reltime.tv_sec -= 1;
        }
        if reltime.tv_sec < 0 {
            return Err(Errno::ETIMEDOUT);
        }

        self.lock.acquire();
        unsafe {
            (*self.waiting.get()).enqueue(self_);
        }
        self.lock.release();
        mutex.unlock();

        let outcome = unsafe { timed_suspend(self_, &reltime) };

        self.lock.acquire();
        unsafe {
            if cancel::cancellation_pending(self_) {
                (*self.waiting.get()).remove(self_);
                self.lock.release();
                mutex.lock();
                join::exit(CANCELED);
            }
        }
        match outcome {
            TimedSuspendOutcome::Restarted => {
                // The signaller dequeued us before sending the wake.
                self.lock.release();
                mutex.lock();
                Ok(())
            }
            TimedSuspendOutcome::TimedOut | TimedSuspendOutcome::Interrupted => {
                let found = unsafe { (*self.waiting.get()).remove(self_) };
                self.lock.release();
                mutex.lock();
                if !found {
                    // Someone was signalling concurrently: we were already
                    // dequeued and the wake is pending. Count it as a
                    // signal, not a timeout.
                    return Ok(());
                }
                match outcome {
                    TimedSuspendOutcome::TimedOut => Err(Errno::ETIMEDOUT),
                    _ => Err(Errno::EINTR),
                }
            }
        }
    }

    /// Wake one waiter, if any.
    pub fn signal(&self) {
        self.lock.acquire();
        let woken = unsafe { (*self.waiting.get()).dequeue() };
        self.lock.release();
        if let Some(th) = woken {
            restart(th);
        }
    }

    /// Wake every waiter. The queue is spliced out whole under the spinlock
    /// and the wakes sent outside it.
    pub fn broadcast(&self) {
        self.lock.acquire();
        let mut to_signal = unsafe { (*self.waiting.get()).take() };
        self.lock.release();
        while let Some(th) = unsafe { to_signal.dequeue() } {
            restart(th);
        }
    }

    /// Refused while any waiter is enqueued.
    pub fn destroy(&self) -> Result<(), Errno> {
        self.lock.acquire();
        let busy = unsafe { !(*self.waiting.get()).is_empty() };
        self.lock.release();
        if busy {
            return Err(Errno::EBUSY);
        }
        Ok(())
    }
}

impl Default for CondVar {
    fn default() -> CondVar {
        CondVar::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroy_idle_condvar() {
        let cv = CondVar::new();
        assert_eq!(cv.destroy(), Ok(()));
    }

    #[test]
    fn signal_and_broadcast_with_no_waiters_are_noops() {
        let cv = CondVar::new();
        cv.signal();
        cv.broadcast();
        assert_eq!(cv.destroy(), Ok(()));
    }
}
