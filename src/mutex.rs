//! Mutexes.
//!
//! A mutex is a spinlock-guarded count/owner pair with a FIFO queue of
//! suspended waiters. Wakeups are advisory: the unlocker restarts one waiter,
//! which re-runs the acquisition loop and may lose to a barging thread and
//! re-queue. The fast kind does no error checking: relocking from the owner
//! self-deadlocks and excess unlocks silently leave the mutex free.

use crate::descriptor::{thread_self, ThreadDescriptor};
use crate::queue::WaitQueue;
use crate::restart::{restart, suspend};
use crate::spinlock::SpinLock;
use crate::thread::ensure_initialized;
use nix::errno::Errno;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, Ordering};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MutexKind {
    /// No owner tracking; the default.
    Fast,
    /// Counted re-acquisition by the owning thread.
    Recursive,
}

pub struct Mutex {
    lock: SpinLock,
    kind: MutexKind,
    /// Zero iff unlocked; for the recursive kind, the acquisition depth.
    count: AtomicU32,
    /// Recursive kind only: the thread allowed to re-enter.
    owner: AtomicPtr<ThreadDescriptor>,
    waiting: UnsafeCell<WaitQueue>,
}

// SAFETY: the queue is only touched under `lock`; everything else is atomic.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    pub const fn new(kind: MutexKind) -> Mutex {
        Mutex {
            lock: SpinLock::new(),
            kind,
            count: AtomicU32::new(0),
            owner: AtomicPtr::new(ptr::null_mut()),
            waiting: UnsafeCell::new(WaitQueue::new()),
        }
    }

    pub const fn new_fast() -> Mutex {
        Mutex::new(MutexKind::Fast)
    }

    pub const fn new_recursive() -> Mutex {
        Mutex::new(MutexKind::Recursive)
    }

    pub fn kind(&self) -> MutexKind {
        self.kind
    }

    /// Acquire, suspending until available. Not a cancellation point.
    pub fn lock(&self) {
        loop {
            self.lock.acquire();
            if self.try_take_locked() {
                self.lock.release();
                return;
            }
            // Queue ourselves before releasing the spinlock so a wake sent
            // between release and suspend stays pending.
            ensure_initialized();
            let self_ = thread_self();
            unsafe {
                (*self.waiting.get()).enqueue(self_);
            }
            self.lock.release();
            unsafe {
                suspend(self_);
            }
        }
    }

    pub fn trylock(&self) -> Result<(), Errno> {
        self.lock.acquire();
        let taken = self.try_take_locked();
        self.lock.release();
        if taken {
            Ok(())
        } else {
            Err(Errno::EBUSY)
        }
    }

    /// Attempt the state transition. Caller holds the spinlock.
    fn try_take_locked(&self) -> bool {
        match self.kind {
            MutexKind::Fast => {
                if self.count.load(Ordering::Relaxed) == 0 {
                    self.count.store(1, Ordering::Relaxed);
                    true
                } else {
                    false
                }
            }
            MutexKind::Recursive => {
                ensure_initialized();
                let self_ = thread_self();
                let count = self.count.load(Ordering::Relaxed);
                if count == 0 || self.owner.load(Ordering::Relaxed) == self_ {
                    self.count.store(count + 1, Ordering::Relaxed);
                    self.owner.store(self_, Ordering::Relaxed);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn unlock(&self) {
        self.lock.acquire();
        match self.kind {
            MutexKind::Fast => {
                self.count.store(0, Ordering::Relaxed);
            }
            MutexKind::Recursive => {
                let count = self.count.load(Ordering::Relaxed);
                if count > 1 {
                    self.count.store(count - 1, Ordering::Relaxed);
                    self.lock.release();
                    return;
                }
                // Clamp so that excess unlocks do not break everything.
                self.count.store(0, Ordering::Relaxed);
                self.owner.store(ptr::null_mut(), Ordering::Relaxed);
            }
        }
        let woken = unsafe { (*self.waiting.get()).dequeue() };
        self.lock.release();
        if let Some(th) = woken {
            restart(th);
        }
    }

    pub fn destroy(&self) -> Result<(), Errno> {
        self.lock.acquire();
        let count = self.count.load(Ordering::Relaxed);
        self.lock.release();
        if count > 0 {
            return Err(Errno::EBUSY);
        }
        Ok(())
    }
}

/// One-shot initializer gate. The first caller runs `routine`; later callers
/// return immediately, without waiting for the first to finish.
pub struct Once {
    state: AtomicI32,
}

impl Once {
    pub const fn new() -> Once {
        Once {
            state: AtomicI32::new(0),
        }
    }

    pub fn call_once(&self, routine: fn()) {
        if self.state.swap(1, Ordering::AcqRel) == 0 {
            routine();
        }
    }
}

impl Default for Once {
    fn default() -> Once {
        Once::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trylock_then_unlock_restores_init_state() {
        let m = Mutex::new_fast();
        assert_eq!(m.trylock(), Ok(()));
        m.unlock();
        assert_eq!(m.count.load(Ordering::Relaxed), 0);
        assert_eq!(m.trylock(), Ok(()));
        m.unlock();
    }

    #[test]
    fn trylock_reports_busy() {
        let m = Mutex::new_fast();
        m.lock();
        assert_eq!(m.trylock(), Err(Errno::EBUSY));
        m.unlock();
        assert_eq!(m.trylock(), Ok(()));
        m.unlock();
    }

    #[test]
    fn destroy_held_mutex_is_busy() {
        let m = Mutex::new_fast();
        m.lock();
        assert_eq!(m.destroy(), Err(Errno::EBUSY));
        m.unlock();
        assert_eq!(m.destroy(), Ok(()));
    }

    #[test]
    fn excess_fast_unlock_leaves_mutex_free() {
        let m = Mutex::new_fast();
        m.unlock();
        assert_eq!(m.count.load(Ordering::Relaxed), 0);
        assert_eq!(m.trylock(), Ok(()));
        m.unlock();
    }

    #[test]
    fn once_runs_exactly_once() {
        use std::sync::atomic::AtomicUsize;
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn routine() {
            CALLS.fetch_add(1, Ordering::SeqCst);
        }
        let once = Once::new();
        once.call_once(routine);
        once.call_once(routine);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
