//! Thread termination and joining.

use crate::cancel;
use crate::descriptor::{thread_self, Thread, CANCELED};
use crate::manager::{self, Request, RequestKind};
use crate::restart::{restart, suspend, suspend_with_cancellation};
use crate::specific;
use crate::thread::{ensure_initialized, is_main_thread};
use libc::c_void;
use nix::errno::Errno;
use std::ptr;
use std::sync::atomic::Ordering;

/// Terminate the calling thread with `retval` as the value reported to its
/// joiner.
///
/// Runs the cleanup stack and the key destructors, publishes the result,
/// wakes the joiner if one is already waiting, and exits the kernel task.
/// The main thread instead parks until every other thread has terminated;
/// the manager wakes it once the live ring is down to one.
pub fn exit(retval: *mut c_void) -> ! {
    ensure_initialized();
    let self_ = thread_self();
    unsafe {
        // Reset the cancellation flag first: cleanup handlers may cross
        // cancellation points, and those must not re-enter the exit.
        (*self_).canceled.store(false, Ordering::Relaxed);
        cancel::perform_cleanup(self_);
        specific::destroy_specifics(self_);

        (*self_).lock.acquire();
        (*self_).retval.store(retval, Ordering::Relaxed);
        (*self_).terminated.store(true, Ordering::Release);
        let joining = (*self_).joining.load(Ordering::Relaxed);
        (*self_).lock.release();
        if !joining.is_null() {
            restart(joining);
        }

        if is_main_thread(self_) && manager::manager_running() {
            manager::send_request(Request {
                sender: self_,
                kind: RequestKind::MainThreadExit,
            });
            suspend(self_);
        }

        // Exit the kernel task without flushing stdio or running atexit
        // handlers; those belong to whole-process exit.
        libc::_exit(0)
    }
}

/// Wait for `th` to terminate and collect its return value. A cancellation
/// point. The target's resources are handed to the manager for release.
pub fn join(th: Thread) -> Result<*mut c_void, Errno> {
    ensure_initialized();
    let self_ = thread_self();
    let target = th.as_ptr();
    if target == self_ {
        return Err(Errno::EDEADLK);
    }
    unsafe {
        (*target).lock.acquire();
        if (*target).detached.load(Ordering::Relaxed)
            || !(*target).joining.load(Ordering::Relaxed).is_null()
        {
            (*target).lock.release();
            return Err(Errno::EINVAL);
        }
        if !(*target).terminated.load(Ordering::Relaxed) {
            (*target).joining.store(self_, Ordering::Relaxed);
            (*target).lock.release();
            suspend_with_cancellation(self_);
            (*target).lock.acquire();
            if cancel::cancellation_pending(self_) {
                (*target).joining.store(ptr::null_mut(), Ordering::Relaxed);
                (*target).lock.release();
                exit(CANCELED);
            }
        }
        let retval = (*target).retval.load(Ordering::Relaxed);
        (*target).lock.release();
        if manager::manager_running() {
            manager::send_request(Request {
                sender: self_,
                kind: RequestKind::Free { thread: target },
            });
        }
        Ok(retval)
    }
}

/// Make `th` reclaim its resources on termination instead of awaiting a
/// join. Detaching a thread someone is already joining is a no-op; the
/// joiner owns the release.
pub fn detach(th: Thread) -> Result<(), Errno> {
    ensure_initialized();
    let target = th.as_ptr();
    unsafe {
        (*target).lock.acquire();
        if (*target).detached.load(Ordering::Relaxed) {
            (*target).lock.release();
            return Err(Errno::EINVAL);
        }
        if !(*target).joining.load(Ordering::Relaxed).is_null() {
            (*target).lock.release();
            return Ok(());
        }
        (*target).detached.store(true, Ordering::Relaxed);
        let terminated = (*target).terminated.load(Ordering::Relaxed);
        (*target).lock.release();
        if terminated && manager::manager_running() {
            manager::send_request(Request {
                sender: thread_self(),
                kind: RequestKind::Free { thread: target },
            });
        }
        Ok(())
    }
}
