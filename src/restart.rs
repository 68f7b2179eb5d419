//! Primitives for controlling thread execution: the suspend/restart protocol
//! on the two reserved signals.
//!
//! RESTART is blocked in every thread at all times except inside the
//! `sigsuspend`/`sigtimedwait` calls below. That is the whole trick: a wake
//! sent after a thread queued itself but before it suspends stays pending in
//! the kernel and makes the suspend return immediately, so no wake is ever
//! lost.

use crate::cancel;
use crate::descriptor::Pthread;
use libc::c_int;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::mem;
use std::ptr;
use std::sync::atomic::Ordering;

/// Wake-up signal, reserved for the library.
pub const SIG_RESTART: Signal = Signal::SIGUSR1;
/// Cancellation / process-exit notice, reserved for the library.
pub const SIG_CANCEL: Signal = Signal::SIGUSR2;

/// Send the wake-up signal to `th`'s kernel task. Losing the race against
/// the task's death is harmless.
pub(crate) fn restart(th: Pthread) {
    let pid = unsafe { (*th).pid.load(Ordering::Acquire) };
    let _ = signal::kill(Pid::from_raw(pid), SIG_RESTART);
}

/// The caller's signal mask with RESTART removed, i.e. the mask to sleep on.
unsafe fn suspend_mask() -> libc::sigset_t {
    let mut mask: libc::sigset_t = mem::zeroed();
    libc::sigprocmask(libc::SIG_SETMASK, ptr::null(), &mut mask);
    libc::sigdelset(&mut mask, SIG_RESTART as c_int);
    mask
}

/// Block until a RESTART is delivered. The caller must already sit on the
/// wait structure that will produce the wake.
pub(crate) unsafe fn suspend(self_: Pthread) {
    let mask = suspend_mask();
    (*self_).last_signal.store(0, Ordering::Relaxed);
    loop {
        libc::sigsuspend(&mask);
        if (*self_).last_signal.load(Ordering::Relaxed) == SIG_RESTART as i32 {
            break;
        }
    }
}

/// Like `suspend`, but also returns when cancellation is pending and
/// enabled: either detected before sleeping, or after the CANCEL handler
/// interrupted the sleep. Callers re-check cancellation afterwards; this is
/// what makes them cancellation points.
pub(crate) unsafe fn suspend_with_cancellation(self_: Pthread) {
    let mask = suspend_mask();
    (*self_).last_signal.store(0, Ordering::Relaxed);
    if cancel::cancellation_pending(self_) {
        return;
    }
    loop {
        libc::sigsuspend(&mask);
        if (*self_).last_signal.load(Ordering::Relaxed) == SIG_RESTART as i32 {
            break;
        }
        if cancel::cancellation_pending(self_) {
            break;
        }
    }
}

pub(crate) enum TimedSuspendOutcome {
    /// A RESTART arrived (possibly before the wait began; it was pending).
    Restarted,
    /// The full interval elapsed with no wake.
    TimedOut,
    /// Some other handled signal interrupted the wait, or cancellation was
    /// already pending on entry.
    Interrupted,
}

/// Wait for a RESTART for at most `reltime`, without ever unblocking it:
/// `sigtimedwait` consumes a pending or newly arriving RESTART directly, so
/// the pending-wake guarantee holds exactly as for `suspend`.
pub(crate) unsafe fn timed_suspend(
    self_: Pthread,
    reltime: &libc::timespec,
) -> TimedSuspendOutcome {
    (*self_).last_signal.store(0, Ordering::Relaxed);
    if cancel::cancellation_pending(self_) {
        return TimedSuspendOutcome::Interrupted;
    }
    let mut set: libc::sigset_t = mem::zeroed();
    libc::sigemptyset(&mut set);
    libc::sigaddset(&mut set, SIG_RESTART as c_int);
    let rc = libc::sigtimedwait(&set, ptr::null_mut(), reltime);
    if rc == SIG_RESTART as c_int {
        // Consumed without running the handler; record it ourselves.
        (*self_)
            .last_signal
            .store(SIG_RESTART as i32, Ordering::Relaxed);
        return TimedSuspendOutcome::Restarted;
    }
    match Errno::last() {
        Errno::EAGAIN => TimedSuspendOutcome::TimedOut,
        _ => TimedSuspendOutcome::Interrupted,
    }
}
