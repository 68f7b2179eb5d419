//! Signal operations.
//!
//! The two reserved signals are owned by the library, so the kernel-facing
//! mask operations are corrected before being forwarded: RESTART can never
//! end up unblocked outside suspension and CANCEL can never end up blocked.

use crate::cancel;
use crate::descriptor::{thread_self, Thread};
use crate::restart::{SIG_CANCEL, SIG_RESTART};
use crate::thread::{ensure_initialized, record_errno, restart_handler};
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::Pid;
use std::convert::TryFrom;
use std::sync::atomic::Ordering;

fn errno_of(err: nix::Error) -> Errno {
    err.as_errno().unwrap_or(Errno::UnknownErrno)
}

/// The mask actually handed to the kernel for a given request.
pub(crate) fn corrected_mask(how: SigmaskHow, requested: &SigSet) -> SigSet {
    let mut mask = *requested;
    match how {
        SigmaskHow::SIG_SETMASK => {
            mask.add(SIG_RESTART);
            mask.remove(SIG_CANCEL);
        }
        SigmaskHow::SIG_BLOCK => {
            mask.remove(SIG_CANCEL);
        }
        SigmaskHow::SIG_UNBLOCK => {
            mask.remove(SIG_RESTART);
        }
    }
    mask
}

/// Examine or change the calling thread's signal mask, preserving the
/// library's claim on the reserved signals.
pub fn sigmask(
    how: SigmaskHow,
    newmask: &SigSet,
    oldmask: Option<&mut SigSet>,
) -> Result<(), Errno> {
    ensure_initialized();
    let mask = corrected_mask(how, newmask);
    signal::sigprocmask(how, Some(&mask), oldmask).map_err(|err| {
        let err = errno_of(err);
        record_errno(err);
        err
    })
}

/// Send `sig` to the kernel task behind `th`.
pub fn kill(th: Thread, sig: Signal) -> Result<(), Errno> {
    ensure_initialized();
    let pid = unsafe { (*th.as_ptr()).pid.load(Ordering::Acquire) };
    signal::kill(Pid::from_raw(pid), sig).map_err(|err| {
        let err = errno_of(err);
        record_errno(err);
        err
    })
}

/// Wait for one of the signals in `set`, which the caller must already have
/// blocked, and report which one arrived. A cancellation point.
///
/// The library's recording handler is installed for every signal in the set
/// for the duration of the wait and the previous dispositions are restored
/// afterwards.
pub fn sigwait(set: &SigSet) -> Result<Signal, Errno> {
    ensure_initialized();
    let self_ = thread_self();

    // Sleep on everything blocked except the requested signals and CANCEL.
    let mut mask: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigfillset(&mut mask);
        libc::sigdelset(&mut mask, SIG_CANCEL as libc::c_int);
    }
    let mut saved: Vec<(Signal, SigAction)> = Vec::new();
    let recording = SigAction::new(
        SigHandler::Handler(restart_handler),
        SaFlags::empty(),
        SigSet::all(),
    );
    for sig in Signal::iterator() {
        if set.contains(sig) && sig != SIG_CANCEL {
            unsafe {
                libc::sigdelset(&mut mask, sig as libc::c_int);
            }
            if let Ok(previous) = unsafe { signal::sigaction(sig, &recording) } {
                saved.push((sig, previous));
            }
        }
    }

    unsafe {
        (*self_).last_signal.store(0, Ordering::Relaxed);
        while !cancel::cancellation_pending(self_) {
            libc::sigsuspend(&mask);
            if (*self_).last_signal.load(Ordering::Relaxed) != 0 {
                break;
            }
        }
    }

    // The signals are reblocked on return from sigsuspend; restore the
    // dispositions we displaced.
    for (sig, previous) in saved {
        unsafe {
            let _ = signal::sigaction(sig, &previous);
        }
    }
    cancel::test_cancel();

    let raw = unsafe { (*self_).last_signal.load(Ordering::Relaxed) };
    Signal::try_from(raw).map_err(|_| Errno::EINVAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setmask_keeps_restart_blocked_and_cancel_open() {
        let mut requested = SigSet::empty();
        requested.add(SIG_CANCEL);
        let mask = corrected_mask(SigmaskHow::SIG_SETMASK, &requested);
        assert!(mask.contains(SIG_RESTART));
        assert!(!mask.contains(SIG_CANCEL));
    }

    #[test]
    fn block_strips_cancel() {
        let mut requested = SigSet::empty();
        requested.add(SIG_CANCEL);
        requested.add(Signal::SIGTERM);
        let mask = corrected_mask(SigmaskHow::SIG_BLOCK, &requested);
        assert!(!mask.contains(SIG_CANCEL));
        assert!(mask.contains(Signal::SIGTERM));
    }

    #[test]
    fn unblock_strips_restart() {
        let mut requested = SigSet::empty();
        requested.add(SIG_RESTART);
        requested.add(Signal::SIGTERM);
        let mask = corrected_mask(SigmaskHow::SIG_UNBLOCK, &requested);
        assert!(!mask.contains(SIG_RESTART));
        assert!(mask.contains(Signal::SIGTERM));
    }
}
