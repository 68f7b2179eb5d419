//! Thread cancellation: the per-thread state machine, the cleanup-handler
//! stack, and the cancellation points scattered through the blocking
//! operations.
//!
//! Requesting cancellation latches a pending flag on the target and sends it
//! the CANCEL signal. The signal only serves to wake the target promptly; a
//! deferred-mode thread acts on the flag at its next cancellation point, an
//! asynchronous-mode thread exits straight from the handler.

use crate::descriptor::{thread_self, Pthread, Thread, CANCELED};
use crate::join;
use crate::restart::SIG_CANCEL;
use crate::thread::ensure_initialized;
use libc::c_void;
use nix::sys::signal;
use nix::unistd::Pid;
use std::ptr;
use std::sync::atomic::Ordering;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum CancelState {
    Enable = 0,
    Disable = 1,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum CancelType {
    Deferred = 0,
    Asynchronous = 1,
}

fn state_from_u8(raw: u8) -> CancelState {
    if raw == CancelState::Disable as u8 {
        CancelState::Disable
    } else {
        CancelState::Enable
    }
}

fn type_from_u8(raw: u8) -> CancelType {
    if raw == CancelType::Asynchronous as u8 {
        CancelType::Asynchronous
    } else {
        CancelType::Deferred
    }
}

/// The predicate every cancellation point tests.
pub(crate) unsafe fn cancellation_pending(th: Pthread) -> bool {
    (*th).canceled.load(Ordering::Relaxed)
        && (*th).cancelstate.load(Ordering::Relaxed) == CancelState::Enable as u8
}

unsafe fn exit_if_async_cancel(self_: Pthread) {
    if cancellation_pending(self_)
        && (*self_).canceltype.load(Ordering::Relaxed) == CancelType::Asynchronous as u8
    {
        join::exit(CANCELED);
    }
}

/// Switch the calling thread's cancellability; returns the previous state.
/// A cancellation point: enabling with a request pending in asynchronous
/// mode terminates the caller.
pub fn set_cancel_state(state: CancelState) -> CancelState {
    ensure_initialized();
    let self_ = thread_self();
    unsafe {
        let old = state_from_u8((*self_).cancelstate.swap(state as u8, Ordering::Relaxed));
        exit_if_async_cancel(self_);
        old
    }
}

/// Switch the calling thread's cancellation type; returns the previous type.
/// A cancellation point, as for `set_cancel_state`.
pub fn set_cancel_type(ty: CancelType) -> CancelType {
    ensure_initialized();
    let self_ = thread_self();
    unsafe {
        let old = type_from_u8((*self_).canceltype.swap(ty as u8, Ordering::Relaxed));
        exit_if_async_cancel(self_);
        old
    }
}

/// Request cancellation of `th`. Whether and when the target acts on it is
/// governed entirely by the target's own state and type.
pub fn cancel(th: Thread) {
    ensure_initialized();
    let target = th.as_ptr();
    unsafe {
        (*target).canceled.store(true, Ordering::Release);
        let pid = (*target).pid.load(Ordering::Acquire);
        let _ = signal::kill(Pid::from_raw(pid), SIG_CANCEL);
    }
}

/// Explicit cancellation point.
pub fn test_cancel() {
    ensure_initialized();
    let self_ = thread_self();
    unsafe {
        if cancellation_pending(self_) {
            join::exit(CANCELED);
        }
    }
}

/// One record on the per-thread cleanup stack. Lives in the caller's frame
/// between a push and its matching pop.
pub struct CleanupBuffer {
    routine: fn(*mut c_void),
    arg: *mut c_void,
    saved_canceltype: u8,
    prev: *mut CleanupBuffer,
}

impl CleanupBuffer {
    pub fn new(routine: fn(*mut c_void), arg: *mut c_void) -> CleanupBuffer {
        CleanupBuffer {
            routine,
            arg,
            saved_canceltype: 0,
            prev: ptr::null_mut(),
        }
    }
}

/// Link `buffer` onto the calling thread's cleanup stack.
///
/// # Safety
///
/// `buffer` must outlive its time on the stack and be removed by the
/// matching pop in the same frame, pushes and pops strictly nested.
pub unsafe fn cleanup_push(buffer: *mut CleanupBuffer) {
    ensure_initialized();
    let self_ = thread_self();
    (*buffer).prev = (*self_).cleanup.load(Ordering::Relaxed);
    (*self_).cleanup.store(buffer, Ordering::Relaxed);
}

/// Unlink the top record; run its routine when `execute` is set.
///
/// # Safety
///
/// `buffer` must be the record pushed by the matching `cleanup_push`.
pub unsafe fn cleanup_pop(buffer: *mut CleanupBuffer, execute: bool) {
    let self_ = thread_self();
    if execute {
        ((*buffer).routine)((*buffer).arg);
    }
    (*self_).cleanup.store((*buffer).prev, Ordering::Relaxed);
}

/// Push variant that additionally saves the cancellation type and forces
/// deferred mode for the duration of the region.
///
/// # Safety
///
/// As for `cleanup_push`, paired with `cleanup_pop_restore`.
pub unsafe fn cleanup_push_defer(buffer: *mut CleanupBuffer) {
    ensure_initialized();
    let self_ = thread_self();
    (*buffer).saved_canceltype = (*self_).canceltype.load(Ordering::Relaxed);
    (*buffer).prev = (*self_).cleanup.load(Ordering::Relaxed);
    (*self_)
        .canceltype
        .store(CancelType::Deferred as u8, Ordering::Relaxed);
    (*self_).cleanup.store(buffer, Ordering::Relaxed);
}

/// Pop variant matching `cleanup_push_defer`: restores the saved type and
/// re-tests cancellation. A cancellation point.
///
/// # Safety
///
/// As for `cleanup_pop`.
pub unsafe fn cleanup_pop_restore(buffer: *mut CleanupBuffer, execute: bool) {
    let self_ = thread_self();
    if execute {
        ((*buffer).routine)((*buffer).arg);
    }
    (*self_).cleanup.store((*buffer).prev, Ordering::Relaxed);
    (*self_)
        .canceltype
        .store((*buffer).saved_canceltype, Ordering::Relaxed);
    exit_if_async_cancel(self_);
}

/// Run the whole cleanup stack, top-down. Called on the exit path.
pub(crate) unsafe fn perform_cleanup(self_: Pthread) {
    let mut cursor = (*self_).cleanup.load(Ordering::Relaxed);
    while !cursor.is_null() {
        ((*cursor).routine)((*cursor).arg);
        cursor = (*cursor).prev;
    }
}
