//! Library initialization, the reserved-signal handlers, thread creation,
//! and basic low-level routines.
//!
//! Initialization runs lazily on the first entry into any operation that
//! needs a registered descriptor. It has to happen on the initial thread
//! before any other thread exists: it fixes the boundary between the initial
//! thread's stack (above) and the thread stack segments (below), installs
//! the handlers for the two reserved signals (inherited across clone by
//! every thread), and blocks RESTART, which stays blocked in every thread
//! except inside suspension.

use crate::attr::{Attr, SchedPolicy};
use crate::cancel::{self, CancelType};
use crate::descriptor::{
    self, initial_thread_ptr, main_thread_ptr, manager_thread_ptr, thread_self, Pthread,
    StartRoutine, Thread, CANCELED, EXIT_CODE, EXIT_REQUESTED, INITIAL_THREAD_BOS,
    MAIN_THREAD, MANAGER_READER_FD, MANAGER_REQUEST_FD, STACK_SIZE,
};
use crate::join;
use crate::manager::{
    self, Request, RequestKind, MAIN_THREAD_EXITING, TERMINATED_CHILDREN,
};
use crate::restart::{suspend, SIG_CANCEL, SIG_RESTART};
use lazy_static::lazy_static;
use libc::{c_int, c_void};
use log::debug;
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow};
use nix::unistd;
use std::sync::atomic::Ordering;

lazy_static! {
    static ref LIBRARY_INIT: () = initialize();
}

/// Run one-time library initialization if it has not happened yet.
pub(crate) fn ensure_initialized() {
    lazy_static::initialize(&LIBRARY_INIT);
}

fn initialize() {
    // Reserve at least STACK_SIZE bytes of stack below the current frame for
    // the initial thread, and align on a STACK_SIZE boundary; everything
    // below belongs to thread stack segments.
    let frame = descriptor::current_stack_frame();
    let bos = (frame - 2 * STACK_SIZE) & !(STACK_SIZE - 1);

    let self_ = initial_thread_ptr();
    unsafe {
        (*self_)
            .pid
            .store(unistd::getpid().as_raw(), Ordering::Release);
        (*self_).nextlive.store(self_, Ordering::Release);
        (*self_).prevlive.store(self_, Ordering::Release);
    }
    MAIN_THREAD.store(self_, Ordering::Release);
    INITIAL_THREAD_BOS.store(bos, Ordering::Release);

    // Handlers for the reserved signals; signal dispositions are shared, so
    // every thread inherits these. SA_RESTART on the wake handler matters
    // only for the manager, whose select must keep running across child-exit
    // notices.
    unsafe {
        let restart_action = SigAction::new(
            SigHandler::Handler(restart_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let _ = signal::sigaction(SIG_RESTART, &restart_action);
        let cancel_action = SigAction::new(
            SigHandler::Handler(cancel_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let _ = signal::sigaction(SIG_CANCEL, &cancel_action);
    }

    // RESTART stays blocked everywhere outside suspension.
    let mut mask = SigSet::empty();
    mask.add(SIG_RESTART);
    let _ = signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None);

    // Kill all other threads when this process exits.
    unsafe {
        libc::atexit(process_exit_hook);
    }
    debug!("threading runtime initialized (stack boundary {:#x})", bos);
}

/// Handler for RESTART. For ordinary threads it records the delivery; for
/// the manager it doubles as the child-terminated notice. Also records the
/// arrival of any signal sigwait temporarily routes here.
pub(crate) extern "C" fn restart_handler(sig: c_int) {
    let self_ = thread_self();
    if self_ == manager_thread_ptr() {
        TERMINATED_CHILDREN.store(true, Ordering::Release);
    } else {
        unsafe {
            (*self_).last_signal.store(sig, Ordering::Relaxed);
        }
    }
}

/// Handler for CANCEL: exits the process on a pending process-wide exit,
/// exits the thread on a pending asynchronous cancellation, and otherwise
/// just returns — its delivery alone is what knocks a deferred-mode thread
/// out of a blocking call so the cancellation point can act.
extern "C" fn cancel_handler(_sig: c_int) {
    if EXIT_REQUESTED.load(Ordering::Acquire) {
        unsafe {
            libc::_exit(EXIT_CODE.load(Ordering::Acquire));
        }
    }
    let self_ = thread_self();
    unsafe {
        if cancel::cancellation_pending(self_)
            && (*self_).canceltype.load(Ordering::Relaxed) == CancelType::Asynchronous as u8
        {
            join::exit(CANCELED);
        }
    }
}

/// Create a new thread running `start(arg)`.
///
/// The heavy lifting happens in the manager: this posts a request carrying
/// the attributes, the start function, and the caller's signal mask (which
/// the new thread inherits), then sleeps until the manager reports back
/// through the caller's descriptor.
pub fn create(attr: Option<&Attr>, start: StartRoutine, arg: *mut c_void) -> Result<Thread, Errno> {
    ensure_initialized();
    if !manager::manager_running() {
        manager::start_manager()?;
    }
    let self_ = thread_self();
    let mut mask: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigprocmask(libc::SIG_SETMASK, std::ptr::null(), &mut mask);
    }
    manager::send_request(Request {
        sender: self_,
        kind: RequestKind::Create {
            attr: attr.copied().unwrap_or_default(),
            start,
            arg,
            mask,
        },
    });
    unsafe {
        suspend(self_);
        let code = (*self_).retcode.load(Ordering::Acquire);
        if code == 0 {
            Ok(Thread((*self_).retval.load(Ordering::Relaxed) as Pthread))
        } else {
            Err(Errno::from_i32(code))
        }
    }
}

/// Handle of the calling thread. Meaningful only on the initial thread and
/// on threads created by this library.
pub fn current() -> Thread {
    ensure_initialized();
    Thread(thread_self())
}

pub fn equal(a: Thread, b: Thread) -> bool {
    a == b
}

/// Change the scheduling policy and parameters of a live thread.
pub fn set_sched_param(
    th: Thread,
    policy: SchedPolicy,
    param: &libc::sched_param,
) -> Result<(), Errno> {
    let pid = unsafe { (*th.as_ptr()).pid.load(Ordering::Acquire) };
    if unsafe { libc::sched_setscheduler(pid, policy.as_raw(), param) } == -1 {
        let err = Errno::last();
        record_errno(err);
        return Err(err);
    }
    Ok(())
}

pub fn get_sched_param(th: Thread) -> Result<(SchedPolicy, libc::sched_param), Errno> {
    let pid = unsafe { (*th.as_ptr()).pid.load(Ordering::Acquire) };
    let raw_policy = unsafe { libc::sched_getscheduler(pid) };
    if raw_policy == -1 {
        let err = Errno::last();
        record_errno(err);
        return Err(err);
    }
    let mut param = libc::sched_param { sched_priority: 0 };
    if unsafe { libc::sched_getparam(pid, &mut param) } == -1 {
        let err = Errno::last();
        record_errno(err);
        return Err(err);
    }
    let policy = match raw_policy {
        libc::SCHED_FIFO => SchedPolicy::Fifo,
        libc::SCHED_RR => SchedPolicy::RoundRobin,
        _ => SchedPolicy::Other,
    };
    Ok((policy, param))
}

/// Process-wide exit request: every other thread is told to die, the caller
/// is woken to finish the exit itself. No-op while the manager is down (a
/// single-threaded process needs no coordination).
pub(crate) fn exit_process(code: i32) {
    if !manager::manager_running() {
        return;
    }
    let self_ = thread_self();
    manager::send_request(Request {
        sender: self_,
        kind: RequestKind::ProcessExit { code },
    });
    unsafe {
        suspend(self_);
    }
}

extern "C" fn process_exit_hook() {
    exit_process(0);
}

/// Reset the thread machinery after a fork: the forked thread becomes the
/// main thread of a process that has no manager and no siblings.
///
/// Stack segments of former siblings are left mapped; the forked thread may
/// hold pointers into them.
pub(crate) fn reset_main_thread() {
    let self_ = thread_self();
    manager::free_manager_stack();
    let request_fd = MANAGER_REQUEST_FD.swap(-1, Ordering::AcqRel);
    let reader_fd = MANAGER_READER_FD.swap(-1, Ordering::AcqRel);
    if request_fd >= 0 {
        let _ = unistd::close(request_fd);
    }
    if reader_fd >= 0 {
        let _ = unistd::close(reader_fd);
    }
    unsafe {
        (*self_)
            .pid
            .store(unistd::getpid().as_raw(), Ordering::Release);
        (*self_).nextlive.store(self_, Ordering::Release);
        (*self_).prevlive.store(self_, Ordering::Release);
    }
    MAIN_THREAD.store(self_, Ordering::Release);
    TERMINATED_CHILDREN.store(false, Ordering::Release);
    MAIN_THREAD_EXITING.store(false, Ordering::Release);
    debug!("thread machinery reset after fork");
}

/// Terminate every other thread and the manager, in preparation for exec.
/// The caller becomes the main thread again in case it changes its mind and
/// creates new threads instead.
pub fn kill_other_threads() {
    ensure_initialized();
    exit_process(0);
    reset_main_thread();
}

/// True when the calling thread is the main thread.
pub(crate) fn is_main_thread(th: Pthread) -> bool {
    th == main_thread_ptr()
}

/// Record the error of an implicit kernel call in the caller's errno slot.
pub(crate) fn record_errno(err: Errno) {
    let self_ = thread_self();
    unsafe {
        (*self_).errno.store(err as i32, Ordering::Relaxed);
    }
}

/// The calling thread's error slot for implicit kernel calls.
pub fn errno() -> i32 {
    ensure_initialized();
    unsafe { (*thread_self()).errno.load(Ordering::Relaxed) }
}

/// The calling thread's name-service error slot.
pub fn h_errno() -> i32 {
    ensure_initialized();
    unsafe { (*thread_self()).h_errno.load(Ordering::Relaxed) }
}
