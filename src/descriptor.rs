//! The per-thread control block and the process-global runtime state.
//!
//! Every thread this library creates is a distinct kernel task whose stack
//! lives in a fixed-size, size-aligned segment. The descriptor sits at the
//! very top of that segment, which lets any code recover its own descriptor
//! from nothing but the stack pointer: mask the pointer up to the segment
//! boundary and step one descriptor back down. The initial thread and the
//! manager task do not live in segments; their descriptors are static and
//! are recognized by address-range checks instead.

use crate::cancel::CleanupBuffer;
use crate::spinlock::SpinLock;
use libc::c_void;
use static_assertions::const_assert;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU8, AtomicUsize, Ordering};

/// The size of one thread stack segment. Must be a power of two so the
/// descriptor can be recovered by masking a stack pointer, and a multiple of
/// the page size.
pub(crate) const STACK_SIZE: usize = 2 * 1024 * 1024;

/// Number of slots in the process-wide key table.
pub const KEYS_MAX: usize = 128;

const_assert!(STACK_SIZE.is_power_of_two());

/// The start function a new thread runs. The returned pointer is the value
/// reported to a joiner.
pub type StartRoutine = fn(*mut c_void) -> *mut c_void;

/// Distinguished return value reported to the joiner of a canceled thread.
/// Distinct from any legitimate thread result (no allocation occupies the
/// top of the address space).
pub const CANCELED: *mut c_void = usize::MAX as *mut c_void;

pub(crate) type Pthread = *mut ThreadDescriptor;

/// Per-thread control block.
///
/// Cross-thread mutable fields are atomics so a descriptor can be read from
/// signal handlers and foreign threads without tearing; compound updates
/// (terminate-and-read-joiner, detach checks) additionally serialize on
/// `lock`. The start-up parameter cells are written once by the manager
/// before the new task runs and read once by the start shim.
#[repr(C)]
pub struct ThreadDescriptor {
    /// Double chaining of active threads (the live ring).
    pub(crate) nextlive: AtomicPtr<ThreadDescriptor>,
    pub(crate) prevlive: AtomicPtr<ThreadDescriptor>,
    /// Next element in the one wait queue this thread currently sits on.
    /// The semaphore stores its encoded state word here while the thread is
    /// on a semaphore waiter list.
    pub(crate) next_waiting: AtomicPtr<ThreadDescriptor>,
    /// Kernel task id, for directed signals and scheduler calls.
    pub(crate) pid: AtomicI32,
    /// Guards compound updates of this descriptor's own fields.
    pub(crate) lock: SpinLock,
    /// Signal number most recently recorded by the library's handler.
    pub(crate) last_signal: AtomicI32,
    /// True once the thread has gone through its exit path.
    pub(crate) terminated: AtomicBool,
    /// True if the thread cannot be joined.
    pub(crate) detached: AtomicBool,
    /// True once the associated kernel task has been reaped.
    pub(crate) exited: AtomicBool,
    /// Result slot read by join.
    pub(crate) retval: AtomicPtr<c_void>,
    /// Result code slot written by the manager for create.
    pub(crate) retcode: AtomicI32,
    /// The unique thread currently blocked in join on this one, if any.
    pub(crate) joining: AtomicPtr<ThreadDescriptor>,
    /// Head of the per-thread cleanup-handler stack.
    pub(crate) cleanup: AtomicPtr<CleanupBuffer>,
    /// Cancellation controls; see `cancel`.
    pub(crate) cancelstate: AtomicU8,
    pub(crate) canceltype: AtomicU8,
    pub(crate) canceled: AtomicBool,
    /// Per-thread error slots for implicit kernel calls.
    pub(crate) errno: AtomicI32,
    pub(crate) h_errno: AtomicI32,
    /// Start-up parameters, written by the manager before clone.
    pub(crate) initial_fn: UnsafeCell<Option<StartRoutine>>,
    pub(crate) initial_arg: UnsafeCell<*mut c_void>,
    pub(crate) initial_mask: UnsafeCell<MaybeUninit<libc::sigset_t>>,
    /// Per-key values, parallel to the process-wide key table.
    pub(crate) specific: [AtomicPtr<c_void>; KEYS_MAX],
}

// The semaphore tags a descriptor address with its low bit; descriptors must
// never be odd-aligned.
const_assert!(std::mem::align_of::<ThreadDescriptor>() >= 2);
// The descriptor shares the initial stack mapping with the new thread's
// first frames; it must stay well under one page.
const_assert!(std::mem::size_of::<ThreadDescriptor>() <= 4096);

// SAFETY: every field mutated after publication is an atomic; the UnsafeCell
// start-up parameters are written before the owning task exists and read
// only by it.
unsafe impl Send for ThreadDescriptor {}
unsafe impl Sync for ThreadDescriptor {}

impl ThreadDescriptor {
    pub(crate) const fn new() -> ThreadDescriptor {
        const NULL_VALUE: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
        ThreadDescriptor {
            nextlive: AtomicPtr::new(ptr::null_mut()),
            prevlive: AtomicPtr::new(ptr::null_mut()),
            next_waiting: AtomicPtr::new(ptr::null_mut()),
            pid: AtomicI32::new(0),
            lock: SpinLock::new(),
            last_signal: AtomicI32::new(0),
            terminated: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            retval: AtomicPtr::new(ptr::null_mut()),
            retcode: AtomicI32::new(0),
            joining: AtomicPtr::new(ptr::null_mut()),
            cleanup: AtomicPtr::new(ptr::null_mut()),
            cancelstate: AtomicU8::new(0),
            canceltype: AtomicU8::new(0),
            canceled: AtomicBool::new(false),
            errno: AtomicI32::new(0),
            h_errno: AtomicI32::new(0),
            initial_fn: UnsafeCell::new(None),
            initial_arg: UnsafeCell::new(ptr::null_mut()),
            initial_mask: UnsafeCell::new(MaybeUninit::zeroed()),
            specific: [NULL_VALUE; KEYS_MAX],
        }
    }
}

/// Handle to a thread. Compares equal iff both handles designate the same
/// thread.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Thread(pub(crate) Pthread);

// SAFETY: the descriptor behind the handle is shared-state safe (see
// ThreadDescriptor); handles are meant to cross threads for join/cancel.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    pub(crate) fn as_ptr(self) -> Pthread {
        self.0
    }
}

/// Descriptor of the initial thread. Lives in static storage and is never
/// freed.
pub(crate) static INITIAL_THREAD: ThreadDescriptor = ThreadDescriptor::new();

/// Descriptor of the manager task; only the identity (address, pid) is used.
pub(crate) static MANAGER_THREAD: ThreadDescriptor = ThreadDescriptor::new();

/// Pointer to the main thread, the father of the manager task. Originally
/// the initial thread; changes after fork.
pub(crate) static MAIN_THREAD: AtomicPtr<ThreadDescriptor> = AtomicPtr::new(ptr::null_mut());

/// Limit between the stack of the initial thread (above) and the stacks of
/// other threads (below), aligned on a STACK_SIZE boundary. Zero until the
/// library has initialized, meaning the current thread is by definition the
/// initial thread.
pub(crate) static INITIAL_THREAD_BOS: AtomicUsize = AtomicUsize::new(0);

/// Limits of the manager task's stack.
pub(crate) static MANAGER_STACK_BOS: AtomicUsize = AtomicUsize::new(0);
pub(crate) static MANAGER_STACK_TOS: AtomicUsize = AtomicUsize::new(0);

/// Write end of the manager request pipe; -1 while the manager is not
/// running.
pub(crate) static MANAGER_REQUEST_FD: AtomicI32 = AtomicI32::new(-1);

/// Read end of the manager request pipe.
pub(crate) static MANAGER_READER_FD: AtomicI32 = AtomicI32::new(-1);

/// Pending request for a process-wide exit.
pub(crate) static EXIT_REQUESTED: AtomicBool = AtomicBool::new(false);
pub(crate) static EXIT_CODE: AtomicI32 = AtomicI32::new(0);

pub(crate) fn initial_thread_ptr() -> Pthread {
    &INITIAL_THREAD as *const ThreadDescriptor as Pthread
}

pub(crate) fn manager_thread_ptr() -> Pthread {
    &MANAGER_THREAD as *const ThreadDescriptor as Pthread
}

pub(crate) fn main_thread_ptr() -> Pthread {
    MAIN_THREAD.load(Ordering::Acquire)
}

/// Recover the calling thread's descriptor from the current stack pointer.
///
/// Anything at or above the initial-thread boundary is the initial thread;
/// the manager stack range is the manager; everything else is a thread stack
/// segment whose descriptor sits just below the next STACK_SIZE boundary.
pub(crate) fn thread_self() -> Pthread {
    let frame = current_stack_frame();
    let bos = INITIAL_THREAD_BOS.load(Ordering::Acquire);
    if bos == 0 || frame >= bos {
        return initial_thread_ptr();
    }
    let manager_bos = MANAGER_STACK_BOS.load(Ordering::Acquire);
    let manager_tos = MANAGER_STACK_TOS.load(Ordering::Acquire);
    if frame >= manager_bos && frame < manager_tos {
        return manager_thread_ptr();
    }
    let segment_top = (frame | (STACK_SIZE - 1)) + 1;
    (segment_top as Pthread).wrapping_sub(1)
}

/// Some address within the caller's current stack frame.
pub(crate) fn current_stack_frame() -> usize {
    let marker = 0u8;
    &marker as *const u8 as usize
}

/// Insert `th` into the live ring immediately after the main thread.
/// Manager only.
pub(crate) unsafe fn live_ring_insert(th: Pthread) {
    let main = main_thread_ptr();
    let after = (*main).nextlive.load(Ordering::Relaxed);
    (*th).prevlive.store(main, Ordering::Relaxed);
    (*th).nextlive.store(after, Ordering::Relaxed);
    (*after).prevlive.store(th, Ordering::Relaxed);
    (*main).nextlive.store(th, Ordering::Release);
}

/// Unlink `th` from the live ring. Manager only.
pub(crate) unsafe fn live_ring_remove(th: Pthread) {
    let next = (*th).nextlive.load(Ordering::Relaxed);
    let prev = (*th).prevlive.load(Ordering::Relaxed);
    (*next).prevlive.store(prev, Ordering::Relaxed);
    (*prev).nextlive.store(next, Ordering::Release);
}

/// True when the main thread is the only live thread.
pub(crate) unsafe fn live_ring_is_singleton() -> bool {
    let main = main_thread_ptr();
    (*main).nextlive.load(Ordering::Acquire) == main
}
