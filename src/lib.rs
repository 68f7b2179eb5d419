//! cthreads — a clone()-based user-space POSIX-style threading runtime for
//! Linux.
//!
//! Every thread is a distinct kernel task created with `clone`, sharing the
//! address space, filesystem state, file descriptors, and signal
//! dispositions of the whole process. Two reserved signals drive the
//! runtime: SIGUSR1 (restart) wakes suspended threads, SIGUSR2 (cancel)
//! delivers cancellation and process-exit notices. Applications must not
//! install handlers for either or touch their masks through the raw kernel
//! interface; [`sigmask`] is the portable alternative.
//!
//! Thread lifecycle (creation, descriptor release, process-wide exit) is
//! serialized by a dedicated manager task fed through a pipe; it is started
//! lazily on the first [`create`] and is not a user-visible thread.
//! Synchronization primitives never involve the manager — mutexes and
//! condition variables run on spinlock-guarded waiter queues, semaphores on
//! a single lock-free word, with peer-to-peer restart signals for wakeups.
//!
//! Threads created by this runtime must call into it rather than into the
//! host libc's threading; the two models do not mix. The handle returned by
//! [`current`] is only meaningful on the initial thread and on threads
//! created here, because a thread finds its own descriptor by masking its
//! stack pointer to the stack-segment boundary.

mod attr;
mod cancel;
mod condvar;
mod descriptor;
mod fork;
mod join;
mod libc_lock;
mod manager;
mod mutex;
mod queue;
mod restart;
mod semaphore;
mod signals;
mod specific;
mod spinlock;
mod thread;

pub use crate::attr::{Attr, DetachState, InheritSched, SchedPolicy, Scope};
pub use crate::cancel::{
    cancel, cleanup_pop, cleanup_pop_restore, cleanup_push, cleanup_push_defer, set_cancel_state,
    set_cancel_type, test_cancel, CancelState, CancelType, CleanupBuffer,
};
pub use crate::condvar::CondVar;
pub use crate::descriptor::{StartRoutine, Thread, CANCELED, KEYS_MAX};
pub use crate::fork::{at_fork, fork};
pub use crate::join::{detach, exit, join};
pub use crate::mutex::{Mutex, MutexKind, Once};
pub use crate::restart::{SIG_CANCEL, SIG_RESTART};
pub use crate::semaphore::{Semaphore, SEM_VALUE_MAX};
pub use crate::signals::{kill, sigmask, sigwait};
pub use crate::specific::{
    get_specific, key_create, key_delete, set_specific, Key, KeyDestructor,
};
pub use crate::thread::{
    create, current, equal, errno, get_sched_param, h_errno, kill_other_threads, set_sched_param,
};

pub use nix::errno::Errno;
pub use nix::sys::signal::{SigSet, SigmaskHow, Signal};
pub use nix::unistd::ForkResult;
