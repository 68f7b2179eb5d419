//! Fork integration.
//!
//! Registered handler chains run around the kernel fork: prepare handlers in
//! reverse registration order before, parent and child handlers in
//! registration order after. The child comes back single-threaded: the live
//! ring collapses to the forking thread, the manager pipe is closed, and the
//! manager state is cleared so it is recreated on the next thread creation.

use crate::mutex::Mutex;
use crate::thread::{ensure_initialized, reset_main_thread};
use nix::errno::Errno;
use nix::unistd::{ForkResult, Pid};
use std::cell::UnsafeCell;

struct ForkHandlers {
    prepare: Vec<fn()>,
    parent: Vec<fn()>,
    child: Vec<fn()>,
}

struct AtforkRegistry {
    lock: Mutex,
    handlers: UnsafeCell<ForkHandlers>,
}

// SAFETY: the handler lists are only touched under `lock`.
unsafe impl Sync for AtforkRegistry {}

static REGISTRY: AtforkRegistry = AtforkRegistry {
    lock: Mutex::new_fast(),
    handlers: UnsafeCell::new(ForkHandlers {
        prepare: Vec::new(),
        parent: Vec::new(),
        child: Vec::new(),
    }),
};

/// Register fork handlers. Each of the three slots may independently be
/// absent.
pub fn at_fork(
    prepare: Option<fn()>,
    parent: Option<fn()>,
    child: Option<fn()>,
) -> Result<(), Errno> {
    REGISTRY.lock.lock();
    let handlers = unsafe { &mut *REGISTRY.handlers.get() };
    if let Some(handler) = prepare {
        handlers.prepare.push(handler);
    }
    if let Some(handler) = parent {
        handlers.parent.push(handler);
    }
    if let Some(handler) = child {
        handlers.child.push(handler);
    }
    REGISTRY.lock.unlock();
    Ok(())
}

/// Fork the process, running the registered handler chains around the kernel
/// call and resetting the child's thread machinery.
pub fn fork() -> Result<ForkResult, Errno> {
    ensure_initialized();
    REGISTRY.lock.lock();
    let (prepare, parent, child) = {
        let handlers = unsafe { &*REGISTRY.handlers.get() };
        (
            handlers.prepare.clone(),
            handlers.parent.clone(),
            handlers.child.clone(),
        )
    };
    REGISTRY.lock.unlock();

    // Prepare handlers run most-recently-registered first.
    for handler in prepare.iter().rev() {
        handler();
    }

    let pid = unsafe { libc::fork() };
    if pid == 0 {
        reset_main_thread();
        for handler in child.iter() {
            handler();
        }
        return Ok(ForkResult::Child);
    }

    // The fork failed or we are the parent; either way the parent handlers
    // run.
    let err = if pid == -1 { Some(Errno::last()) } else { None };
    for handler in parent.iter() {
        handler();
    }
    match err {
        Some(err) => Err(err),
        None => Ok(ForkResult::Parent {
            child: Pid::from_raw(pid),
        }),
    }
}
