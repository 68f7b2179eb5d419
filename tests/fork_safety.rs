//! Fork end to end: atfork handlers bracket the fork, both sides observe the
//! guarded mutex unlocked, and the child — reduced to a single thread — can
//! create fresh threads.

use cthreads::{at_fork, create, fork, join, ForkResult, Mutex};
use libc::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

static GUARD: Mutex = Mutex::new_fast();
static STOP: AtomicUsize = AtomicUsize::new(0);
static CHILD_ECHO: AtomicUsize = AtomicUsize::new(0);

fn nap_ms(ms: u32) {
    unsafe {
        libc::usleep(ms * 1000);
    }
}

fn prepare() {
    GUARD.lock();
}

fn parent() {
    GUARD.unlock();
}

fn child() {
    GUARD.unlock();
}

/// Contends on the guarded mutex until told to stop.
fn contender(_arg: *mut c_void) -> *mut c_void {
    while STOP.load(Ordering::Acquire) == 0 {
        GUARD.lock();
        GUARD.unlock();
        nap_ms(1);
    }
    ptr::null_mut()
}

fn child_worker(_arg: *mut c_void) -> *mut c_void {
    CHILD_ECHO.store(99, Ordering::Release);
    13 as *mut c_void
}

fn main() {
    at_fork(Some(prepare), Some(parent), Some(child)).expect("at_fork failed");

    let mut contenders = Vec::new();
    for _ in 0..3 {
        contenders.push(create(None, contender, ptr::null_mut()).expect("create failed"));
    }
    nap_ms(30);

    match fork().expect("fork failed") {
        ForkResult::Child => {
            // The child handler already released the mutex taken in prepare.
            assert_eq!(GUARD.trylock(), Ok(()));
            GUARD.unlock();
            // The contenders belong to the parent; in here only this thread
            // exists, and fresh threads can be created.
            let th = create(None, child_worker, ptr::null_mut())
                .expect("create in fork child failed");
            let retval = join(th).expect("join in fork child failed");
            assert_eq!(retval as usize, 13);
            assert_eq!(CHILD_ECHO.load(Ordering::Acquire), 99);
            unsafe {
                libc::_exit(0);
            }
        }
        ForkResult::Parent { child } => {
            // The parent handler released the mutex here too.
            assert_eq!(GUARD.trylock(), Ok(()));
            GUARD.unlock();

            STOP.store(1, Ordering::Release);
            for th in contenders {
                join(th).expect("join contender failed");
            }

            // The child must have exited cleanly.
            let mut status: libc::c_int = -1;
            let waited = unsafe { libc::waitpid(child.as_raw(), &mut status, 0) };
            assert_eq!(waited, child.as_raw());
            assert!(
                libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0,
                "fork child failed with status {:#x}",
                status
            );
        }
    }

    assert_eq!(GUARD.destroy(), Ok(()));
    assert_eq!(GUARD.trylock(), Ok(()));
    GUARD.unlock();

    println!("fork_safety: ok");
}
