//! Recursive mutex end to end: N acquisitions by one thread need N releases
//! before anyone else gets in.

use cthreads::{create, join, Errno, Mutex};
use libc::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

static MUTEX: Mutex = Mutex::new_recursive();
static PHASE: AtomicUsize = AtomicUsize::new(0);

fn nap_ms(ms: u32) {
    unsafe {
        libc::usleep(ms * 1000);
    }
}

fn relocker(_arg: *mut c_void) -> *mut c_void {
    MUTEX.lock();
    MUTEX.lock();
    MUTEX.lock();
    PHASE.store(1, Ordering::Release);

    // Hold through two of the three unlocks.
    while PHASE.load(Ordering::Acquire) == 1 {
        nap_ms(5);
    }
    MUTEX.unlock();
    MUTEX.unlock();
    PHASE.store(3, Ordering::Release);

    // Still one acquisition deep here.
    while PHASE.load(Ordering::Acquire) == 3 {
        nap_ms(5);
    }
    MUTEX.unlock();
    PHASE.store(5, Ordering::Release);
    ptr::null_mut()
}

fn main() {
    let th = create(None, relocker, ptr::null_mut()).expect("create failed");

    while PHASE.load(Ordering::Acquire) == 0 {
        nap_ms(5);
    }
    // Triple-locked by the thread.
    assert_eq!(MUTEX.trylock(), Err(Errno::EBUSY));
    PHASE.store(2, Ordering::Release);

    while PHASE.load(Ordering::Acquire) != 3 {
        nap_ms(5);
    }
    // Two unlocks down, one to go: still held.
    assert_eq!(MUTEX.trylock(), Err(Errno::EBUSY));
    PHASE.store(4, Ordering::Release);

    while PHASE.load(Ordering::Acquire) != 5 {
        nap_ms(5);
    }
    // Fully released: ours for the taking, recursively too.
    assert_eq!(MUTEX.trylock(), Ok(()));
    assert_eq!(MUTEX.trylock(), Ok(()));
    MUTEX.unlock();
    MUTEX.unlock();

    join(th).expect("join failed");
    assert_eq!(MUTEX.destroy(), Ok(()));

    println!("recursive_mutex: ok");
}
