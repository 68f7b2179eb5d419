//! Per-thread data and signal operations end to end: key round trips,
//! destructors on thread exit, directed kill, and sigwait.

use cthreads::{
    create, get_specific, join, key_create, key_delete, kill, set_specific, sigmask, sigwait,
    Errno, SigSet, SigmaskHow, Signal,
};
use libc::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

static DESTRUCTOR_SAW: AtomicUsize = AtomicUsize::new(0);
static WAITER_GOT: AtomicUsize = AtomicUsize::new(0);
static WAITER_READY: AtomicUsize = AtomicUsize::new(0);

fn nap_ms(ms: u32) {
    unsafe {
        libc::usleep(ms * 1000);
    }
}

fn record_value(value: *mut c_void) {
    DESTRUCTOR_SAW.store(value as usize, Ordering::Release);
}

/// Stores a value under the key passed in and exits; the destructor must
/// see that value.
fn key_user(arg: *mut c_void) -> *mut c_void {
    let key = unsafe { *(arg as *const cthreads::Key) };
    assert!(get_specific(key).is_null(), "fresh thread starts empty");
    set_specific(key, 0x5151 as *mut c_void).expect("set_specific failed");
    assert_eq!(get_specific(key) as usize, 0x5151);
    ptr::null_mut()
}

/// Blocks SIGTERM, then waits for it the sigwait way.
fn term_waiter(_arg: *mut c_void) -> *mut c_void {
    let mut set = SigSet::empty();
    set.add(Signal::SIGTERM);
    sigmask(SigmaskHow::SIG_BLOCK, &set, None).expect("sigmask failed");
    WAITER_READY.store(1, Ordering::Release);
    let sig = sigwait(&set).expect("sigwait failed");
    WAITER_GOT.store(sig as usize, Ordering::Release);
    ptr::null_mut()
}

fn main() {
    // Round trip on the initial thread.
    let key = key_create(Some(record_value)).expect("key_create failed");
    assert!(get_specific(key).is_null());
    set_specific(key, 0xABCD as *mut c_void).expect("set_specific failed");
    assert_eq!(get_specific(key) as usize, 0xABCD);

    // Another thread's slot for the same key is independent, and its
    // destructor fires on exit with the thread's own value.
    let key_cell = key;
    let th = create(
        None,
        key_user,
        &key_cell as *const cthreads::Key as *mut c_void,
    )
    .expect("create failed");
    join(th).expect("join failed");
    assert_eq!(
        DESTRUCTOR_SAW.load(Ordering::Acquire),
        0x5151,
        "destructor must run with the dead thread's value"
    );

    // The initial thread's value survived, and deletion does not run
    // destructors.
    assert_eq!(get_specific(key) as usize, 0xABCD);
    DESTRUCTOR_SAW.store(0, Ordering::Release);
    key_delete(key).expect("key_delete failed");
    assert_eq!(DESTRUCTOR_SAW.load(Ordering::Acquire), 0);

    // Directed signal delivery via sigwait.
    let th = create(None, term_waiter, ptr::null_mut()).expect("create failed");
    while WAITER_READY.load(Ordering::Acquire) == 0 {
        nap_ms(5);
    }
    nap_ms(30);
    kill(th, Signal::SIGTERM).expect("kill failed");
    join(th).expect("join failed");
    assert_eq!(
        WAITER_GOT.load(Ordering::Acquire),
        Signal::SIGTERM as usize,
        "sigwait must report the delivered signal"
    );

    // Keys are allocatable again after deletion, and a dead key is invalid.
    let again = key_create(None).expect("key_create after delete failed");
    key_delete(again).expect("key_delete failed");
    assert_eq!(key_delete(again), Err(Errno::EINVAL));

    println!("specific_signals: ok");
}
