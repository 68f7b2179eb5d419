//! Thread lifecycle end to end: create, join, detach, handle identity, and
//! the lifecycle error taxonomy.

use cthreads::{create, current, detach, equal, join, Attr, DetachState, Errno};
use libc::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

static DETACHED_RAN: AtomicUsize = AtomicUsize::new(0);

fn nap_ms(ms: u32) {
    unsafe {
        libc::usleep(ms * 1000);
    }
}

fn echo(arg: *mut c_void) -> *mut c_void {
    arg
}

fn mark_detached(_arg: *mut c_void) -> *mut c_void {
    DETACHED_RAN.store(42, Ordering::Release);
    ptr::null_mut()
}

fn slow_echo(arg: *mut c_void) -> *mut c_void {
    nap_ms(50);
    arg
}

fn main() {
    // Several threads echo their argument back through join.
    let mut threads = Vec::new();
    for i in 1..=4usize {
        let th = create(None, echo, i as *mut c_void).expect("create failed");
        threads.push((i, th));
    }
    for (i, th) in threads {
        let retval = join(th).expect("join failed");
        assert_eq!(retval as usize, i, "thread must return its argument");
    }

    // A handle compares equal to itself and joining yourself deadlocks.
    assert!(equal(current(), current()));
    assert_eq!(join(current()).err(), Some(Errno::EDEADLK));

    // A thread created detached runs but cannot be joined.
    let mut attr = Attr::new();
    attr.set_detach_state(DetachState::Detached).unwrap();
    let th = create(Some(&attr), mark_detached, ptr::null_mut()).expect("create detached failed");
    assert_eq!(join(th).err(), Some(Errno::EINVAL));
    while DETACHED_RAN.load(Ordering::Acquire) != 42 {
        nap_ms(5);
    }

    // Detaching a running thread succeeds once; the second detach and any
    // later join are invalid.
    let th = create(None, slow_echo, 7 as *mut c_void).expect("create failed");
    assert_eq!(detach(th), Ok(()));
    assert_eq!(detach(th), Err(Errno::EINVAL));
    assert_eq!(join(th).err(), Some(Errno::EINVAL));
    nap_ms(120);

    // Joining a finished thread collects the value without blocking.
    let th = create(None, echo, 9 as *mut c_void).expect("create failed");
    nap_ms(50);
    let retval = join(th).expect("join failed");
    assert_eq!(retval as usize, 9);

    println!("create_join: ok");
}
