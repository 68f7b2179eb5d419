//! Cancellation end to end: a blocked joiner is canceled out of its join and
//! reports the canceled sentinel, cleanup handlers run on the way out, a
//! disabled thread latches the request, and the slow target still finishes.

use cthreads::{
    cancel, cleanup_pop, cleanup_push, create, join, set_cancel_state, set_cancel_type,
    CancelState, CancelType, CleanupBuffer, CANCELED,
};
use libc::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

static SLEEPER_DONE: AtomicUsize = AtomicUsize::new(0);
static CLEANUP_RAN: AtomicUsize = AtomicUsize::new(0);
static LATCHED_EXITED: AtomicUsize = AtomicUsize::new(0);

fn nap_ms(ms: u32) {
    unsafe {
        libc::usleep(ms * 1000);
    }
}

fn cleanup_marker(_arg: *mut c_void) {
    CLEANUP_RAN.fetch_add(1, Ordering::AcqRel);
}

/// Runs long enough that the joiner is certainly parked before the cancel.
fn slow_target(_arg: *mut c_void) -> *mut c_void {
    nap_ms(400);
    SLEEPER_DONE.store(1, Ordering::Release);
    77 as *mut c_void
}

/// Joins the slow target with a cleanup handler armed; the join is the
/// cancellation point this test aims at.
fn joiner(arg: *mut c_void) -> *mut c_void {
    let target = unsafe { *(arg as *const cthreads::Thread) };
    let mut buffer = CleanupBuffer::new(cleanup_marker, ptr::null_mut());
    unsafe {
        cleanup_push(&mut buffer);
    }
    let retval = join(target);
    // Only reached if the cancel lost the race with the target's exit.
    unsafe {
        cleanup_pop(&mut buffer, false);
    }
    retval.unwrap_or(ptr::null_mut())
}

/// Disables cancellation, sleeps past an incoming request, then re-enables:
/// the latched request must fire at the next cancellation point.
fn latching(_arg: *mut c_void) -> *mut c_void {
    set_cancel_state(CancelState::Disable);
    nap_ms(150);
    LATCHED_EXITED.store(1, Ordering::Release);
    // Re-enabling alone does not exit; the next cancellation point does.
    set_cancel_state(CancelState::Enable);
    cthreads::test_cancel();
    // Not reached.
    LATCHED_EXITED.store(2, Ordering::Release);
    ptr::null_mut()
}

static SPINNING: AtomicUsize = AtomicUsize::new(0);

/// Spins in pure computation; only an asynchronous cancel can stop it.
fn spinner(_arg: *mut c_void) -> *mut c_void {
    set_cancel_type(CancelType::Asynchronous);
    SPINNING.store(1, Ordering::Release);
    while SPINNING.load(Ordering::Acquire) != 0 {}
    ptr::null_mut()
}

fn main() {
    // Deferred cancel at a join.
    let target = create(None, slow_target, ptr::null_mut()).expect("create target failed");
    let target_cell = target;
    let joiner_th = create(
        None,
        joiner,
        &target_cell as *const cthreads::Thread as *mut c_void,
    )
    .expect("create joiner failed");
    nap_ms(100);
    cancel(joiner_th);
    let joiner_result = join(joiner_th).expect("join of joiner failed");
    assert_eq!(joiner_result, CANCELED, "joiner must report the sentinel");
    assert_eq!(CLEANUP_RAN.load(Ordering::Acquire), 1, "cleanup must run");
    assert_eq!(
        SLEEPER_DONE.load(Ordering::Acquire),
        0,
        "target still running when joiner died"
    );

    // The abandoned target runs to completion and can still be collected.
    let retval = join(target).expect("join of target failed");
    assert_eq!(retval as usize, 77);
    assert_eq!(SLEEPER_DONE.load(Ordering::Acquire), 1);

    // Disabled cancellation latches.
    let th = create(None, latching, ptr::null_mut()).expect("create latching failed");
    nap_ms(30);
    cancel(th);
    let retval = join(th).expect("join latching failed");
    assert_eq!(retval, CANCELED);
    assert_eq!(
        LATCHED_EXITED.load(Ordering::Acquire),
        1,
        "thread must survive the disabled window and die at the next point"
    );

    // Asynchronous cancellation lands mid-computation, no cancellation
    // point in sight.
    let th = create(None, spinner, ptr::null_mut()).expect("create spinner failed");
    while SPINNING.load(Ordering::Acquire) == 0 {
        nap_ms(5);
    }
    cancel(th);
    let retval = join(th).expect("join spinner failed");
    assert_eq!(retval, CANCELED);

    println!("cancel_join: ok");
}
