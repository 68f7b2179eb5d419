//! Thread-specific data: a process-wide fixed-size key table paired with a
//! per-descriptor value array.

use crate::descriptor::{thread_self, Pthread, KEYS_MAX};
use crate::mutex::Mutex;
use crate::thread::ensure_initialized;
use libc::c_void;
use nix::errno::Errno;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Run against a thread's non-null value for the key when the thread exits.
pub type KeyDestructor = fn(*mut c_void);

struct KeySlot {
    in_use: AtomicBool,
    /// The destructor as a plain word, zero for none: the exit path reads
    /// slots without taking the key mutex.
    destructor: AtomicUsize,
}

const FREE_SLOT: KeySlot = KeySlot {
    in_use: AtomicBool::new(false),
    destructor: AtomicUsize::new(0),
};

static KEYS: [KeySlot; KEYS_MAX] = [FREE_SLOT; KEYS_MAX];

/// Guards slot allocation. Recursive so key operations stay legal from
/// within destructors.
static KEYS_MUTEX: Mutex = Mutex::new_recursive();

/// Handle to one slot of the key table.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Key(usize);

pub fn key_create(destructor: Option<KeyDestructor>) -> Result<Key, Errno> {
    KEYS_MUTEX.lock();
    for slot in 0..KEYS_MAX {
        if !KEYS[slot].in_use.load(Ordering::Relaxed) {
            KEYS[slot].in_use.store(true, Ordering::Relaxed);
            let raw = match destructor {
                Some(destr) => destr as usize,
                None => 0,
            };
            KEYS[slot].destructor.store(raw, Ordering::Release);
            KEYS_MUTEX.unlock();
            return Ok(Key(slot));
        }
    }
    KEYS_MUTEX.unlock();
    Err(Errno::EAGAIN)
}

/// Release the slot. Destructors are NOT run; values threads still hold for
/// this key stay whatever they were.
pub fn key_delete(key: Key) -> Result<(), Errno> {
    KEYS_MUTEX.lock();
    if key.0 >= KEYS_MAX || !KEYS[key.0].in_use.load(Ordering::Relaxed) {
        KEYS_MUTEX.unlock();
        return Err(Errno::EINVAL);
    }
    KEYS[key.0].in_use.store(false, Ordering::Relaxed);
    KEYS[key.0].destructor.store(0, Ordering::Release);
    KEYS_MUTEX.unlock();
    Ok(())
}

pub fn set_specific(key: Key, value: *mut c_void) -> Result<(), Errno> {
    ensure_initialized();
    if key.0 >= KEYS_MAX {
        return Err(Errno::EINVAL);
    }
    let self_ = thread_self();
    unsafe {
        (*self_).specific[key.0].store(value, Ordering::Relaxed);
    }
    Ok(())
}

/// Constant-time read of the calling thread's value for `key`; null when
/// nothing was stored. Async-signal-safe.
pub fn get_specific(key: Key) -> *mut c_void {
    ensure_initialized();
    if key.0 >= KEYS_MAX {
        return ptr::null_mut();
    }
    let self_ = thread_self();
    unsafe { (*self_).specific[key.0].load(Ordering::Relaxed) }
}

/// Invoke every non-null destructor on the exiting thread's non-null
/// values. A single pass; destructors that store fresh values do not get a
/// second look.
pub(crate) unsafe fn destroy_specifics(self_: Pthread) {
    for slot in 0..KEYS_MAX {
        let raw = KEYS[slot].destructor.load(Ordering::Acquire);
        let value = (*self_).specific[slot].load(Ordering::Relaxed);
        if raw != 0 && !value.is_null() {
            let destr: KeyDestructor = mem::transmute(raw);
            destr(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn noop_destructor(_value: *mut libc::c_void) {}

    #[test]
    #[serial]
    fn create_and_delete_round_trip() {
        let key = key_create(Some(noop_destructor)).unwrap();
        assert_eq!(key_delete(key), Ok(()));
        assert_eq!(key_delete(key), Err(Errno::EINVAL));
    }

    #[test]
    #[serial]
    fn deleted_slot_is_reused() {
        let first = key_create(None).unwrap();
        key_delete(first).unwrap();
        let second = key_create(None).unwrap();
        assert_eq!(first, second);
        key_delete(second).unwrap();
    }

    #[test]
    #[serial]
    fn table_exhaustion_reports_again() {
        let mut created = Vec::new();
        loop {
            match key_create(None) {
                Ok(key) => created.push(key),
                Err(err) => {
                    assert_eq!(err, Errno::EAGAIN);
                    break;
                }
            }
        }
        assert!(!created.is_empty());
        for key in created {
            key_delete(key).unwrap();
        }
    }
}
