//! Locking hooks for a C library.
//!
//! A C library hosting this runtime locks its internal structures through
//! these entry points, treating the lock storage as opaque bytes of at least
//! `size_of::<Mutex>()`. Where the runtime is absent, the C side compiles
//! the hooks to no-ops; here they delegate unconditionally to the mutex.

use crate::mutex::Mutex;
use libc::c_int;
use std::ptr;

/// # Safety
///
/// `lock` must point to writable storage of at least `size_of::<Mutex>()`
/// bytes, suitably aligned.
#[no_mangle]
pub unsafe extern "C" fn __libc_lock_init(lock: *mut Mutex) -> c_int {
    ptr::write(lock, Mutex::new_fast());
    0
}

/// # Safety
///
/// As for `__libc_lock_init`.
#[no_mangle]
pub unsafe extern "C" fn __libc_lock_init_recursive(lock: *mut Mutex) -> c_int {
    ptr::write(lock, Mutex::new_recursive());
    0
}

/// Finalize a lock, which must be unlocked. The storage may be reused after
/// another init.
///
/// # Safety
///
/// `lock` must have been initialized by one of the init hooks.
#[no_mangle]
pub unsafe extern "C" fn __libc_lock_fini(lock: *mut Mutex) -> c_int {
    match (*lock).destroy() {
        Ok(()) => 0,
        Err(err) => err as c_int,
    }
}

/// # Safety
///
/// As for `__libc_lock_fini`.
#[no_mangle]
pub unsafe extern "C" fn __libc_lock_fini_recursive(lock: *mut Mutex) -> c_int {
    __libc_lock_fini(lock)
}

/// # Safety
///
/// `lock` must have been initialized by one of the init hooks.
#[no_mangle]
pub unsafe extern "C" fn __libc_lock_lock(lock: *mut Mutex) -> c_int {
    (*lock).lock();
    0
}

/// # Safety
///
/// As for `__libc_lock_lock`.
#[no_mangle]
pub unsafe extern "C" fn __libc_lock_lock_recursive(lock: *mut Mutex) -> c_int {
    (*lock).lock();
    0
}

/// # Safety
///
/// As for `__libc_lock_lock`.
#[no_mangle]
pub unsafe extern "C" fn __libc_lock_trylock(lock: *mut Mutex) -> c_int {
    match (*lock).trylock() {
        Ok(()) => 0,
        Err(err) => err as c_int,
    }
}

/// # Safety
///
/// As for `__libc_lock_lock`.
#[no_mangle]
pub unsafe extern "C" fn __libc_lock_trylock_recursive(lock: *mut Mutex) -> c_int {
    __libc_lock_trylock(lock)
}

/// # Safety
///
/// As for `__libc_lock_lock`.
#[no_mangle]
pub unsafe extern "C" fn __libc_lock_unlock(lock: *mut Mutex) -> c_int {
    (*lock).unlock();
    0
}

/// # Safety
///
/// As for `__libc_lock_lock`.
#[no_mangle]
pub unsafe extern "C" fn __libc_lock_unlock_recursive(lock: *mut Mutex) -> c_int {
    __libc_lock_unlock(lock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;
    use std::mem::MaybeUninit;

    #[test]
    fn hook_surface_drives_a_lock_through_its_life() {
        let mut storage = MaybeUninit::<Mutex>::uninit();
        unsafe {
            assert_eq!(__libc_lock_init(storage.as_mut_ptr()), 0);
            assert_eq!(__libc_lock_lock(storage.as_mut_ptr()), 0);
            assert_eq!(
                __libc_lock_trylock(storage.as_mut_ptr()),
                Errno::EBUSY as c_int
            );
            assert_eq!(__libc_lock_unlock(storage.as_mut_ptr()), 0);
            assert_eq!(__libc_lock_trylock(storage.as_mut_ptr()), 0);
            assert_eq!(__libc_lock_unlock(storage.as_mut_ptr()), 0);
            assert_eq!(__libc_lock_fini(storage.as_mut_ptr()), 0);
        }
    }
}
