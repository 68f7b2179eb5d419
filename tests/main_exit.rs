//! Main-thread exit end to end: a main thread that exits the thread way
//! parks until its last peer finishes, and only then does the process die.
//!
//! The scenario needs to observe a whole process lifetime, so it forks: the
//! child plays the multithreaded process, the parent watches the clock and
//! the exit status.

use libc::c_void;
use std::ptr;
use std::time::Instant;

static mut PIPE_WRITE: libc::c_int = -1;

fn nap_ms(ms: u32) {
    unsafe {
        libc::usleep(ms * 1000);
    }
}

/// Outlives the child's main thread, then reports in just before finishing.
fn straggler(_arg: *mut c_void) -> *mut c_void {
    nap_ms(300);
    unsafe {
        let byte = b"x";
        libc::write(PIPE_WRITE, byte.as_ptr() as *const c_void, 1);
    }
    7 as *mut c_void
}

fn main() {
    let mut fds = [0 as libc::c_int; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (read_end, write_end) = (fds[0], fds[1]);

    let started = Instant::now();
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");

    if pid == 0 {
        // The child is the multithreaded process under test.
        unsafe {
            PIPE_WRITE = write_end;
        }
        cthreads::create(None, straggler, ptr::null_mut()).expect("create failed");
        // Exiting the main thread must not take the process with it while
        // the straggler lives.
        cthreads::exit(ptr::null_mut());
    }

    unsafe {
        libc::close(write_end);
    }
    // The straggler signs off right before it finishes.
    let mut byte = 0u8;
    let got = unsafe { libc::read(read_end, &mut byte as *mut u8 as *mut c_void, 1) };
    assert_eq!(got, 1, "straggler never ran to completion");

    let mut status: libc::c_int = -1;
    let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(waited, pid);
    assert!(
        libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0,
        "child process failed with status {:#x}",
        status
    );
    let elapsed = started.elapsed();
    assert!(
        elapsed.as_millis() >= 300,
        "process exited before the straggler finished ({:?})",
        elapsed
    );

    println!("main_exit: ok");
}
