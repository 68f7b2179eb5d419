//! The manager task: a dedicated kernel task, created lazily on the first
//! thread creation, that serializes thread lifecycle. It owns the request
//! pipe, the stack-segment allocator, and the live ring; it creates and
//! reaps cloned tasks and coordinates process-wide exit.
//!
//! Synchronization primitives never talk to the manager; only lifecycle
//! bookkeeping flows through the pipe.

use crate::attr::{Attr, InheritSched, SchedPolicy};
use crate::descriptor::{
    self, initial_thread_ptr, main_thread_ptr, manager_thread_ptr, Pthread, StartRoutine,
    ThreadDescriptor, INITIAL_THREAD_BOS, MANAGER_READER_FD, MANAGER_REQUEST_FD,
    MANAGER_STACK_BOS, MANAGER_STACK_TOS, STACK_SIZE,
};
use crate::join;
use crate::restart::{restart, SIG_CANCEL, SIG_RESTART};
use crate::spinlock::SpinLock;
use bitflags::bitflags;
use lazy_static::lazy_static;
use libc::{c_int, c_void};
use log::debug;
use nix::errno::Errno;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{self, SigSet, SigmaskHow, Signal};
use nix::sys::time::{TimeVal, TimeValLike};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, Pid, SysconfVar};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{mem, ptr, slice};

bitflags! {
    /// Resources a cloned task shares with the rest of the process. Every
    /// task this library creates shares all four.
    pub(crate) struct CloneShare: c_int {
        const VM = libc::CLONE_VM;
        const FS = libc::CLONE_FS;
        const FILES = libc::CLONE_FILES;
        const SIGHAND = libc::CLONE_SIGHAND;
    }
}

lazy_static! {
    static ref PAGE_SIZE: usize = match unistd::sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(sz)) => sz as usize,
        _ => 4096,
    };
    /// Initial mapping at the top of a fresh stack segment; the kernel grows
    /// it downward on demand.
    static ref INITIAL_STACK_SIZE: usize = 4 * *PAGE_SIZE;
    static ref MANAGER_STACK_SIZE: usize = 8 * *PAGE_SIZE;
}

/// Set by the manager's RESTART handler: the clone termination signal doubles
/// as the child-exited notice.
pub(crate) static TERMINATED_CHILDREN: AtomicBool = AtomicBool::new(false);

/// Set when the main thread is blocked in its exit waiting for all other
/// threads to terminate.
pub(crate) static MAIN_THREAD_EXITING: AtomicBool = AtomicBool::new(false);

/// Lifecycle requests, written whole over the request pipe. Fixed size and
/// `Copy`; both ends live in the same address space.
#[derive(Copy, Clone)]
pub(crate) struct Request {
    pub sender: Pthread,
    pub kind: RequestKind,
}

#[derive(Copy, Clone)]
pub(crate) enum RequestKind {
    Create {
        attr: Attr,
        start: StartRoutine,
        arg: *mut c_void,
        mask: libc::sigset_t,
    },
    Free {
        thread: Pthread,
    },
    ProcessExit {
        code: i32,
    },
    MainThreadExit,
}

pub(crate) fn manager_running() -> bool {
    MANAGER_REQUEST_FD.load(Ordering::Acquire) >= 0
}

pub(crate) fn send_request(req: Request) {
    let fd = MANAGER_REQUEST_FD.load(Ordering::Acquire);
    let bytes =
        unsafe { slice::from_raw_parts(&req as *const Request as *const u8, mem::size_of::<Request>()) };
    let _ = unistd::write(fd, bytes);
}

/// Bookkeeping of stack segments, descending from the boundary below the
/// initial thread's stack. Process-static so reservations survive manager
/// restarts and fork.
pub(crate) struct SegmentMap {
    lock: SpinLock,
    in_use: UnsafeCell<Vec<bool>>,
}

// SAFETY: the vector is only touched under `lock`.
unsafe impl Sync for SegmentMap {}

impl SegmentMap {
    pub(crate) const fn new() -> SegmentMap {
        SegmentMap {
            lock: SpinLock::new(),
            in_use: UnsafeCell::new(Vec::new()),
        }
    }

    /// Mark and return the first free segment at or after `from`, growing
    /// the map as needed (128 entries initially, doubling).
    fn reserve(&self, from: usize) -> usize {
        self.lock.acquire();
        let map = unsafe { &mut *self.in_use.get() };
        let mut seg = from;
        loop {
            if seg >= map.len() {
                let grown = if map.is_empty() { 128 } else { map.len() * 2 };
                map.resize(grown, false);
            }
            if !map[seg] {
                map[seg] = true;
                break;
            }
            seg += 1;
        }
        self.lock.release();
        seg
    }

    fn release(&self, seg: usize) {
        self.lock.acquire();
        let map = unsafe { &mut *self.in_use.get() };
        if seg < map.len() {
            map[seg] = false;
        }
        self.lock.release();
    }
}

static STACK_SEGMENTS: SegmentMap = SegmentMap::new();

/// Descriptor slot at the top of stack segment `seg`.
fn segment_descriptor(seg: usize) -> Pthread {
    let start = INITIAL_THREAD_BOS.load(Ordering::Acquire);
    ((start - seg * STACK_SIZE) as Pthread).wrapping_sub(1)
}

/// Inverse of `segment_descriptor`.
fn descriptor_segment(th: Pthread) -> usize {
    let top = th.wrapping_add(1) as usize;
    (INITIAL_THREAD_BOS.load(Ordering::Acquire) - top) / STACK_SIZE
}

/// Start the manager task: dedicated heap stack, request pipe, clone.
pub(crate) fn start_manager() -> Result<(), Errno> {
    let stack_size = *MANAGER_STACK_SIZE;
    let stack = vec![0u8; stack_size].into_boxed_slice();
    let bos = Box::into_raw(stack) as *mut u8 as usize;
    // Publish the stack range before the manager runs so its descriptor is
    // recoverable from its first instruction.
    MANAGER_STACK_BOS.store(bos, Ordering::Release);
    MANAGER_STACK_TOS.store(bos + stack_size, Ordering::Release);

    let (reader, writer) = match unistd::pipe() {
        Ok(fds) => fds,
        Err(_) => {
            free_manager_stack();
            return Err(Errno::EAGAIN);
        }
    };
    MANAGER_READER_FD.store(reader, Ordering::Release);

    let pid = unsafe {
        libc::clone(
            manager_main,
            (bos + stack_size) as *mut c_void,
            CloneShare::all().bits(),
            reader as usize as *mut c_void,
        )
    };
    if pid == -1 {
        free_manager_stack();
        let _ = unistd::close(reader);
        let _ = unistd::close(writer);
        MANAGER_READER_FD.store(-1, Ordering::Release);
        return Err(Errno::EAGAIN);
    }
    unsafe {
        (*manager_thread_ptr()).pid.store(pid, Ordering::Release);
    }
    // Publishing the write end is what marks the manager as running.
    MANAGER_REQUEST_FD.store(writer, Ordering::Release);
    debug!("manager task started (pid {})", pid);
    Ok(())
}

pub(crate) fn free_manager_stack() {
    let bos = MANAGER_STACK_BOS.swap(0, Ordering::AcqRel);
    let tos = MANAGER_STACK_TOS.swap(0, Ordering::AcqRel);
    if bos != 0 {
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                bos as *mut u8,
                tos - bos,
            )));
        }
    }
}

/// The manager's event loop.
extern "C" fn manager_main(arg: *mut c_void) -> c_int {
    let reqfd = arg as usize as RawFd;
    unsafe {
        (*manager_thread_ptr())
            .pid
            .store(unistd::getpid().as_raw(), Ordering::Release);
    }
    // Block everything except RESTART, which doubles as the child-exit
    // notice (it is the clone termination signal).
    let mut mask = SigSet::all();
    mask.remove(SIG_RESTART);
    let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&mask), None);

    loop {
        let mut readfds = FdSet::new();
        readfds.insert(reqfd);
        let mut timeout = TimeVal::seconds(2);
        let n = select(
            reqfd + 1,
            Some(&mut readfds),
            None::<&mut FdSet>,
            None::<&mut FdSet>,
            Some(&mut timeout),
        );

        // If our parent became init, the original process is gone; take the
        // remaining tasks down with us.
        if unistd::getppid() == Pid::from_raw(1) {
            unsafe {
                kill_all_threads(Signal::SIGKILL, false);
            }
            return 0;
        }

        if TERMINATED_CHILDREN.swap(false, Ordering::AcqRel) {
            unsafe {
                reap_children();
            }
        }

        if let Ok(1) = n {
            if readfds.contains(reqfd) {
                let mut buf = [0u8; mem::size_of::<Request>()];
                match unistd::read(reqfd, &mut buf) {
                    Ok(count) if count == buf.len() => {
                        let request =
                            unsafe { ptr::read_unaligned(buf.as_ptr() as *const Request) };
                        if let Some(code) = unsafe { dispatch(request) } {
                            return code;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Handle one request. `Some(code)` means the manager returns (its task
/// exits) with that status.
unsafe fn dispatch(request: Request) -> Option<c_int> {
    match request.kind {
        RequestKind::Create {
            attr,
            start,
            arg,
            mask,
        } => {
            let sender = request.sender;
            let father_pid = (*sender).pid.load(Ordering::Acquire);
            match handle_create(&attr, start, arg, mask, father_pid) {
                Ok(new_thread) => {
                    (*sender)
                        .retval
                        .store(new_thread as *mut c_void, Ordering::Relaxed);
                    (*sender).retcode.store(0, Ordering::Release);
                }
                Err(err) => {
                    (*sender).retcode.store(err as i32, Ordering::Release);
                }
            }
            restart(sender);
            None
        }
        RequestKind::Free { thread } => {
            handle_free(thread);
            None
        }
        RequestKind::ProcessExit { code } => handle_process_exit(request.sender, code),
        RequestKind::MainThreadExit => {
            MAIN_THREAD_EXITING.store(true, Ordering::Release);
            if descriptor::live_ring_is_singleton() {
                restart(main_thread_ptr());
                return Some(0);
            }
            None
        }
    }
}

/// Entry point of every cloned thread task.
extern "C" fn thread_start(arg: *mut c_void) -> c_int {
    let self_ = arg as Pthread;
    unsafe {
        // Our father may not have stored the pid yet.
        (*self_)
            .pid
            .store(unistd::getpid().as_raw(), Ordering::Release);
        // Take the creating thread's signal mask, not the manager's.
        let mask = (*(*self_).initial_mask.get()).assume_init();
        libc::sigprocmask(libc::SIG_SETMASK, &mask, ptr::null_mut());
        let outcome = match *(*self_).initial_fn.get() {
            Some(start) => start(*(*self_).initial_arg.get()),
            None => ptr::null_mut(),
        };
        join::exit(outcome)
    }
}

unsafe fn handle_create(
    attr: &Attr,
    start: StartRoutine,
    arg: *mut c_void,
    mask: libc::sigset_t,
    father_pid: libc::pid_t,
) -> Result<Pthread, Errno> {
    // Find a segment whose top pages actually map: part of a segment may
    // already be occupied by foreign mappings, in which case it stays
    // reserved (to speed up future scans) and the next one is tried.
    let mut seg = 0usize;
    let new_thread = loop {
        seg = STACK_SEGMENTS.reserve(seg);
        let candidate = segment_descriptor(seg);
        let map_base = candidate.wrapping_add(1) as usize - *INITIAL_STACK_SIZE;
        let mapped = mman::mmap(
            map_base as *mut c_void,
            *INITIAL_STACK_SIZE,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
            MapFlags::MAP_PRIVATE
                | MapFlags::MAP_ANONYMOUS
                | MapFlags::MAP_FIXED
                | MapFlags::MAP_GROWSDOWN,
            -1,
            0,
        );
        match mapped {
            Ok(_) => break candidate,
            Err(_) => seg += 1,
        }
    };

    ptr::write(new_thread, ThreadDescriptor::new());
    (*new_thread).detached.store(
        attr.detach_state == crate::attr::DetachState::Detached,
        Ordering::Relaxed,
    );
    *(*new_thread).initial_fn.get() = Some(start);
    *(*new_thread).initial_arg.get() = arg;
    *(*new_thread).initial_mask.get() = MaybeUninit::new(mask);

    // The new task shares everything and notifies us with RESTART when it
    // terminates.
    let flags = CloneShare::all().bits() | SIG_RESTART as c_int;
    let pid = libc::clone(
        thread_start,
        new_thread as *mut c_void,
        flags,
        new_thread as *mut c_void,
    );
    if pid == -1 {
        let map_base = new_thread.wrapping_add(1) as usize - *INITIAL_STACK_SIZE;
        let _ = mman::munmap(map_base as *mut c_void, *INITIAL_STACK_SIZE);
        STACK_SEGMENTS.release(seg);
        return Err(Errno::EAGAIN);
    }

    if attr.sched_policy != SchedPolicy::Other {
        match attr.inherit_sched {
            InheritSched::Explicit => {
                libc::sched_setscheduler(pid, attr.sched_policy.as_raw(), &attr.sched_param);
            }
            InheritSched::Inherit => {
                let father_policy = libc::sched_getscheduler(father_pid);
                let mut father_param = libc::sched_param { sched_priority: 0 };
                libc::sched_getparam(father_pid, &mut father_param);
                libc::sched_setscheduler(pid, father_policy, &father_param);
            }
        }
    }

    descriptor::live_ring_insert(new_thread);
    // Store the pid ourselves too, in case anyone looks before the child
    // gets to run.
    (*new_thread).pid.store(pid, Ordering::Release);
    debug!("created thread {} on segment {}", pid, seg);
    Ok(new_thread)
}

/// Release a descriptor's stack segment. The initial thread's descriptor is
/// static and never freed.
unsafe fn free_thread(th: Pthread) {
    if th == initial_thread_ptr() {
        return;
    }
    debug_assert!((*th).exited.load(Ordering::Relaxed));
    let seg = descriptor_segment(th);
    let segment_base = th.wrapping_add(1) as usize - STACK_SIZE;
    let _ = mman::munmap(segment_base as *mut c_void, STACK_SIZE);
    STACK_SEGMENTS.release(seg);
    debug!("freed segment {}", seg);
}

/// A cloned task with this pid has been reaped: drop it from the live ring,
/// mark it exited, release it if it was already detached.
unsafe fn thread_exited(pid: libc::pid_t) {
    let main = main_thread_ptr();
    let mut th = (*main).nextlive.load(Ordering::Acquire);
    while th != main {
        if (*th).pid.load(Ordering::Acquire) == pid {
            descriptor::live_ring_remove(th);
            (*th).lock.acquire();
            (*th).exited.store(true, Ordering::Relaxed);
            let detached = (*th).detached.load(Ordering::Relaxed);
            (*th).lock.release();
            if detached {
                free_thread(th);
            }
            debug!("reaped thread {}", pid);
            break;
        }
        th = (*th).nextlive.load(Ordering::Acquire);
    }
    // If the main thread is pending on its exit and nobody is left, wake it
    // and terminate ourselves.
    if MAIN_THREAD_EXITING.load(Ordering::Acquire) && descriptor::live_ring_is_singleton() {
        restart(main_thread_ptr());
        libc::_exit(0);
    }
}

unsafe fn reap_children() {
    loop {
        match waitpid(
            None,
            Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WCLONE),
        ) {
            Ok(WaitStatus::Exited(pid, _)) => {
                thread_exited(pid.as_raw());
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                thread_exited(pid.as_raw());
                // A thread died to a fatal signal: forward it to every other
                // thread, main included, matching single-threaded semantics.
                kill_all_threads(sig, true);
                libc::_exit(0);
            }
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

unsafe fn handle_free(th: Pthread) {
    (*th).lock.acquire();
    let exited = (*th).exited.load(Ordering::Relaxed);
    if !exited {
        // The kernel task is still running; flag it so the reap path frees
        // it later.
        (*th).detached.store(true, Ordering::Relaxed);
    }
    (*th).lock.release();
    if exited {
        free_thread(th);
    }
}

unsafe fn kill_all_threads(sig: Signal, main_thread_also: bool) {
    let main = main_thread_ptr();
    let mut th = (*main).nextlive.load(Ordering::Acquire);
    while th != main {
        let _ = signal::kill(Pid::from_raw((*th).pid.load(Ordering::Acquire)), sig);
        th = (*th).nextlive.load(Ordering::Acquire);
    }
    if main_thread_also {
        let _ = signal::kill(Pid::from_raw((*main).pid.load(Ordering::Acquire)), sig);
    }
}

/// Process-wide exit: notify every other thread, wake the issuer so it can
/// finish the exit (atexit handlers, stdio flushing), and terminate the
/// manager task.
unsafe fn handle_process_exit(issuer: Pthread, code: i32) -> ! {
    descriptor::EXIT_REQUESTED.store(true, Ordering::Release);
    descriptor::EXIT_CODE.store(code, Ordering::Release);
    debug!("process exit requested (code {})", code);
    let mut th = (*issuer).nextlive.load(Ordering::Acquire);
    while th != issuer {
        let _ = signal::kill(
            Pid::from_raw((*th).pid.load(Ordering::Acquire)),
            SIG_CANCEL,
        );
        th = (*th).nextlive.load(Ordering::Acquire);
    }
    restart(issuer);
    libc::_exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_map_reserves_in_order() {
        let map = SegmentMap::new();
        assert_eq!(map.reserve(0), 0);
        assert_eq!(map.reserve(0), 1);
        assert_eq!(map.reserve(0), 2);
    }

    #[test]
    fn segment_map_reuses_released_slots() {
        let map = SegmentMap::new();
        let a = map.reserve(0);
        let b = map.reserve(0);
        map.release(a);
        assert_eq!(map.reserve(0), a);
        map.release(b);
        assert_eq!(map.reserve(0), b);
    }

    #[test]
    fn segment_map_honors_starting_point() {
        let map = SegmentMap::new();
        assert_eq!(map.reserve(5), 5);
        // Slot 5 stays reserved even though nothing was mapped there.
        assert_eq!(map.reserve(5), 6);
        assert_eq!(map.reserve(0), 0);
    }

    #[test]
    fn segment_map_grows_past_initial_capacity() {
        let map = SegmentMap::new();
        for expected in 0..300 {
            assert_eq!(map.reserve(0), expected);
        }
    }
}
