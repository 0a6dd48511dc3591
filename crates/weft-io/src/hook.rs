//! Blocking-call hooks.
//!
//! Each wrapper keeps the libc calling convention (count or -1 with errno)
//! but, when hooking is enabled on the thread and the caller is a fiber on
//! an `IoManager`, a would-block result parks the fiber on readiness
//! instead of blocking the worker thread. From the fiber's point of view
//! these look like ordinary blocking calls.
//!
//! Hooking is opt-in per thread with [`set_hook_enable`]; the wrappers fall
//! through to the raw syscall everywhere else, so they are safe to call
//! from plain threads too.

use crate::fd_table::fd_table;
use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use weft_core::wtrace;
use weft_runtime::config;
use weft_runtime::{Fiber, IoEvent, IoManager};

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

pub fn set_hook_enable(on: bool) {
    HOOK_ENABLED.with(|h| h.set(on));
}

pub fn is_hook_enable() -> bool {
    HOOK_ENABLED.with(|h| h.get())
}

fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

fn set_errno(e: i32) {
    unsafe { *libc::__errno_location() = e }
}

/// Timer-vs-readiness race flag: 0 pending, 2 timed out.
const RACE_PENDING: u8 = 0;
const RACE_TIMEOUT: u8 = 2;

/// Suspend until ready. Returns false when resumed by hook fallback
/// conditions failing (never parks), true when the caller should retry.
/// Sets ETIMEDOUT and returns false when the timeout won the race.
fn park_on(iom: &IoManager, fd: RawFd, ev: IoEvent, timeout_ms: Option<u64>) -> bool {
    let winner = Arc::new(AtomicU8::new(RACE_PENDING));
    let timer = timeout_ms.map(|ms| {
        let winner = winner.clone();
        let iom2 = iom.clone();
        iom.add_timer_ms(
            ms,
            move || {
                if winner
                    .compare_exchange(RACE_PENDING, RACE_TIMEOUT, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    // The cancel fires the parked fiber as if ready; the
                    // flag tells it the wakeup was a deadline.
                    iom2.cancel_event(fd, ev);
                }
            },
            false,
        )
    });
    if let Err(e) = iom.add_event(fd, ev) {
        if let Some(id) = timer {
            iom.cancel_timer(id);
        }
        set_errno(e.raw_os_error().unwrap_or(libc::EBUSY));
        return false;
    }
    Fiber::yield_to_hold();
    if let Some(id) = timer {
        iom.cancel_timer(id);
    }
    if winner.load(Ordering::SeqCst) == RACE_TIMEOUT {
        set_errno(libc::ETIMEDOUT);
        return false;
    }
    true
}

/// The shared retry loop behind every data-path wrapper.
fn do_io<F>(fd: RawFd, ev: IoEvent, mut sys: F) -> isize
where
    F: FnMut() -> isize,
{
    if !is_hook_enable() {
        return sys();
    }
    let Some(iom) = IoManager::current() else {
        return sys();
    };
    if Fiber::current_handle().is_none() {
        return sys();
    }
    let Some(ctx) = fd_table().get(fd, false) else {
        return sys();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return sys();
    }
    let timeout_ms = ctx.timeout(ev);
    loop {
        let mut n = sys();
        while n == -1 && errno() == libc::EINTR {
            n = sys();
        }
        if !(n == -1 && errno() == libc::EAGAIN) {
            return n;
        }
        wtrace!(target: "hook", "fd {} would block, parking ({:?})", fd, ev);
        if !park_on(&iom, fd, ev, timeout_ms) {
            return -1;
        }
        // Readiness (or a spurious wake) resumed us; retry the syscall.
    }
}

/// Fiber-aware sleep. Off a fiber this is `std::thread::sleep`.
pub fn sleep(dur: Duration) {
    sleep_ms(dur.as_millis() as u64)
}

pub fn sleep_ms(ms: u64) {
    if is_hook_enable() {
        if let Some(iom) = IoManager::current() {
            let handle = Fiber::current_handle();
            if handle.is_some() {
                let sched = iom.scheduler().clone();
                iom.add_timer_ms(ms, move || sched.schedule(handle), false);
                Fiber::yield_to_hold();
                return;
            }
        }
    }
    std::thread::sleep(Duration::from_millis(ms));
}

pub fn socket(domain: i32, ty: i32, protocol: i32) -> RawFd {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd >= 0 {
        fd_table().get(fd, true);
    }
    fd
}

/// Connect bounded by `timeout_ms` (falls back to the configured default
/// when `None` is not given explicitly via [`connect`]).
pub fn connect_with_timeout(
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout_ms: Option<u64>,
) -> i32 {
    let sys = || unsafe { libc::connect(fd, addr, addrlen) };
    if !is_hook_enable() {
        return sys();
    }
    let Some(iom) = IoManager::current() else {
        return sys();
    };
    if Fiber::current_handle().is_none() {
        return sys();
    }
    let Some(ctx) = fd_table().get(fd, false) else {
        return sys();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return sys();
    }
    let ret = sys();
    if ret == 0 {
        return 0;
    }
    if errno() != libc::EINPROGRESS {
        return -1;
    }
    // Connection in flight; writability reports the outcome.
    if !park_on(&iom, fd, IoEvent::Write, timeout_ms) {
        return -1;
    }
    let mut err: i32 = 0;
    let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut i32 as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return -1;
    }
    if err != 0 {
        set_errno(err);
        return -1;
    }
    0
}

pub fn connect(fd: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> i32 {
    connect_with_timeout(fd, addr, addrlen, config::default_connect_timeout_ms())
}

/// Accept a connection, tracking the new fd. Returns the fd or -1.
pub fn accept(
    fd: RawFd,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> RawFd {
    let n = do_io(fd, IoEvent::Read, || unsafe {
        libc::accept(fd, addr, addrlen) as isize
    });
    if n >= 0 {
        fd_table().get(n as RawFd, true);
    }
    n as RawFd
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    do_io(fd, IoEvent::Read, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    })
}

pub fn readv(fd: RawFd, iov: &mut [libc::iovec]) -> isize {
    do_io(fd, IoEvent::Read, || unsafe {
        libc::readv(fd, iov.as_ptr(), iov.len() as i32)
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> isize {
    do_io(fd, IoEvent::Read, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
    })
}

pub fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: i32,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> isize {
    do_io(fd, IoEvent::Read, || unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            flags,
            addr,
            addrlen,
        )
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    do_io(fd, IoEvent::Write, || unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
    })
}

pub fn writev(fd: RawFd, iov: &[libc::iovec]) -> isize {
    do_io(fd, IoEvent::Write, || unsafe {
        libc::writev(fd, iov.as_ptr(), iov.len() as i32)
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> isize {
    do_io(fd, IoEvent::Write, || unsafe {
        libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags)
    })
}

pub fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: i32,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> isize {
    do_io(fd, IoEvent::Write, || unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            flags,
            addr,
            addrlen,
        )
    })
}

/// Close an fd: cancel parked waiters (they retry and hit EBADF), drop the
/// table entry, then close for real.
pub fn close(fd: RawFd) -> i32 {
    if let Some(ctx) = fd_table().get(fd, false) {
        ctx.set_closed();
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        fd_table().del(fd);
    }
    unsafe { libc::close(fd) }
}

/// Per-direction timeout for hooked calls on a tracked fd.
pub fn set_timeout(fd: RawFd, ev: IoEvent, ms: Option<u64>) {
    if let Some(ctx) = fd_table().get(fd, true) {
        ctx.set_timeout(ev, ms);
    }
}

pub fn timeout(fd: RawFd, ev: IoEvent) -> Option<u64> {
    fd_table().get(fd, false).and_then(|ctx| ctx.timeout(ev))
}

/// Record that the application wants real nonblocking semantics; hooked
/// calls then return EAGAIN instead of parking. The fd itself is already
/// nonblocking.
pub fn set_user_nonblock(fd: RawFd, on: bool) -> bool {
    match fd_table().get(fd, false) {
        Some(ctx) if ctx.is_socket() => {
            ctx.set_user_nonblock(on);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn wait_until(mut pred: impl FnMut() -> bool, ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(ms);
        while Instant::now() < deadline {
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        pred()
    }

    #[test]
    fn unhooked_sleep_blocks_thread() {
        assert!(!is_hook_enable());
        let t0 = Instant::now();
        sleep_ms(20);
        assert!(t0.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn hooked_sleep_parks_only_the_fiber() {
        let iom = IoManager::new(1, false, "t_hook_sleep").unwrap();
        iom.start().unwrap();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let done = Arc::new(AtomicUsize::new(0));

        let o1 = order.clone();
        let d1 = done.clone();
        iom.spawn(move || {
            set_hook_enable(true);
            o1.lock().unwrap().push("a_start");
            sleep_ms(60);
            o1.lock().unwrap().push("a_end");
            d1.fetch_add(1, Ordering::SeqCst);
        });
        let o2 = order.clone();
        let d2 = done.clone();
        iom.spawn(move || {
            set_hook_enable(true);
            o2.lock().unwrap().push("b");
            d2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wait_until(|| done.load(Ordering::SeqCst) == 2, 3000));
        // One worker: fiber b ran while fiber a slept.
        assert_eq!(*order.lock().unwrap(), vec!["a_start", "b", "a_end"]);
        iom.stop();
    }

    #[test]
    fn hooked_read_parks_until_data() {
        let iom = IoManager::new(1, false, "t_hook_read").unwrap();
        iom.start().unwrap();
        let (a, b) = socketpair();
        fd_table().get(a, true).unwrap();
        let got = Arc::new(AtomicUsize::new(0));
        let g2 = got.clone();
        iom.spawn(move || {
            set_hook_enable(true);
            let mut buf = [0u8; 16];
            let n = read(a, &mut buf);
            assert_eq!(n, 5);
            assert_eq!(&buf[..5], b"hello");
            g2.store(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(got.load(Ordering::SeqCst), 0);
        unsafe { libc::write(b, b"hello".as_ptr() as *const libc::c_void, 5) };
        assert!(wait_until(|| got.load(Ordering::SeqCst) == 1, 3000));
        iom.stop();
        // Drop the table entries before closing so a later test reusing
        // these fd numbers gets a fresh FdContext.
        fd_table().del(a);
        fd_table().del(b);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn recv_timeout_reports_etimedout() {
        let iom = IoManager::new(1, false, "t_hook_timeout").unwrap();
        iom.start().unwrap();
        let (a, b) = socketpair();
        let ctx = fd_table().get(a, true).unwrap();
        ctx.set_timeout(IoEvent::Read, Some(60));
        let outcome = Arc::new(AtomicUsize::new(0));
        let o2 = outcome.clone();
        iom.spawn(move || {
            set_hook_enable(true);
            let mut buf = [0u8; 8];
            let n = recv(a, &mut buf, 0);
            if n == -1 && errno() == libc::ETIMEDOUT {
                o2.store(1, Ordering::SeqCst);
            } else {
                o2.store(2, Ordering::SeqCst);
            }
        });
        assert!(wait_until(|| outcome.load(Ordering::SeqCst) != 0, 3000));
        assert_eq!(outcome.load(Ordering::SeqCst), 1);
        iom.stop();
        fd_table().del(a);
        fd_table().del(b);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn user_nonblock_passes_eagain_through() {
        let iom = IoManager::new(1, false, "t_hook_nonblock").unwrap();
        iom.start().unwrap();
        let (a, b) = socketpair();
        fd_table().get(a, true).unwrap();
        assert!(set_user_nonblock(a, true));
        let outcome = Arc::new(AtomicUsize::new(0));
        let o2 = outcome.clone();
        iom.spawn(move || {
            set_hook_enable(true);
            let mut buf = [0u8; 8];
            let n = read(a, &mut buf);
            if n == -1 && errno() == libc::EAGAIN {
                o2.store(1, Ordering::SeqCst);
            } else {
                o2.store(2, Ordering::SeqCst);
            }
        });
        assert!(wait_until(|| outcome.load(Ordering::SeqCst) != 0, 3000));
        assert_eq!(outcome.load(Ordering::SeqCst), 1);
        iom.stop();
        fd_table().del(a);
        fd_table().del(b);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }
}
