//! Per-fd bookkeeping for the hook layer.
//!
//! The first time the hooks touch an fd they classify it with `fstat`:
//! sockets get `O_NONBLOCK` forced on (the hooks simulate blocking by
//! parking the fiber), everything else passes through untouched. The
//! context also carries the per-direction timeouts and the user's own
//! nonblocking preference, which must survive the forced flag.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use weft_core::wdebug;
use weft_runtime::config;
use weft_runtime::IoEvent;

pub struct FdContext {
    fd: RawFd,
    is_socket: bool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    /// Milliseconds; `TIMEOUT_NONE` means block forever.
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdContext {
    fn new(fd: RawFd) -> FdContext {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::fstat(fd, &mut stat) };
        let is_socket = ret == 0 && (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
        if is_socket {
            // The hooks need the real syscall to return EAGAIN instead of
            // blocking the worker thread.
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
        }
        let recv = config::default_recv_timeout_ms().unwrap_or(config::TIMEOUT_NONE);
        let send = config::default_send_timeout_ms().unwrap_or(config::TIMEOUT_NONE);
        wdebug!(target: "fdtable", "fd {} tracked, socket={}", fd, is_socket);
        FdContext {
            fd,
            is_socket,
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(recv),
            send_timeout_ms: AtomicU64::new(send),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// The application asked for nonblocking behavior itself; the hooks
    /// then pass EAGAIN through instead of parking.
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    pub fn timeout(&self, ev: IoEvent) -> Option<u64> {
        let ms = match ev {
            IoEvent::Read => self.recv_timeout_ms.load(Ordering::Relaxed),
            IoEvent::Write => self.send_timeout_ms.load(Ordering::Relaxed),
        };
        (ms != config::TIMEOUT_NONE).then_some(ms)
    }

    pub fn set_timeout(&self, ev: IoEvent, ms: Option<u64>) {
        let raw = ms.unwrap_or(config::TIMEOUT_NONE);
        match ev {
            IoEvent::Read => self.recv_timeout_ms.store(raw, Ordering::Relaxed),
            IoEvent::Write => self.send_timeout_ms.store(raw, Ordering::Relaxed),
        }
    }
}

pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdContext>>>>,
}

impl FdTable {
    fn new() -> FdTable {
        FdTable {
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Look an fd up, creating the context when `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        {
            let slots = self.slots.read().unwrap();
            if let Some(Some(ctx)) = slots.get(fd as usize) {
                return Some(ctx.clone());
            }
        }
        if !auto_create {
            return None;
        }
        let mut slots = self.slots.write().unwrap();
        if slots.len() <= fd as usize {
            let grown = (slots.len() * 3 / 2).max(fd as usize + 1).max(32);
            slots.resize_with(grown, || None);
        }
        Some(
            slots[fd as usize]
                .get_or_insert_with(|| Arc::new(FdContext::new(fd)))
                .clone(),
        )
    }

    /// Forget an fd (close path). The fd number can now be reused by the
    /// kernel with a fresh context.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

/// Process-wide table.
pub fn fd_table() -> &'static FdTable {
    static TABLE: OnceLock<FdTable> = OnceLock::new();
    TABLE.get_or_init(FdTable::new)
}
