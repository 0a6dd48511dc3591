//! Readiness-driven scheduler extension.
//!
//! `IoManager` couples a `Scheduler` with a reactor: an epoll instance over
//! registered descriptors, an eventfd for tickling parked workers, and the
//! timer min-heap. The reactor replaces the scheduler's idle policy: idle
//! workers block in `epoll_wait` bounded by the nearest timer deadline
//! (capped), wake on readiness or a tickle, run expired timers first, then
//! dispatch readiness handlers.
//!
//! Registrations are one-shot: firing detaches the handler under the fd's
//! lock and drops the epoll interest for that direction, so a handler runs
//! at most once per registration even with several workers polling.

use crate::fiber::Fiber;
use crate::scheduler::{Driver, Scheduler};
use crate::timer::{TimerCallback, TimerId, TimerQueue};
use crate::tls;
use std::io;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use weft_core::{wdebug, werror, FiberHandle};

const MAX_EVENTS: usize = 256;
/// Upper bound on one epoll_wait, so stop requests and freshly armed
/// timers are noticed even without a tickle.
const MAX_IDLE_WAIT_MS: u64 = 3000;

/// Readiness direction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IoEvent {
    Read,
    Write,
}

impl IoEvent {
    fn epoll_bits(self) -> u32 {
        match self {
            IoEvent::Read => libc::EPOLLIN as u32,
            IoEvent::Write => libc::EPOLLOUT as u32,
        }
    }
}

enum Waiter {
    Fiber(FiberHandle),
    Call(Box<dyn FnOnce() + Send>),
}

struct FdSlotInner {
    read: Option<Waiter>,
    write: Option<Waiter>,
    /// Epoll mask currently installed for this fd.
    interest: u32,
}

struct FdSlot {
    inner: Mutex<FdSlotInner>,
}

impl FdSlot {
    fn new() -> Self {
        FdSlot {
            inner: Mutex::new(FdSlotInner {
                read: None,
                write: None,
                interest: 0,
            }),
        }
    }
}

struct Reactor {
    epfd: RawFd,
    wake_fd: RawFd,
    slots: RwLock<Vec<Option<Arc<FdSlot>>>>,
    /// Registered, not-yet-fired directions; gates shutdown.
    pending: AtomicUsize,
    timers: TimerQueue,
}

impl Reactor {
    fn new() -> io::Result<Reactor> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err);
        }
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake_fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(epfd);
            }
            return Err(err);
        }
        Ok(Reactor {
            epfd,
            wake_fd,
            slots: RwLock::new(Vec::new()),
            pending: AtomicUsize::new(0),
            timers: TimerQueue::new(),
        })
    }

    fn wake(&self) {
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.wake_fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // A full eventfd counter already guarantees a wakeup.
            if err.raw_os_error() != Some(libc::EAGAIN) {
                werror!(target: "reactor", "eventfd wake failed: {}", err);
            }
        }
    }

    fn drain_wake(&self) {
        let mut buf: u64 = 0;
        loop {
            let ret = unsafe {
                libc::read(
                    self.wake_fd,
                    &mut buf as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if ret <= 0 {
                break;
            }
        }
    }

    fn slot(&self, fd: RawFd) -> Option<Arc<FdSlot>> {
        let slots = self.slots.read().unwrap();
        slots.get(fd as usize).and_then(|s| s.clone())
    }

    fn ensure_slot(&self, fd: RawFd) -> Arc<FdSlot> {
        if let Some(slot) = self.slot(fd) {
            return slot;
        }
        let mut slots = self.slots.write().unwrap();
        if slots.len() <= fd as usize {
            let grown = (slots.len() * 3 / 2).max(fd as usize + 1).max(32);
            slots.resize_with(grown, || None);
        }
        slots[fd as usize]
            .get_or_insert_with(|| Arc::new(FdSlot::new()))
            .clone()
    }

    fn epoll_update(&self, fd: RawFd, old: u32, new: u32) -> io::Result<()> {
        let op = if old == 0 {
            libc::EPOLL_CTL_ADD
        } else if new == 0 {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: new,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn add_event(&self, fd: RawFd, ev: IoEvent, waiter: Waiter) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let slot = self.ensure_slot(fd);
        let mut inner = slot.inner.lock().unwrap();
        let occupied = match ev {
            IoEvent::Read => inner.read.is_some(),
            IoEvent::Write => inner.write.is_some(),
        };
        if occupied {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        let old = inner.interest;
        let new = old | ev.epoll_bits();
        self.epoll_update(fd, old, new)?;
        inner.interest = new;
        match ev {
            IoEvent::Read => inner.read = Some(waiter),
            IoEvent::Write => inner.write = Some(waiter),
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Remove a registration, returning the parked handler.
    fn detach(&self, fd: RawFd, ev: IoEvent) -> Option<Waiter> {
        let slot = self.slot(fd)?;
        let mut inner = slot.inner.lock().unwrap();
        let waiter = match ev {
            IoEvent::Read => inner.read.take(),
            IoEvent::Write => inner.write.take(),
        }?;
        let old = inner.interest;
        let new = old & !ev.epoll_bits();
        if let Err(e) = self.epoll_update(fd, old, new) {
            // EBADF after the fd was closed: the kernel already dropped it.
            wdebug!(target: "reactor", "epoll update on detach fd {}: {}", fd, e);
        }
        inner.interest = new;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(waiter)
    }

    /// Dispatch readiness for one fd: detach matching handlers under the fd
    /// lock, shrink the epoll interest, then schedule them.
    fn dispatch_ready(&self, fd: RawFd, revents: u32, sched: &Scheduler) {
        let Some(slot) = self.slot(fd) else { return };
        let mut fired: Vec<Waiter> = Vec::new();
        {
            let mut inner = slot.inner.lock().unwrap();
            let mut mask = revents;
            // Errors and hangups release both directions.
            if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                mask |= inner.interest;
            }
            if mask & libc::EPOLLIN as u32 != 0 {
                if let Some(w) = inner.read.take() {
                    fired.push(w);
                }
            }
            if mask & libc::EPOLLOUT as u32 != 0 {
                if let Some(w) = inner.write.take() {
                    fired.push(w);
                }
            }
            if fired.is_empty() {
                return;
            }
            let old = inner.interest;
            let mut new = 0;
            if inner.read.is_some() {
                new |= libc::EPOLLIN as u32;
            }
            if inner.write.is_some() {
                new |= libc::EPOLLOUT as u32;
            }
            if new != old {
                if let Err(e) = self.epoll_update(fd, old, new) {
                    wdebug!(target: "reactor", "epoll update on fire fd {}: {}", fd, e);
                }
                inner.interest = new;
            }
            self.pending.fetch_sub(fired.len(), Ordering::SeqCst);
        }
        for w in fired {
            fire(sched, w);
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epfd);
        }
    }
}

fn fire(sched: &Scheduler, waiter: Waiter) {
    match waiter {
        Waiter::Fiber(h) => sched.schedule(h),
        Waiter::Call(f) => sched.schedule_call_boxed(f, None),
    }
}

struct IoDriver {
    reactor: Arc<Reactor>,
}

impl Driver for IoDriver {
    fn on_worker_start(&self, sched: &Scheduler) {
        tls::set_current_io(Some(IoManager {
            sched: sched.clone(),
            reactor: self.reactor.clone(),
        }));
    }

    fn tickle(&self, sched: &Scheduler) {
        if sched.idle_workers() == 0 {
            return;
        }
        self.reactor.wake();
    }

    fn stopping(&self, sched: &Scheduler) -> bool {
        !self.reactor.timers.has_pending()
            && self.reactor.pending.load(Ordering::SeqCst) == 0
            && sched.base_stopping()
    }

    fn idle(&self, sched: &Scheduler) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        loop {
            if self.stopping(sched) {
                wdebug!(target: "reactor", "{} drained, idle exiting", sched.name());
                break;
            }
            let timeout_ms: i32 = match self.reactor.timers.next_deadline() {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        0
                    } else {
                        deadline
                            .duration_since(now)
                            .as_millis()
                            .min(MAX_IDLE_WAIT_MS as u128) as i32
                    }
                }
                None => MAX_IDLE_WAIT_MS as i32,
            };
            let n = unsafe {
                libc::epoll_wait(
                    self.reactor.epfd,
                    events.as_mut_ptr(),
                    MAX_EVENTS as i32,
                    timeout_ms,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                werror!(target: "reactor", "epoll_wait failed: {}", err);
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }

            // Timers first, then readiness.
            let expired = self.reactor.timers.pop_expired(Instant::now());
            let mut dispatched = !expired.is_empty();
            for cb in expired {
                sched.schedule_call_boxed(Box::new(move || cb()), None);
            }

            for ev in events.iter().take(n as usize) {
                let fd = ev.u64 as RawFd;
                let revents = ev.events;
                if fd == self.reactor.wake_fd {
                    // While stopping, leave the eventfd readable so every
                    // parked worker falls through immediately.
                    if !sched.stop_requested() {
                        self.reactor.drain_wake();
                    }
                    continue;
                }
                dispatched = true;
                self.reactor.dispatch_ready(fd, revents, sched);
            }

            // The readable eventfd keeps epoll_wait from blocking during
            // stop; pace the loop while a timer or event is still pending.
            if sched.stop_requested() && !dispatched {
                std::thread::sleep(Duration::from_millis(1));
            }

            Fiber::yield_to_hold();
        }
    }
}

/// Scheduler with an epoll reactor and timers. Cloneable handle; derefs to
/// the underlying `Scheduler` for spawn/schedule/start/stop.
#[derive(Clone)]
pub struct IoManager {
    sched: Scheduler,
    reactor: Arc<Reactor>,
}

impl IoManager {
    pub fn new(threads: usize, include_caller: bool, name: &str) -> io::Result<IoManager> {
        let reactor = Arc::new(Reactor::new()?);
        let driver = Arc::new(IoDriver {
            reactor: reactor.clone(),
        });
        let sched = Scheduler::with_driver(threads, include_caller, name, driver);
        let iom = IoManager { sched, reactor };
        if include_caller {
            tls::set_current_io(Some(iom.clone()));
        }
        Ok(iom)
    }

    /// IoManager of the current thread (workers, and caller threads of
    /// caller-inclusive managers).
    pub fn current() -> Option<IoManager> {
        tls::current_io()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Park the current fiber until `fd` is ready in direction `ev`.
    /// Fails with `AlreadyExists` if that (fd, direction) already has a
    /// waiter, with no state changed.
    pub fn add_event(&self, fd: RawFd, ev: IoEvent) -> io::Result<()> {
        let handle = Fiber::current_handle();
        if handle.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "add_event without a callback requires a scheduled fiber",
            ));
        }
        self.reactor.add_event(fd, ev, Waiter::Fiber(handle))
    }

    /// Register a callback to run once `fd` is ready in direction `ev`.
    pub fn add_event_with<F>(&self, fd: RawFd, ev: IoEvent, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.reactor.add_event(fd, ev, Waiter::Call(Box::new(f)))
    }

    /// Drop a registration without running its handler.
    pub fn del_event(&self, fd: RawFd, ev: IoEvent) -> bool {
        self.reactor.detach(fd, ev).is_some()
    }

    /// Remove a registration and fire its handler as though the fd had
    /// become ready.
    pub fn cancel_event(&self, fd: RawFd, ev: IoEvent) -> bool {
        match self.reactor.detach(fd, ev) {
            Some(w) => {
                fire(&self.sched, w);
                true
            }
            None => false,
        }
    }

    /// Cancel both directions of an fd (close path).
    pub fn cancel_all(&self, fd: RawFd) {
        self.cancel_event(fd, IoEvent::Read);
        self.cancel_event(fd, IoEvent::Write);
    }

    /// One-shot (or recurring) timer. The callback runs on a worker.
    pub fn add_timer<F>(&self, delay: Duration, f: F, recurring: bool) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let period = if recurring { Some(delay) } else { None };
        let cb: TimerCallback = Arc::new(f);
        let (id, new_front) = self.reactor.timers.add(delay, cb, period);
        if new_front {
            // A parked worker may be waiting on a later deadline.
            self.sched.tickle();
        }
        id
    }

    pub fn add_timer_ms<F>(&self, ms: u64, f: F, recurring: bool) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer(Duration::from_millis(ms), f, recurring)
    }

    /// Cancel a pending timer; false if it already fired.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.reactor.timers.cancel(id)
    }

    pub fn pending_events(&self) -> usize {
        self.reactor.pending.load(Ordering::SeqCst)
    }

    pub fn pending_timers(&self) -> usize {
        self.reactor.timers.len()
    }
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}
