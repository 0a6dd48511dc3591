//! Cooperative M:N scheduler.
//!
//! A fixed pool of named worker threads shares one FIFO task queue. A task
//! is either a fiber handle or a plain callback, optionally pinned to one
//! worker. Each worker runs the dispatch loop: scan the queue for the first
//! runnable task it may execute, resume it, handle the post-run state, and
//! fall into the idle fiber when nothing is eligible.
//!
//! The `Driver` trait is the extension seam: it decides how idle workers
//! wait, how they are woken ("tickled"), and when the pool counts as
//! drained. The base `YieldDriver` just naps; the reactor in `iomanager`
//! parks workers in `epoll_wait` instead.

use crate::arena::FiberArena;
use crate::fiber::Fiber;
use crate::thread::NamedThread;
use crate::tls;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use weft_core::log as wlog;
use weft_core::{wdebug, werror, winfo, wtrace};
use weft_core::{FiberHandle, FiberState, WeftError, WeftResult};

enum TaskPayload {
    Fiber(FiberHandle),
    Call(Box<dyn FnOnce() + Send>),
}

struct Task {
    payload: TaskPayload,
    affinity: Option<usize>,
}

/// Idle/wake/drain policy of a scheduler.
pub trait Driver: Send + Sync + 'static {
    /// Runs once on each worker thread before its dispatch loop.
    fn on_worker_start(&self, _sched: &Scheduler) {}

    /// Wake a waiting worker because work arrived.
    fn tickle(&self, _sched: &Scheduler) {}

    /// Body of the idle fiber. Must return once `stopping` holds; yields
    /// with `Fiber::yield_to_hold()` between waits.
    fn idle(&self, sched: &Scheduler);

    /// Whether the pool is drained and may shut down.
    fn stopping(&self, sched: &Scheduler) -> bool {
        sched.base_stopping()
    }
}

/// Default driver: idle workers nap briefly between queue scans.
pub struct YieldDriver;

impl Driver for YieldDriver {
    fn tickle(&self, sched: &Scheduler) {
        wtrace!(target: "sched", "tickle {}", sched.name());
    }

    fn idle(&self, sched: &Scheduler) {
        while !sched.is_stopping() {
            std::thread::sleep(Duration::from_millis(1));
            Fiber::yield_to_hold();
        }
    }
}

struct SchedInner {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    arena: FiberArena,
    workers: Mutex<Vec<NamedThread>>,
    /// OS threads spawned by start(); excludes the caller.
    spawn_count: usize,
    /// Total dispatch contexts, caller included.
    total_workers: usize,
    include_caller: bool,
    caller_thread: Option<std::thread::ThreadId>,
    active: AtomicUsize,
    idle_count: AtomicUsize,
    stop_requested: AtomicBool,
    auto_stop: AtomicBool,
    started: AtomicBool,
}

/// Cheap cloneable handle to one scheduler instance.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedInner>,
    driver: Arc<dyn Driver>,
}

impl Scheduler {
    pub fn new(threads: usize, include_caller: bool, name: &str) -> Scheduler {
        Self::with_driver(threads, include_caller, name, Arc::new(YieldDriver))
    }

    pub fn with_driver(
        threads: usize,
        include_caller: bool,
        name: &str,
        driver: Arc<dyn Driver>,
    ) -> Scheduler {
        assert!(threads >= 1, "scheduler needs at least one thread");
        let spawn_count = if include_caller { threads - 1 } else { threads };
        let sched = Scheduler {
            inner: Arc::new(SchedInner {
                name: name.to_string(),
                queue: Mutex::new(VecDeque::new()),
                arena: FiberArena::new(),
                workers: Mutex::new(Vec::new()),
                spawn_count,
                total_workers: threads,
                include_caller,
                caller_thread: include_caller.then(|| std::thread::current().id()),
                active: AtomicUsize::new(0),
                idle_count: AtomicUsize::new(0),
                stop_requested: AtomicBool::new(false),
                auto_stop: AtomicBool::new(false),
                started: AtomicBool::new(false),
            }),
            driver,
        };
        if include_caller {
            // The caller thread dispatches during stop(); give it a main
            // fiber and a current-scheduler slot now.
            tls::ensure_thread_fiber();
            tls::set_current_scheduler(Some(sched.clone()));
        }
        sched
    }

    /// Scheduler of the current thread, set on workers and on caller
    /// threads of caller-inclusive schedulers.
    pub fn current() -> Option<Scheduler> {
        tls::current_scheduler()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Total dispatch contexts, the caller included.
    pub fn worker_count(&self) -> usize {
        self.inner.total_workers
    }

    /// Spawn the worker threads. Idempotent per instance.
    pub fn start(&self) -> WeftResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(WeftError::AlreadyStarted);
        }
        let mut workers = self.inner.workers.lock().unwrap();
        for i in 0..self.inner.spawn_count {
            let sched = self.clone();
            let name = format!("{}_{}", self.inner.name, i);
            workers.push(NamedThread::spawn(&name, move || sched.run(i))?);
        }
        winfo!(target: "sched", "{} started with {} workers{}",
            self.inner.name,
            self.inner.spawn_count,
            if self.inner.include_caller { " + caller" } else { "" });
        Ok(())
    }

    /// Drain and shut down: no new implicit work, wake every worker, run
    /// the dispatch loop inline when the caller is part of the pool, then
    /// join all worker threads. Returns with zero live workers. Idempotent.
    pub fn stop(&self) {
        self.inner.auto_stop.store(true, Ordering::SeqCst);
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        for _ in 0..self.inner.total_workers {
            self.driver.tickle(self);
        }
        if self.inner.include_caller {
            assert_eq!(
                Some(std::thread::current().id()),
                self.inner.caller_thread,
                "caller-inclusive stop() must run on the constructing thread"
            );
            self.driver.tickle(self);
            if !self.is_stopping() {
                let sched = self.clone();
                let caller_id = self.inner.spawn_count;
                let mut root = Fiber::new_inner(
                    Box::new(move || sched.run(caller_id)),
                    0,
                    true,
                    false,
                );
                unsafe { root.call() };
            }
        }
        let workers = std::mem::take(&mut *self.inner.workers.lock().unwrap());
        for t in workers {
            t.join();
        }
        winfo!(target: "sched", "{} stopped", self.inner.name);
    }

    /// Create a fiber for `f` and queue it. The fiber is discarded when it
    /// terminates; the handle stays valid for re-scheduling until then.
    pub fn spawn<F>(&self, f: F) -> FiberHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_with(f, 0, None)
    }

    pub fn spawn_with<F>(&self, f: F, stack_size: usize, affinity: Option<usize>) -> FiberHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let fiber = Fiber::new_inner(Box::new(f), stack_size, false, true);
        let handle = self.inner.arena.insert(fiber);
        self.push(Task {
            payload: TaskPayload::Fiber(handle),
            affinity,
        });
        handle
    }

    /// Hand a caller-built fiber to the scheduler. Unlike `spawn`, the
    /// fiber is kept after it terminates so it can be `reset_fiber`-ed and
    /// re-scheduled; free it with `release`. Not queued yet.
    pub fn adopt(&self, fiber: Box<Fiber>) -> FiberHandle {
        self.inner.arena.insert(fiber)
    }

    /// Queue a fiber by handle (stale handles are dropped by the dispatch
    /// loop).
    pub fn schedule(&self, handle: FiberHandle) {
        self.schedule_to(handle, None);
    }

    pub fn schedule_to(&self, handle: FiberHandle, affinity: Option<usize>) {
        self.push(Task {
            payload: TaskPayload::Fiber(handle),
            affinity,
        });
    }

    /// Queue a plain callback; it runs on a worker's scratch fiber.
    pub fn schedule_call<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_call_boxed(Box::new(f), None);
    }

    pub fn schedule_call_to<F>(&self, f: F, affinity: Option<usize>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_call_boxed(Box::new(f), affinity);
    }

    pub(crate) fn schedule_call_boxed(&self, f: Box<dyn FnOnce() + Send>, affinity: Option<usize>) {
        self.push(Task {
            payload: TaskPayload::Call(f),
            affinity,
        });
    }

    /// Queue a batch of fibers with a single wakeup.
    pub fn schedule_all<I>(&self, handles: I)
    where
        I: IntoIterator<Item = FiberHandle>,
    {
        let need_tickle = {
            let mut q = self.inner.queue.lock().unwrap();
            let was_empty = q.is_empty();
            for h in handles {
                q.push_back(Task {
                    payload: TaskPayload::Fiber(h),
                    affinity: None,
                });
            }
            was_empty && !q.is_empty()
        };
        if need_tickle {
            self.driver.tickle(self);
        }
    }

    /// Free an adopted (or still-pending transient) fiber.
    pub fn release(&self, handle: FiberHandle) -> WeftResult<()> {
        self.inner.arena.remove(handle)
    }

    /// Re-arm a terminal fiber in place with a new callback.
    pub fn reset_fiber<F>(&self, handle: FiberHandle, f: F) -> WeftResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.arena.reset(handle, Box::new(f))
    }

    /// Observed state of a fiber; `None` once the handle is stale.
    pub fn fiber_state(&self, handle: FiberHandle) -> Option<FiberState> {
        self.inner.arena.state(handle)
    }

    /// Workers currently parked in their idle fiber.
    pub fn idle_workers(&self) -> usize {
        self.inner.idle_count.load(Ordering::SeqCst)
    }

    /// Tasks currently executing on some worker.
    pub fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.inner.stop_requested.load(Ordering::SeqCst)
    }

    /// Drain condition of the bare scheduler: stop requested, queue empty,
    /// nothing executing.
    pub fn base_stopping(&self) -> bool {
        self.inner.auto_stop.load(Ordering::SeqCst)
            && self.inner.stop_requested.load(Ordering::SeqCst)
            && self.inner.queue.lock().unwrap().is_empty()
            && self.inner.active.load(Ordering::SeqCst) == 0
    }

    /// Drain condition as the driver sees it.
    pub fn is_stopping(&self) -> bool {
        self.driver.stopping(self)
    }

    pub(crate) fn tickle(&self) {
        self.driver.tickle(self);
    }

    fn push(&self, task: Task) {
        let need_tickle = {
            let mut q = self.inner.queue.lock().unwrap();
            let was_empty = q.is_empty();
            q.push_back(task);
            was_empty
        };
        if need_tickle {
            self.driver.tickle(self);
        }
    }

    /// Dispatch loop; runs on each worker thread, and inside the root fiber
    /// on the caller during a caller-inclusive stop().
    fn run(&self, worker_id: usize) {
        tls::set_worker_id(Some(worker_id));
        wlog::set_worker_context(Some(worker_id));
        tls::set_current_scheduler(Some(self.clone()));
        self.driver.on_worker_start(self);
        tls::ensure_thread_fiber();
        // Yields return here: to the main fiber on a pool thread, to the
        // root fiber on the caller.
        tls::set_sched_context(tls::current_fiber());
        wdebug!(target: "sched", "worker {} dispatching", worker_id);

        let idle_sched = self.clone();
        let idle_driver = self.driver.clone();
        let mut idle = Fiber::new_inner(
            Box::new(move || idle_driver.idle(&idle_sched)),
            0,
            false,
            false,
        );
        let mut scratch: Option<FiberHandle> = None;

        loop {
            let mut tickle_me = false;
            let mut fiber_task: Option<(FiberHandle, Box<Fiber>)> = None;
            let mut call_task: Option<Box<dyn FnOnce() + Send>> = None;
            {
                let mut q = self.inner.queue.lock().unwrap();
                let mut i = 0;
                while i < q.len() {
                    if let Some(a) = q[i].affinity {
                        if a != worker_id {
                            // Someone else's task; make sure they look.
                            tickle_me = true;
                            i += 1;
                            continue;
                        }
                    }
                    let queued_fiber = match &q[i].payload {
                        TaskPayload::Fiber(h) => Some(*h),
                        TaskPayload::Call(_) => None,
                    };
                    if let Some(h) = queued_fiber {
                        match self.inner.arena.take(h) {
                            Ok(fiber) => {
                                q.remove(i);
                                fiber_task = Some((h, fiber));
                                break;
                            }
                            Err(WeftError::FiberBusy(_)) => {
                                // Executing on another worker right now;
                                // revisit after it yields.
                                i += 1;
                                continue;
                            }
                            Err(_) => {
                                // Stale handle; drop the task.
                                q.remove(i);
                                continue;
                            }
                        }
                    } else {
                        if let Some(Task {
                            payload: TaskPayload::Call(f),
                            ..
                        }) = q.remove(i)
                        {
                            call_task = Some(f);
                        }
                        break;
                    }
                }
                if fiber_task.is_some() || call_task.is_some() {
                    if !q.is_empty() {
                        tickle_me = true;
                    }
                    self.inner.active.fetch_add(1, Ordering::SeqCst);
                }
            }
            if tickle_me {
                self.driver.tickle(self);
            }

            if let Some((handle, mut fiber)) = fiber_task {
                unsafe { fiber.swap_in() };
                self.inner.active.fetch_sub(1, Ordering::SeqCst);
                self.park_fiber(handle, fiber);
                continue;
            }

            if let Some(f) = call_task {
                let handle = match scratch {
                    Some(h) => match self.inner.arena.reset(h, f) {
                        Ok(()) => h,
                        Err(e) => {
                            werror!(target: "sched", "scratch fiber reset failed: {}", e);
                            scratch = None;
                            self.inner.active.fetch_sub(1, Ordering::SeqCst);
                            continue;
                        }
                    },
                    None => {
                        let fiber = Fiber::new_inner(f, 0, false, true);
                        let h = self.inner.arena.insert(fiber);
                        scratch = Some(h);
                        h
                    }
                };
                let mut fiber = match self.inner.arena.take(handle) {
                    Ok(fiber) => fiber,
                    Err(e) => {
                        werror!(target: "sched", "scratch fiber vanished: {}", e);
                        scratch = None;
                        self.inner.active.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                };
                unsafe { fiber.swap_in() };
                self.inner.active.fetch_sub(1, Ordering::SeqCst);
                match fiber.state() {
                    FiberState::Ready => {
                        self.inner.arena.restore(handle, fiber);
                        self.schedule(handle);
                        scratch = None;
                    }
                    s if s.is_terminal() => {
                        // Keep for reuse by the next callback task.
                        self.inner.arena.restore(handle, fiber);
                    }
                    _ => {
                        fiber.set_state(FiberState::Hold);
                        self.inner.arena.restore(handle, fiber);
                        // The fiber now belongs to whoever re-schedules it.
                        scratch = None;
                    }
                }
                continue;
            }

            // Nothing eligible: run the idle fiber.
            if idle.state().is_terminal() {
                wdebug!(target: "sched", "worker {} drained, exiting", worker_id);
                break;
            }
            self.inner.idle_count.fetch_add(1, Ordering::SeqCst);
            unsafe { idle.swap_in() };
            self.inner.idle_count.fetch_sub(1, Ordering::SeqCst);
            if !idle.state().is_terminal() {
                idle.set_state(FiberState::Hold);
            }
        }

        if let Some(h) = scratch {
            let _ = self.inner.arena.remove(h);
        }
        tls::set_sched_context(std::ptr::null_mut());
        tls::set_current_scheduler(None);
        tls::set_worker_id(None);
        wlog::set_worker_context(None);
    }

    /// Post-run handling of a dispatched fiber.
    fn park_fiber(&self, handle: FiberHandle, fiber: Box<Fiber>) {
        match fiber.state() {
            FiberState::Ready => {
                self.inner.arena.restore(handle, fiber);
                self.schedule(handle);
            }
            s if s.is_terminal() => {
                if fiber.is_transient() {
                    self.inner.arena.discard(handle, fiber);
                } else {
                    self.inner.arena.restore(handle, fiber);
                }
            }
            _ => {
                // Came back without going through a yield; treat as Hold,
                // the owner re-schedules it.
                fiber.set_state(FiberState::Hold);
                self.inner.arena.restore(handle, fiber);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

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
    fn start_stop_empty() {
        let sched = Scheduler::new(2, false, "t_empty");
        sched.start().unwrap();
        assert!(sched.start().is_err());
        sched.stop();
    }

    #[test]
    fn callbacks_run() {
        let sched = Scheduler::new(2, false, "t_calls");
        sched.start().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let hits = hits.clone();
            sched.schedule_call(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(wait_until(|| hits.load(Ordering::SeqCst) == 16, 2000));
        sched.stop();
    }

    #[test]
    fn spawned_fiber_completes_and_is_discarded() {
        let sched = Scheduler::new(1, false, "t_spawn");
        sched.start().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h2 = hits.clone();
        let handle = sched.spawn(move || {
            h2.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_to_ready();
            h2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wait_until(|| hits.load(Ordering::SeqCst) == 2, 2000));
        // Transient fiber: handle goes stale after termination.
        assert!(wait_until(|| sched.fiber_state(handle).is_none(), 2000));
        sched.stop();
    }

    #[test]
    fn affinity_pins_to_worker() {
        let sched = Scheduler::new(3, false, "t_affinity");
        sched.start().unwrap();
        let ok = Arc::new(AtomicUsize::new(0));
        for target in 0..3usize {
            let ok = ok.clone();
            sched.schedule_call_to(
                move || {
                    if tls::worker_id() == Some(target) {
                        ok.fetch_add(1, Ordering::SeqCst);
                    }
                },
                Some(target),
            );
        }
        assert!(wait_until(|| ok.load(Ordering::SeqCst) == 3, 2000));
        sched.stop();
    }

    #[test]
    fn stop_runs_pending_work() {
        let sched = Scheduler::new(2, false, "t_drain");
        sched.start().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let hits = hits.clone();
            sched.schedule_call(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn caller_inclusive_runs_inline() {
        let sched = Scheduler::new(1, true, "t_caller");
        // No OS workers at all; everything runs on this thread during stop.
        let hits = Arc::new(AtomicUsize::new(0));
        let caller = std::thread::current().id();
        for _ in 0..4 {
            let hits = hits.clone();
            sched.schedule_call(move || {
                assert_eq!(std::thread::current().id(), caller);
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn adopted_fiber_can_be_reset_and_released() {
        let sched = Scheduler::new(1, false, "t_adopt");
        sched.start().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h2 = hits.clone();
        let handle = sched.adopt(Fiber::new(
            move || {
                h2.fetch_add(1, Ordering::SeqCst);
            },
            0,
        ));
        sched.schedule(handle);
        assert!(wait_until(|| hits.load(Ordering::SeqCst) == 1, 2000));
        assert!(wait_until(
            || sched.fiber_state(handle) == Some(FiberState::Term),
            2000
        ));
        let h3 = hits.clone();
        sched.reset_fiber(handle, move || {
            h3.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        sched.schedule(handle);
        assert!(wait_until(|| hits.load(Ordering::SeqCst) == 2, 2000));
        assert!(wait_until(
            || sched.fiber_state(handle) == Some(FiberState::Term),
            2000
        ));
        sched.release(handle).unwrap();
        assert_eq!(sched.fiber_state(handle), None);
        sched.stop();
    }

    #[test]
    fn schedule_all_queues_a_batch() {
        let sched = Scheduler::new(2, false, "t_batch");
        sched.start().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let hits = hits.clone();
            handles.push(sched.adopt(Fiber::new(
                move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                },
                0,
            )));
        }
        sched.schedule_all(handles.iter().copied());
        assert!(wait_until(|| hits.load(Ordering::SeqCst) == 8, 2000));
        for h in handles {
            assert!(wait_until(
                || sched.fiber_state(h) == Some(FiberState::Term),
                2000
            ));
            sched.release(h).unwrap();
        }
        sched.stop();
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let sched = Scheduler::new(1, false, "t_panic");
        sched.start().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        sched.schedule_call(|| panic!("task blew up"));
        let h2 = hits.clone();
        sched.schedule_call(move || {
            h2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wait_until(|| hits.load(Ordering::SeqCst) == 1, 2000));
        sched.stop();
    }
}
