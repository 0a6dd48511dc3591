//! Stackful fibers.
//!
//! A fiber owns an mmap'd stack and a saved register context. Workers resume
//! fibers with `swap_in`; fibers give the CPU back with `yield_to_ready` /
//! `yield_to_hold` or by returning from their callback. Every thread that
//! runs fibers has a lazily-created main fiber standing for its original
//! stack; the dispatch loop's context (main fiber, or the root fiber during
//! caller-inclusive shutdown) is what yields return to.
//!
//! State machine:
//! Init -> Exec -> {Ready, Hold} -> Exec -> {Term, Except}; `reset` re-arms
//! a Term/Except/Init fiber on the same stack allocation. A panic in the
//! callback is caught at the fiber boundary and becomes Except.

use crate::arch::{self, Context};
use crate::config;
use crate::stack::FiberStack;
use crate::tls;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use weft_core::log as wlog;
use weft_core::{werror, FiberHandle, FiberState};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

pub struct Fiber {
    id: u64,
    state: AtomicU8,
    ctx: Context,
    stack: Option<FiberStack>,
    callback: Option<Box<dyn FnOnce() + Send>>,
    handle: FiberHandle,
    // Terminal switch goes to the thread fiber instead of the dispatch
    // context (root fiber of a caller-inclusive stop).
    return_to_thread: bool,
    // Discarded by the worker when it reaches a terminal state.
    transient: bool,
}

impl Fiber {
    /// Create a fiber that will run `f` once resumed. `stack_size` of 0
    /// selects the configured default.
    pub fn new<F>(f: F, stack_size: usize) -> Box<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new_inner(Box::new(f), stack_size, false, false)
    }

    pub(crate) fn new_inner(
        cb: Box<dyn FnOnce() + Send>,
        stack_size: usize,
        return_to_thread: bool,
        transient: bool,
    ) -> Box<Fiber> {
        let size = if stack_size == 0 {
            config::default_stack_size()
        } else {
            stack_size
        };
        let mut fiber = Box::new(Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Init.as_u8()),
            ctx: Context::new(),
            stack: Some(FiberStack::alloc(size)),
            callback: Some(cb),
            handle: FiberHandle::NONE,
            return_to_thread,
            transient,
        });
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        fiber.arm();
        fiber
    }

    /// The thread's main fiber: no own stack, id 0, born Exec.
    pub(crate) fn main() -> Box<Fiber> {
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        Box::new(Fiber {
            id: 0,
            state: AtomicU8::new(FiberState::Exec.as_u8()),
            ctx: Context::new(),
            stack: None,
            callback: None,
            handle: FiberHandle::NONE,
            return_to_thread: false,
            transient: false,
        })
    }

    /// Point the saved context at the entry trampoline. The Box allocation
    /// never moves, so `self`'s address is a stable trampoline argument.
    fn arm(&mut self) {
        let top = match self.stack.as_ref() {
            Some(s) => s.top(),
            None => return,
        };
        let arg = self as *mut Fiber as usize;
        unsafe { arch::init_context(&mut self.ctx, top, fiber_entry as usize, arg) };
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, s: FiberState) {
        self.state.store(s.as_u8(), Ordering::Release);
    }

    #[inline]
    pub fn handle(&self) -> FiberHandle {
        self.handle
    }

    #[inline]
    pub(crate) fn set_handle(&mut self, h: FiberHandle) {
        self.handle = h;
    }

    #[inline]
    pub(crate) fn is_transient(&self) -> bool {
        self.transient
    }

    /// Address of the stack's high end; identifies the allocation across
    /// resets. `None` for the main fiber.
    pub fn stack_top(&self) -> Option<usize> {
        self.stack.as_ref().map(|s| s.top() as usize)
    }

    /// Re-arm the fiber with a new callback on the same stack. Only legal
    /// in Init, Term or Except.
    pub fn reset<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(f));
    }

    pub(crate) fn reset_boxed(&mut self, cb: Box<dyn FnOnce() + Send>) {
        assert!(self.stack.is_some(), "main fiber cannot be reset");
        let state = self.state();
        assert!(state.can_reset(), "reset of fiber {} in state {}", self.id, state);
        self.callback = Some(cb);
        self.set_state(FiberState::Init);
        self.arm();
    }

    /// Resume this fiber from the dispatch context. Returns when the fiber
    /// yields or terminates.
    ///
    /// # Safety
    ///
    /// Must run on the dispatch context itself (main or root fiber of a
    /// worker); the caller must hold the only reference to `self`.
    pub(crate) unsafe fn swap_in(&mut self) {
        let state = self.state();
        assert!(state.can_swap_in(), "swap_in of fiber {} in state {}", self.id, state);
        let sched = tls::sched_context();
        assert!(!sched.is_null(), "swap_in without a dispatch context");
        self.set_state(FiberState::Exec);
        tls::set_current_fiber(self as *mut Fiber);
        wlog::set_fiber_context(self.id);
        arch::context_switch(&mut (*sched).ctx, &self.ctx);
        tls::set_current_fiber(sched);
        wlog::set_fiber_context((*sched).id);
    }

    /// Resume this fiber from the thread's main context (caller-inclusive
    /// shutdown). The terminal switch comes back here because the fiber was
    /// built with `return_to_thread`.
    ///
    /// # Safety
    ///
    /// Must run on the thread's original stack, not inside another fiber.
    pub(crate) unsafe fn call(&mut self) {
        assert!(self.return_to_thread, "call() on a scheduler-owned fiber");
        let state = self.state();
        assert!(state.can_swap_in(), "call of fiber {} in state {}", self.id, state);
        let tf = tls::ensure_thread_fiber();
        self.set_state(FiberState::Exec);
        tls::set_current_fiber(self as *mut Fiber);
        wlog::set_fiber_context(self.id);
        arch::context_switch(&mut (*tf).ctx, &self.ctx);
        tls::set_current_fiber(tf);
        wlog::set_fiber_context(0);
    }

    /// Yield and stay runnable: the worker re-queues the fiber.
    pub fn yield_to_ready() {
        Self::yield_with(FiberState::Ready);
    }

    /// Yield and wait: something else must re-schedule the fiber.
    pub fn yield_to_hold() {
        Self::yield_with(FiberState::Hold);
    }

    fn yield_with(state: FiberState) {
        let cur = tls::current_fiber();
        let sched = tls::sched_context();
        // Off-fiber (or on the dispatch context itself) there is nothing to
        // yield to.
        if cur.is_null() || sched.is_null() || cur == sched {
            return;
        }
        unsafe {
            (*cur).set_state(state);
            tls::set_current_fiber(sched);
            wlog::set_fiber_context((*sched).id);
            arch::context_switch(&mut (*cur).ctx, &(*sched).ctx);
        }
    }

    /// Id of the fiber executing on this thread; 0 when off-fiber or on a
    /// thread's main fiber.
    pub fn current_id() -> u64 {
        let cur = tls::current_fiber();
        if cur.is_null() {
            0
        } else {
            unsafe { (*cur).id }
        }
    }

    /// Arena handle of the executing fiber; NONE for main fibers and fibers
    /// outside the arena.
    pub fn current_handle() -> FiberHandle {
        let cur = tls::current_fiber();
        if cur.is_null() {
            FiberHandle::NONE
        } else {
            unsafe { (*cur).handle }
        }
    }

    /// Live fibers across the process, main fibers included.
    pub fn total() -> u64 {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            let state = self.state();
            // Freeing a stack that is Ready/Hold/Exec would tear down a
            // suspended computation.
            assert!(
                state.can_reset(),
                "fiber {} dropped in state {}",
                self.id,
                state
            );
        }
    }
}

/// Runs on the fiber's own stack as its first and only frame under the
/// trampoline. Sets the terminal state; the trampoline then calls
/// `fiber_finish`.
extern "C" fn fiber_entry(arg: usize) {
    let fiber = arg as *mut Fiber;
    let f = unsafe { &mut *fiber };
    let cb = f.callback.take();
    let result = catch_unwind(AssertUnwindSafe(move || {
        if let Some(cb) = cb {
            cb();
        }
    }));
    match result {
        Ok(()) => f.set_state(FiberState::Term),
        Err(payload) => {
            werror!(target: "fiber", "fiber {} panicked: {}", f.id, panic_message(payload.as_ref()));
            f.set_state(FiberState::Except);
        }
    }
}

/// Terminal switch out of a finished fiber. Referenced by the arch
/// trampolines; never returns.
pub(crate) extern "C" fn fiber_finish() {
    let cur = tls::current_fiber();
    if cur.is_null() {
        werror!(target: "fiber", "fiber finished with no current-fiber slot");
        std::process::abort();
    }
    unsafe {
        let f = &mut *cur;
        let target = if f.return_to_thread {
            tls::thread_fiber()
        } else {
            tls::sched_context()
        };
        assert!(!target.is_null(), "fiber {} has no context to return to", f.id);
        tls::set_current_fiber(target);
        wlog::set_fiber_context((*target).id);
        arch::context_switch(&mut f.ctx, &(*target).ctx);
    }
    unreachable!("terminated fiber resumed");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
