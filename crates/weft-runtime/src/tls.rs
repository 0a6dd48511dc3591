//! Per-thread runtime slots.
//!
//! Every thread that touches the runtime carries: the fiber currently
//! executing, the lazily-created main fiber (the thread's original stack),
//! the dispatch-loop context yields return to, the worker index, and the
//! scheduler / io-manager handles for `current()` lookups. All switching
//! code reads and writes these slots explicitly.

use crate::fiber::Fiber;
use crate::iomanager::IoManager;
use crate::scheduler::Scheduler;
use std::cell::{Cell, RefCell};

thread_local! {
    static CURRENT_FIBER: Cell<*mut Fiber> = const { Cell::new(std::ptr::null_mut()) };
    static THREAD_FIBER: RefCell<Option<Box<Fiber>>> = const { RefCell::new(None) };
    static SCHED_CONTEXT: Cell<*mut Fiber> = const { Cell::new(std::ptr::null_mut()) };
    static WORKER_ID: Cell<isize> = const { Cell::new(-1) };
    static CURRENT_SCHEDULER: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
    static CURRENT_IO: RefCell<Option<IoManager>> = const { RefCell::new(None) };
}

#[inline]
pub(crate) fn current_fiber() -> *mut Fiber {
    CURRENT_FIBER.with(|c| c.get())
}

#[inline]
pub(crate) fn set_current_fiber(f: *mut Fiber) {
    CURRENT_FIBER.with(|c| c.set(f));
}

/// The thread's main fiber, creating it on first use.
pub(crate) fn ensure_thread_fiber() -> *mut Fiber {
    THREAD_FIBER.with(|tf| {
        let mut slot = tf.borrow_mut();
        if slot.is_none() {
            let mut main = Fiber::main();
            let ptr = &mut *main as *mut Fiber;
            *slot = Some(main);
            if current_fiber().is_null() {
                set_current_fiber(ptr);
            }
            return ptr;
        }
        slot.as_mut().map(|b| &mut **b as *mut Fiber).unwrap_or(std::ptr::null_mut())
    })
}

#[inline]
pub(crate) fn thread_fiber() -> *mut Fiber {
    THREAD_FIBER.with(|tf| {
        tf.borrow_mut()
            .as_mut()
            .map(|b| &mut **b as *mut Fiber)
            .unwrap_or(std::ptr::null_mut())
    })
}

#[inline]
pub(crate) fn sched_context() -> *mut Fiber {
    SCHED_CONTEXT.with(|c| c.get())
}

#[inline]
pub(crate) fn set_sched_context(f: *mut Fiber) {
    SCHED_CONTEXT.with(|c| c.set(f));
}

/// Worker index of this thread, `None` off the pool.
pub fn worker_id() -> Option<usize> {
    let id = WORKER_ID.with(|w| w.get());
    (id >= 0).then_some(id as usize)
}

pub(crate) fn set_worker_id(id: Option<usize>) {
    WORKER_ID.with(|w| w.set(id.map(|i| i as isize).unwrap_or(-1)));
}

pub(crate) fn current_scheduler() -> Option<Scheduler> {
    CURRENT_SCHEDULER.with(|s| s.borrow().clone())
}

pub(crate) fn set_current_scheduler(s: Option<Scheduler>) {
    CURRENT_SCHEDULER.with(|slot| *slot.borrow_mut() = s);
}

pub(crate) fn current_io() -> Option<IoManager> {
    CURRENT_IO.with(|s| s.borrow().clone())
}

pub(crate) fn set_current_io(s: Option<IoManager>) {
    CURRENT_IO.with(|slot| *slot.borrow_mut() = s);
}
