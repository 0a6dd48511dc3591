//! Fiber arena.
//!
//! Owns every scheduler-managed fiber as a boxed allocation in a slot
//! vector. Handles carry the slot's generation; recycling a slot bumps the
//! generation, so stale handles fail closed. A worker checks a fiber out
//! with `take` before resuming it; while checked out the slot stays
//! reserved, which is also how "executing elsewhere" is detected: `take`
//! on an empty live slot reports the fiber busy.

use crate::fiber::Fiber;
use weft_core::{FiberHandle, FiberState, SpinLock, WeftError, WeftResult};

struct Slot {
    generation: u32,
    live: bool,
    fiber: Option<Box<Fiber>>,
}

struct ArenaInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

pub struct FiberArena {
    inner: SpinLock<ArenaInner>,
}

impl FiberArena {
    pub fn new() -> Self {
        FiberArena {
            inner: SpinLock::new(ArenaInner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Store a fiber, returning its handle. The fiber learns its own handle
    /// so `Fiber::current_handle()` works once it runs.
    pub fn insert(&self, mut fiber: Box<Fiber>) -> FiberHandle {
        let mut inner = self.inner.lock();
        let index = match inner.free.pop() {
            Some(i) => i,
            None => {
                inner.slots.push(Slot {
                    generation: 1,
                    live: false,
                    fiber: None,
                });
                (inner.slots.len() - 1) as u32
            }
        };
        let slot = &mut inner.slots[index as usize];
        let handle = FiberHandle::new(index, slot.generation);
        fiber.set_handle(handle);
        slot.live = true;
        slot.fiber = Some(fiber);
        handle
    }

    /// Check a fiber out for execution. The slot stays reserved until
    /// `restore` or `discard`.
    pub fn take(&self, h: FiberHandle) -> WeftResult<Box<Fiber>> {
        let mut inner = self.inner.lock();
        let slot = Self::live_slot(&mut inner, h)?;
        slot.fiber.take().ok_or(WeftError::FiberBusy(h))
    }

    /// Check a fiber back in after it yielded or terminated.
    pub fn restore(&self, h: FiberHandle, fiber: Box<Fiber>) {
        let mut inner = self.inner.lock();
        match Self::live_slot(&mut inner, h) {
            Ok(slot) => {
                debug_assert!(slot.fiber.is_none(), "restore into occupied slot {}", h);
                slot.fiber = Some(fiber);
            }
            // The slot cannot be recycled while checked out; a mismatch
            // here is a runtime bug.
            Err(e) => unreachable!("restore of {}: {}", h, e),
        }
    }

    /// Free the slot of a checked-out fiber and drop the fiber.
    pub fn discard(&self, h: FiberHandle, fiber: Box<Fiber>) {
        drop(fiber);
        let mut inner = self.inner.lock();
        if let Ok(slot) = Self::live_slot(&mut inner, h) {
            debug_assert!(slot.fiber.is_none());
            slot.live = false;
            slot.generation = slot.generation.wrapping_add(1);
            inner.free.push(h.index());
        }
    }

    /// Free a checked-in fiber from outside the dispatch loop.
    pub fn remove(&self, h: FiberHandle) -> WeftResult<()> {
        let mut inner = self.inner.lock();
        let slot = Self::live_slot(&mut inner, h)?;
        if slot.fiber.is_none() {
            return Err(WeftError::FiberBusy(h));
        }
        slot.fiber = None;
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(h.index());
        Ok(())
    }

    /// Re-arm a terminal checked-in fiber with a new callback.
    pub fn reset(&self, h: FiberHandle, cb: Box<dyn FnOnce() + Send>) -> WeftResult<()> {
        let mut inner = self.inner.lock();
        let slot = Self::live_slot(&mut inner, h)?;
        let fiber = slot.fiber.as_mut().ok_or(WeftError::FiberBusy(h))?;
        let state = fiber.state();
        if !state.can_reset() {
            return Err(WeftError::InvalidState(state));
        }
        fiber.reset_boxed(cb);
        Ok(())
    }

    pub fn state(&self, h: FiberHandle) -> Option<FiberState> {
        let mut inner = self.inner.lock();
        match Self::live_slot(&mut inner, h) {
            Ok(slot) => Some(
                slot.fiber
                    .as_ref()
                    .map(|f| f.state())
                    .unwrap_or(FiberState::Exec),
            ),
            Err(_) => None,
        }
    }

    pub fn is_live(&self, h: FiberHandle) -> bool {
        let mut inner = self.inner.lock();
        Self::live_slot(&mut inner, h).is_ok()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.len() - inner.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_slot<'a>(inner: &'a mut ArenaInner, h: FiberHandle) -> WeftResult<&'a mut Slot> {
        if h.is_none() {
            return Err(WeftError::StaleHandle(h));
        }
        let slot = inner
            .slots
            .get_mut(h.index() as usize)
            .ok_or(WeftError::StaleHandle(h))?;
        if !slot.live || slot.generation != h.generation() {
            return Err(WeftError::StaleHandle(h));
        }
        Ok(slot)
    }
}

impl Default for FiberArena {
    fn default() -> Self {
        FiberArena::new()
    }
}
