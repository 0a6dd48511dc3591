//! Fiber lifecycle states.
//!
//! ```text
//! Init ──swap_in──▶ Exec ──┬─▶ Term   (callback returned)
//!   ▲                      ├─▶ Except (callback panicked)
//!   │                      ├─▶ Ready  (yield_to_ready)
//! reset()                  └─▶ Hold   (yield_to_hold / hooked suspend)
//!   │                            │
//!   └── Term / Except      Ready/Hold ──swap_in──▶ Exec
//! ```

use std::fmt;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Created or reset, never resumed since.
    Init = 0,
    /// Suspended; will not run until something re-schedules it.
    Hold = 1,
    /// Currently running on some worker.
    Exec = 2,
    /// Callback returned.
    Term = 3,
    /// Suspended but runnable; the scheduler re-queues it.
    Ready = 4,
    /// Callback panicked; the panic was captured at the fiber boundary.
    Except = 5,
}

impl FiberState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Hold,
            2 => FiberState::Exec,
            3 => FiberState::Term,
            4 => FiberState::Ready,
            _ => FiberState::Except,
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Terminal states: the callback will never run again without a reset.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// States in which `reset()` may re-arm the fiber on the same stack.
    #[inline]
    pub fn can_reset(self) -> bool {
        matches!(
            self,
            FiberState::Init | FiberState::Term | FiberState::Except
        )
    }

    /// States from which a worker may swap the fiber in.
    #[inline]
    pub fn can_swap_in(self) -> bool {
        matches!(
            self,
            FiberState::Init | FiberState::Hold | FiberState::Ready
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            FiberState::Init => "Init",
            FiberState::Hold => "Hold",
            FiberState::Exec => "Exec",
            FiberState::Term => "Term",
            FiberState::Ready => "Ready",
            FiberState::Except => "Except",
        }
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        FiberState::from_u8(v)
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
