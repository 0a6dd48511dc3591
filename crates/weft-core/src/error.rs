//! Runtime error types.

use crate::handle::FiberHandle;
use crate::state::FiberState;
use std::fmt;

pub type WeftResult<T> = Result<T, WeftError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeftError {
    /// `start()` called on a scheduler that is already running.
    AlreadyStarted,
    /// Worker thread could not be spawned.
    ThreadSpawn(String),
    /// The handle's generation no longer matches its arena slot.
    StaleHandle(FiberHandle),
    /// The fiber is checked out and executing on some worker.
    FiberBusy(FiberHandle),
    /// Operation not legal in the fiber's current state.
    InvalidState(FiberState),
}

impl fmt::Display for WeftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeftError::AlreadyStarted => write!(f, "scheduler already started"),
            WeftError::ThreadSpawn(e) => write!(f, "worker thread spawn failed: {}", e),
            WeftError::StaleHandle(h) => write!(f, "stale handle {}", h),
            WeftError::FiberBusy(h) => write!(f, "{} is executing", h),
            WeftError::InvalidState(s) => write!(f, "operation invalid in state {}", s),
        }
    }
}

impl std::error::Error for WeftError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let h = FiberHandle::new(1, 4);
        assert_eq!(
            WeftError::StaleHandle(h).to_string(),
            "stale handle fiber(1.4)"
        );
        assert_eq!(
            WeftError::InvalidState(FiberState::Exec).to_string(),
            "operation invalid in state Exec"
        );
        assert_eq!(
            WeftError::AlreadyStarted.to_string(),
            "scheduler already started"
        );
    }

    #[test]
    fn is_std_error() {
        fn takes_err(_: &dyn std::error::Error) {}
        takes_err(&WeftError::AlreadyStarted);
    }
}
