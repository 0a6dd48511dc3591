//! # weft-core
//!
//! Platform-agnostic building blocks for the weft fiber runtime:
//! generation-checked fiber handles, the fiber state machine, error types,
//! a spin lock, leveled logging macros and environment helpers.

pub mod env;
pub mod error;
pub mod handle;
pub mod log;
pub mod spinlock;
pub mod state;

pub use env::{env_get, env_get_bool, env_get_opt};
pub use error::{WeftError, WeftResult};
pub use handle::FiberHandle;
pub use spinlock::SpinLock;
pub use state::FiberState;
