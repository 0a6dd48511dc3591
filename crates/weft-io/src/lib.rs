//! Blocking-style I/O for fibers.
//!
//! Three layers: [`fd_table`] tracks per-fd state (socket classification,
//! forced nonblocking, timeouts), [`hook`] wraps the blocking syscalls so
//! a would-block result parks the calling fiber on the reactor, and
//! [`net`] offers `std::net`-shaped TCP types on top.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub mod fd_table;
        pub mod hook;
        pub mod net;

        pub use fd_table::{fd_table, FdContext, FdTable};
        pub use hook::{is_hook_enable, set_hook_enable, sleep, sleep_ms};
        pub use net::{FiberListener, FiberStream};
    } else {
        compile_error!("weft-io requires a unix platform");
    }
}
