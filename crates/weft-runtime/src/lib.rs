//! Stackful fibers and the cooperative M:N scheduler.
//!
//! A `Fiber` is a callback with its own mmap'd stack, switched to and from
//! worker threads by a handful of assembly instructions. The `Scheduler`
//! multiplexes fibers over a pool of workers; `IoManager` extends it with
//! an epoll reactor and a timer heap so blocked fibers park on readiness
//! instead of spinning.
//!
//! Threads never preempt a fiber. A fiber runs until it returns, panics,
//! or yields with [`Fiber::yield_to_ready`] / [`Fiber::yield_to_hold`].

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod arch;
        mod arena;
        mod stack;
        mod tls;

        pub mod config;
        pub mod fiber;
        pub mod iomanager;
        pub mod scheduler;
        pub mod thread;
        pub mod timer;

        pub use config::{RuntimeConfig, DEFAULT_STACK_SIZE, TIMEOUT_NONE};
        pub use fiber::Fiber;
        pub use iomanager::{IoEvent, IoManager};
        pub use scheduler::{Driver, Scheduler, YieldDriver};
        pub use thread::NamedThread;
        pub use timer::{TimerCallback, TimerId};
        pub use tls::worker_id;
    } else {
        compile_error!("weft-runtime requires a unix platform (mmap stacks, epoll)");
    }
}
