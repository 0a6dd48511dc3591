//! # weft - stackful fiber runtime
//!
//! M:N cooperative concurrency: many lightweight fibers multiplexed over a
//! small pool of worker threads. Fibers are stackful (plain code, plain
//! call stacks, no async), switch in a few dozen nanoseconds, and park on
//! an epoll reactor when they would block on I/O or a timer.
//!
//! ## Quick start
//!
//! ```ignore
//! use weft::{Runtime, sleep_ms};
//!
//! fn main() {
//!     let rt = Runtime::builder()
//!         .name("app")
//!         .workers(4)
//!         .hook_io(true)
//!         .build()
//!         .unwrap();
//!
//!     rt.block_on(|| {
//!         rt.spawn(|| {
//!             // Looks blocking; only this fiber waits.
//!             sleep_ms(100);
//!             println!("tick");
//!         });
//!     });
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                     User code                          │
//! │        spawn(), yield_now(), FiberStream, sleep        │
//! └────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌────────────────────────────────────────────────────────┐
//! │                     Scheduler                          │
//! │     shared run queue, worker affinity, fiber arena     │
//! └────────────────────────────────────────────────────────┘
//!              │                            │
//!              ▼                            ▼
//!        ┌───────────┐               ┌─────────────┐
//!        │  Workers  │◄── tickle ───│   Reactor    │
//!        │ (fibers)  │               │ epoll+timers │
//!        └───────────┘               └─────────────┘
//! ```

// Core types and macros.
pub use weft_core::{
    env_get, env_get_bool, env_get_opt, FiberHandle, FiberState, SpinLock, WeftError, WeftResult,
};
pub use weft_core::{wdebug, werror, winfo, wtrace, wwarn};
pub use weft_core::log::{init as init_logging, set_flush_enabled, set_log_level, LogLevel};

// Runtime types.
pub use weft_runtime::{
    worker_id, Driver, Fiber, IoEvent, IoManager, RuntimeConfig, Scheduler, TimerId, YieldDriver,
};
pub use weft_runtime::config;

// I/O layer.
pub use weft_io::{
    fd_table, is_hook_enable, set_hook_enable, sleep, sleep_ms, FiberListener, FiberStream,
};
pub use weft_io::hook;

use std::io;

/// Handle owning an `IoManager` and its worker pool.
pub struct Runtime {
    iom: IoManager,
    hook_io: bool,
}

/// Configures and builds a [`Runtime`].
pub struct Builder {
    name: String,
    config: RuntimeConfig,
    include_caller: bool,
    hook_io: bool,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            name: "weft".to_string(),
            config: RuntimeConfig::from_env(),
            include_caller: false,
            hook_io: true,
        }
    }

    pub fn name(mut self, name: &str) -> Builder {
        self.name = name.to_string();
        self
    }

    pub fn workers(mut self, n: usize) -> Builder {
        self.config = self.config.with_workers(n);
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Builder {
        self.config = self.config.with_stack_size(bytes);
        self
    }

    /// Run the calling thread as one of the workers. `stop()` then drives
    /// remaining work inline before returning.
    pub fn include_caller(mut self, on: bool) -> Builder {
        self.include_caller = on;
        self
    }

    /// Enable the blocking-call hooks on every worker thread.
    pub fn hook_io(mut self, on: bool) -> Builder {
        self.hook_io = on;
        self
    }

    pub fn build(self) -> io::Result<Runtime> {
        init_logging();
        config::apply(&self.config)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let iom = IoManager::new(self.config.workers, self.include_caller, &self.name)?;
        if self.include_caller && self.hook_io {
            set_hook_enable(true);
        }
        Ok(Runtime {
            iom,
            hook_io: self.hook_io,
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

impl Runtime {
    /// Runtime with defaults from the environment.
    pub fn new(name: &str) -> io::Result<Runtime> {
        Builder::new().name(name).build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Spawn the worker pool.
    pub fn start(&self) -> WeftResult<()> {
        self.iom.start()?;
        if self.hook_io {
            for worker in 0..self.iom.worker_count() {
                self.iom
                    .schedule_call_to(|| set_hook_enable(true), Some(worker));
            }
        }
        Ok(())
    }

    /// Start, run `f`, then stop and join the pool.
    pub fn block_on<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let _ = self.start();
        let result = f();
        self.shutdown();
        result
    }

    pub fn spawn<F>(&self, f: F) -> FiberHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.iom.spawn(f)
    }

    /// The underlying io manager, for timers, events and raw scheduling.
    pub fn io(&self) -> &IoManager {
        &self.iom
    }

    /// Stop and join every worker; pending timers and registered events
    /// are drained first.
    pub fn shutdown(&self) {
        self.iom.stop();
    }
}

/// Spawn onto the current thread's scheduler. `None` off the pool.
pub fn spawn<F>(f: F) -> Option<FiberHandle>
where
    F: FnOnce() + Send + 'static,
{
    Scheduler::current().map(|s| s.spawn(f))
}

/// Voluntary yield point: requeue the current fiber and let another run.
/// A no-op outside a fiber.
#[inline]
pub fn yield_now() {
    Fiber::yield_to_ready();
}

/// Id of the current fiber, 0 off a fiber.
#[inline]
pub fn current_id() -> u64 {
    Fiber::current_id()
}

#[inline]
pub fn is_on_fiber() -> bool {
    Fiber::current_id() != 0
}
