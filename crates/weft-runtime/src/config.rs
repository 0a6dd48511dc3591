//! Runtime configuration.
//!
//! `RuntimeConfig` is built from `WEFT_*` environment variables or through
//! the builder methods, validated, and applied to process-global cells that
//! the runtime reads on every fiber/socket creation. `apply` may be called
//! again at any time to re-tune the defaults of future fibers and sockets.
//!
//! # Environment variables
//!
//! - `WEFT_WORKERS` - worker thread count (default: available parallelism)
//! - `WEFT_STACK_SIZE` - fiber stack bytes (default: 128 KiB)
//! - `WEFT_CONNECT_TIMEOUT_MS` - hooked connect timeout (default: none)
//! - `WEFT_RECV_TIMEOUT_MS` - default receive timeout (default: none)
//! - `WEFT_SEND_TIMEOUT_MS` - default send timeout (default: none)

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use weft_core::{env_get, env_get_opt, winfo};

pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Sentinel for "no timeout".
pub const TIMEOUT_NONE: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub workers: usize,
    pub stack_size: usize,
    pub connect_timeout_ms: u64,
    pub recv_timeout_ms: u64,
    pub send_timeout_ms: u64,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        RuntimeConfig {
            workers,
            stack_size: DEFAULT_STACK_SIZE,
            connect_timeout_ms: TIMEOUT_NONE,
            recv_timeout_ms: TIMEOUT_NONE,
            send_timeout_ms: TIMEOUT_NONE,
        }
    }

    pub fn from_env() -> Self {
        let d = Self::new();
        RuntimeConfig {
            workers: env_get("WEFT_WORKERS", d.workers),
            stack_size: env_get("WEFT_STACK_SIZE", d.stack_size),
            connect_timeout_ms: env_get_opt("WEFT_CONNECT_TIMEOUT_MS").unwrap_or(TIMEOUT_NONE),
            recv_timeout_ms: env_get_opt("WEFT_RECV_TIMEOUT_MS").unwrap_or(TIMEOUT_NONE),
            send_timeout_ms: env_get_opt("WEFT_SEND_TIMEOUT_MS").unwrap_or(TIMEOUT_NONE),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn with_recv_timeout_ms(mut self, ms: u64) -> Self {
        self.recv_timeout_ms = ms;
        self
    }

    pub fn with_send_timeout_ms(mut self, ms: u64) -> Self {
        self.send_timeout_ms = ms;
        self
    }

    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.stack_size < 16 * 1024 {
            return Err(ConfigError::StackTooSmall(self.stack_size));
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    ZeroWorkers,
    StackTooSmall(usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroWorkers => write!(f, "worker count must be at least 1"),
            ConfigError::StackTooSmall(n) => {
                write!(f, "stack size {} below the 16 KiB minimum", n)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// Process-global defaults, readable without a config handle. 0 / TIMEOUT_NONE
// mean "not applied yet".
static STACK_SIZE: AtomicUsize = AtomicUsize::new(0);
static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(TIMEOUT_NONE);
static RECV_TIMEOUT_MS: AtomicU64 = AtomicU64::new(TIMEOUT_NONE);
static SEND_TIMEOUT_MS: AtomicU64 = AtomicU64::new(TIMEOUT_NONE);

/// Publish `cfg` as the process-wide defaults for future fibers and sockets.
pub fn apply(cfg: &RuntimeConfig) -> Result<(), ConfigError> {
    cfg.validate()?;
    STACK_SIZE.store(cfg.stack_size, Ordering::Relaxed);
    CONNECT_TIMEOUT_MS.store(cfg.connect_timeout_ms, Ordering::Relaxed);
    RECV_TIMEOUT_MS.store(cfg.recv_timeout_ms, Ordering::Relaxed);
    SEND_TIMEOUT_MS.store(cfg.send_timeout_ms, Ordering::Relaxed);
    winfo!(target: "config", "applied: {:?}", cfg);
    Ok(())
}

/// Re-read `WEFT_*` variables and publish them.
pub fn reload_from_env() -> Result<(), ConfigError> {
    apply(&RuntimeConfig::from_env())
}

pub fn default_stack_size() -> usize {
    match STACK_SIZE.load(Ordering::Relaxed) {
        0 => DEFAULT_STACK_SIZE,
        n => n,
    }
}

pub fn default_connect_timeout_ms() -> Option<u64> {
    match CONNECT_TIMEOUT_MS.load(Ordering::Relaxed) {
        TIMEOUT_NONE => None,
        n => Some(n),
    }
}

pub fn default_recv_timeout_ms() -> Option<u64> {
    match RECV_TIMEOUT_MS.load(Ordering::Relaxed) {
        TIMEOUT_NONE => None,
        n => Some(n),
    }
}

pub fn default_send_timeout_ms() -> Option<u64> {
    match SEND_TIMEOUT_MS.load(Ordering::Relaxed) {
        TIMEOUT_NONE => None,
        n => Some(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(RuntimeConfig::new().validate().is_ok());
    }

    #[test]
    fn rejects_zero_workers() {
        let cfg = RuntimeConfig::new().with_workers(0);
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroWorkers));
    }

    #[test]
    fn rejects_tiny_stack() {
        let cfg = RuntimeConfig::new().with_stack_size(1024);
        assert!(matches!(cfg.validate(), Err(ConfigError::StackTooSmall(_))));
    }

    #[test]
    fn builder_chain() {
        let cfg = RuntimeConfig::new()
            .with_workers(2)
            .with_stack_size(64 * 1024)
            .with_recv_timeout_ms(250);
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.stack_size, 64 * 1024);
        assert_eq!(cfg.recv_timeout_ms, 250);
        assert_eq!(cfg.send_timeout_ms, TIMEOUT_NONE);
    }

    #[test]
    fn unapplied_globals_fall_back() {
        // Other tests may have applied a config; only check the fallback
        // when nothing was published yet.
        if STACK_SIZE.load(Ordering::Relaxed) == 0 {
            assert_eq!(default_stack_size(), DEFAULT_STACK_SIZE);
        }
    }

    #[test]
    fn from_env_reads_vars() {
        std::env::set_var("WEFT_RECV_TIMEOUT_MS", "77");
        let cfg = RuntimeConfig::from_env();
        assert_eq!(cfg.recv_timeout_ms, 77);
        std::env::remove_var("WEFT_RECV_TIMEOUT_MS");
    }
}
