//! Leveled stderr logging.
//!
//! Kernel-log-style output with mutex-locked lines, an optional per-line
//! flush for debugging crashes, named targets, and per-thread worker/fiber
//! context injected into the prefix.
//!
//! # Environment variables
//!
//! - `WEFT_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//! - `WEFT_LOG_FLUSH=1` - flush stderr after every line
//!
//! # Usage
//!
//! ```ignore
//! winfo!("worker {} started", id);
//! wdebug!(target: "reactor", "epoll woke with {} events", n);
//! werror!(target: "fiber", "callback panicked: {}", msg);
//! ```

use std::cell::Cell;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN ]",
            LogLevel::Info => "[INFO ]",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

thread_local! {
    // -1 means "not a worker thread"
    static WORKER_ID: Cell<isize> = const { Cell::new(-1) };
    // 0 means "not on a scheduled fiber"
    static FIBER_ID: Cell<u64> = const { Cell::new(0) };
}

/// Read env configuration. Runs implicitly on first log line.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Ok(val) = std::env::var("WEFT_LOG_FLUSH") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }
    if let Ok(val) = std::env::var("WEFT_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Warn,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

/// Tag this thread's log lines with a worker index. `None` clears the tag.
pub fn set_worker_context(id: Option<usize>) {
    WORKER_ID.with(|w| w.set(id.map(|i| i as isize).unwrap_or(-1)));
}

/// Tag this thread's log lines with the fiber currently executing (0 = none).
pub fn set_fiber_context(id: u64) {
    FIBER_ID.with(|f| f.set(id));
}

#[doc(hidden)]
pub fn _wlog_impl(level: LogLevel, target: &str, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let worker = WORKER_ID.with(|w| w.get());
    let fiber = FIBER_ID.with(|f| f.get());
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{} {}", level.prefix(), target);
    if worker >= 0 {
        let _ = write!(handle, " w{}", worker);
    }
    if fiber != 0 {
        let _ = write!(handle, " f{}", fiber);
    }
    let _ = handle.write_all(b": ");
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

/// Error level log.
#[macro_export]
macro_rules! werror {
    (target: $t:expr, $($arg:tt)*) => {{
        $crate::log::_wlog_impl($crate::log::LogLevel::Error, $t, format_args!($($arg)*));
    }};
    ($($arg:tt)*) => {{
        $crate::log::_wlog_impl($crate::log::LogLevel::Error, "weft", format_args!($($arg)*));
    }};
}

/// Warning level log.
#[macro_export]
macro_rules! wwarn {
    (target: $t:expr, $($arg:tt)*) => {{
        $crate::log::_wlog_impl($crate::log::LogLevel::Warn, $t, format_args!($($arg)*));
    }};
    ($($arg:tt)*) => {{
        $crate::log::_wlog_impl($crate::log::LogLevel::Warn, "weft", format_args!($($arg)*));
    }};
}

/// Info level log.
#[macro_export]
macro_rules! winfo {
    (target: $t:expr, $($arg:tt)*) => {{
        $crate::log::_wlog_impl($crate::log::LogLevel::Info, $t, format_args!($($arg)*));
    }};
    ($($arg:tt)*) => {{
        $crate::log::_wlog_impl($crate::log::LogLevel::Info, "weft", format_args!($($arg)*));
    }};
}

/// Debug level log.
#[macro_export]
macro_rules! wdebug {
    (target: $t:expr, $($arg:tt)*) => {{
        $crate::log::_wlog_impl($crate::log::LogLevel::Debug, $t, format_args!($($arg)*));
    }};
    ($($arg:tt)*) => {{
        $crate::log::_wlog_impl($crate::log::LogLevel::Debug, "weft", format_args!($($arg)*));
    }};
}

/// Trace level log (most verbose).
#[macro_export]
macro_rules! wtrace {
    (target: $t:expr, $($arg:tt)*) => {{
        $crate::log::_wlog_impl($crate::log::LogLevel::Trace, $t, format_args!($($arg)*));
    }};
    ($($arg:tt)*) => {{
        $crate::log::_wlog_impl($crate::log::LogLevel::Trace, "weft", format_args!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn from_u8_saturates() {
        assert_eq!(LogLevel::from_u8(0), LogLevel::Off);
        assert_eq!(LogLevel::from_u8(3), LogLevel::Info);
        assert_eq!(LogLevel::from_u8(200), LogLevel::Trace);
    }

    #[test]
    fn macros_compile() {
        set_log_level(LogLevel::Off);
        werror!("e {}", 1);
        wwarn!("w");
        winfo!(target: "sched", "i {}", 2);
        wdebug!(target: "reactor", "d");
        wtrace!("t");
        set_worker_context(Some(1));
        set_fiber_context(42);
        winfo!("tagged");
        set_worker_context(None);
        set_fiber_context(0);
    }
}
