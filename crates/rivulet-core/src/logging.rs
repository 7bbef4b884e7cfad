//! Kernel-style leveled print macros for rivulet
//!
//! Thread-safe stderr logging with an optional flush-per-line mode, similar
//! to Linux kernel printk. All reactor diagnostics go through these macros;
//! the fatal class additionally terminates the process.
//!
//! # Environment Variables
//!
//! - `RVL_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//! - `RVL_FLUSH_EPRINT=1` - Flush stderr after each line (debugging crashes)
//!
//! # Usage
//!
//! ```ignore
//! use rivulet_core::{rdebug, rinfo, rwarn, rerror, rfatal};
//!
//! rinfo!("loop {:p} start looping", loop_ptr);
//! rwarn!("poll event buffer full, doubling to {}", cap);
//! rerror!("accept failed: errno {}", errno);
//! rfatal!("epoll_ctl add failed for fd {}", fd); // logs, then exits
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::env::{env_get, env_get_bool};
use crate::timestamp::Timestamp;

/// Log levels, lowest value = most severe
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
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

// Global configuration (initialized once, from env)
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize logging from environment variables.
///
/// Called automatically on first log; calling explicitly gives
/// deterministic initialization.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    FLUSH_ENABLED.store(env_get_bool("RVL_FLUSH_EPRINT", false), Ordering::Relaxed);
    let level: u8 = env_get("RVL_LOG_LEVEL", LogLevel::Info as u8);
    LOG_LEVEL.store(level.min(LogLevel::Trace as u8), Ordering::Relaxed);
}

/// Get current log level
#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level programmatically
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Check if a log level is enabled
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

/// Internal: leveled line to stderr, locked for atomic output
#[doc(hidden)]
pub fn _rlog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{}{} ", level.prefix(), Timestamp::now());
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

/// Internal: fatal line, always emitted, then process exit
#[doc(hidden)]
pub fn _rfatal_impl(args: std::fmt::Arguments<'_>) -> ! {
    let stderr = std::io::stderr();
    {
        let mut handle = stderr.lock();
        let _ = write!(handle, "[FATAL]{} ", Timestamp::now());
        let _ = handle.write_fmt(args);
        let _ = handle.write_all(b"\n");
        let _ = handle.flush();
    }
    std::process::exit(1);
}

/// Error level log
#[macro_export]
macro_rules! rerror {
    ($($arg:tt)*) => {{
        $crate::logging::_rlog_impl(
            $crate::logging::LogLevel::Error,
            format_args!($($arg)*)
        );
    }};
}

/// Warning level log
#[macro_export]
macro_rules! rwarn {
    ($($arg:tt)*) => {{
        $crate::logging::_rlog_impl(
            $crate::logging::LogLevel::Warn,
            format_args!($($arg)*)
        );
    }};
}

/// Info level log
#[macro_export]
macro_rules! rinfo {
    ($($arg:tt)*) => {{
        $crate::logging::_rlog_impl(
            $crate::logging::LogLevel::Info,
            format_args!($($arg)*)
        );
    }};
}

/// Debug level log
#[macro_export]
macro_rules! rdebug {
    ($($arg:tt)*) => {{
        $crate::logging::_rlog_impl(
            $crate::logging::LogLevel::Debug,
            format_args!($($arg)*)
        );
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! rtrace {
    ($($arg:tt)*) => {{
        $crate::logging::_rlog_impl(
            $crate::logging::LogLevel::Trace,
            format_args!($($arg)*)
        );
    }};
}

/// Fatal log: always emitted, then terminates the process.
///
/// Reserved for the unrecoverable class: multiplexer/listen descriptor
/// creation failure and epoll add/modify registration failure.
#[macro_export]
macro_rules! rfatal {
    ($($arg:tt)*) => {{
        $crate::logging::_rfatal_impl(format_args!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_order() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_level_from_u8() {
        assert_eq!(LogLevel::from_u8(0), LogLevel::Off);
        assert_eq!(LogLevel::from_u8(1), LogLevel::Error);
        assert_eq!(LogLevel::from_u8(5), LogLevel::Trace);
        assert_eq!(LogLevel::from_u8(200), LogLevel::Trace);
    }

    #[test]
    fn test_macros_compile() {
        set_log_level(LogLevel::Off);
        rerror!("error {}", 1);
        rwarn!("warn");
        rinfo!("info {}", "x");
        rdebug!("debug");
        rtrace!("trace");
    }
}
