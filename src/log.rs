//! Leveled file logging for conductor.
//!
//! - ERROR: a round or checkpoint could not be completed
//! - WARN: recoverable conditions (stale checkpoint, interrupted nodes, retries exhausted)
//! - INFO: round boundaries and final mission outcome
//! - DEBUG: node transitions, dispatch decisions, retry attempts
//! - TRACE: ready sets and timing samples
//!
//! `CONDUCTOR_DEBUG=1` (or `true`) turns on DEBUG; it also accepts a level
//! name such as `trace`. Nothing is written until one of the `init` functions
//! has run.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Level requested by a `CONDUCTOR_DEBUG` value, if any.
    fn from_debug_env(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "" | "0" | "false" => None,
            "1" | "true" => Some(LogLevel::Debug),
            other => other.parse().ok(),
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Log to `~/.conductor/conductor.log` at INFO.
pub fn init() {
    init_with_debug(false);
}

pub fn init_with_debug(debug: bool) {
    if let Some(dir) = dirs::home_dir().map(|h| h.join(".conductor")) {
        init_at(&dir.join("conductor.log"), debug);
    }
}

/// Log to `path`, truncating it.
///
/// The first call picks the file; later calls only adjust the level.
pub fn init_at(path: &Path, debug: bool) {
    let from_env = std::env::var("CONDUCTOR_DEBUG")
        .ok()
        .and_then(|v| LogLevel::from_debug_env(&v));
    let level = from_env.unwrap_or(LogLevel::Info);
    set_level(if debug { level.max(LogLevel::Debug) } else { level });

    if LOG_PATH.get().is_some() {
        return;
    }
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::write(path, "");
    LOG_PATH.set(path.to_path_buf()).ok();
}

/// Active log file, if logging was initialized.
pub fn log_path() -> Option<&'static Path> {
    LOG_PATH.get().map(|p| p.as_path())
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn get_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Append `msg` to the log file if `level` passes the current filter.
pub fn log_at(level: LogLevel, msg: &str) {
    if level > get_level() {
        return;
    }
    let Some(path) = LOG_PATH.get() else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
        let _ = writeln!(file, "[{}] [{:<5}] {}", timestamp, level.as_str(), msg);
    }
}

/// `clog!` logs at INFO; `clog_error!`, `clog_warn!`, `clog_debug!` and
/// `clog_trace!` log at their named level.
#[macro_export]
macro_rules! clog {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_error {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Error, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_warn {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Warn, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_debug {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Debug, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_trace {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Trace, &format!($($arg)*))
    };
}
