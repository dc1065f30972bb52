//! Structured logging for SwabBot
//!
//! Provides a compact logging API with:
//! - Standard log levels (Error/Warning/Info/Debug/Verbose)
//! - Per-module debug control via --debug-<module> flags
//! - Dual output: colored console + file persistence
//!
//! The free-form `log(tag, status, message)` call is the workhorse used by
//! the services; the level helpers route through the same filtering.

mod format;
mod levels;
mod tags;

pub use levels::LogLevel;
pub use tags::LogTag;

use crate::arguments;

/// Initialize the logger system
///
/// Call once at startup, before any logging occurs.
pub fn init() {
    format::init_file_logging();
}

/// Log with an explicit status word (e.g. "STARTUP", "CHECK_COMPLETE")
///
/// Status words "ERROR"/"WARNING"/"DEBUG"/"VERBOSE" are filtered like the
/// corresponding level helpers; everything else logs at Info.
pub fn log(tag: LogTag, status: &str, message: &str) {
    let level = match status {
        "ERROR" => LogLevel::Error,
        "WARNING" => LogLevel::Warning,
        "DEBUG" => LogLevel::Debug,
        "VERBOSE" => LogLevel::Verbose,
        _ => LogLevel::Info,
    };
    if !should_log(&tag, level) {
        return;
    }
    format::format_and_log(tag, status, message);
}

/// Log at ERROR level (always shown)
pub fn error(tag: LogTag, message: &str) {
    log(tag, "ERROR", message);
}

/// Log at WARNING level
pub fn warning(tag: LogTag, message: &str) {
    log(tag, "WARNING", message);
}

/// Log at INFO level
pub fn info(tag: LogTag, message: &str) {
    log(tag, "INFO", message);
}

/// Log at DEBUG level (only with --debug-<module> for the tag)
pub fn debug(tag: LogTag, message: &str) {
    log(tag, "DEBUG", message);
}

/// Force flush pending log writes (call during shutdown)
pub fn flush() {
    format::flush_file_logging();
}

/// Filtering rules:
/// 1. Errors and warnings always log
/// 2. Debug requires --debug-<module> for the tag
/// 3. Verbose requires --verbose
fn should_log(tag: &LogTag, level: LogLevel) -> bool {
    match level {
        LogLevel::Error | LogLevel::Warning | LogLevel::Info => true,
        LogLevel::Debug => arguments::is_debug_enabled_for(tag.to_debug_key()),
        LogLevel::Verbose => arguments::is_verbose_enabled(),
    }
}
