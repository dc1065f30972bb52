//! Log formatting and output with ANSI colors
//!
//! Handles colorized console output plus plain-text file persistence
//! under logs/swabbot.log.

use super::tags::LogTag;
use chrono::Local;
use colored::*;
use once_cell::sync::Lazy;
use std::fs::{create_dir_all, OpenOptions};
use std::io::{stdout, ErrorKind, Write};
use std::sync::Mutex;

/// Log format widths for alignment
const TAG_WIDTH: usize = 10;
const STATUS_WIDTH: usize = 22;

const LOG_FILE_PATH: &str = "logs/swabbot.log";

static LOG_FILE: Lazy<Mutex<Option<std::fs::File>>> = Lazy::new(|| Mutex::new(None));

/// Open the log file, creating the logs directory if needed
pub fn init_file_logging() {
    if let Some(parent) = std::path::Path::new(LOG_FILE_PATH).parent() {
        let _ = create_dir_all(parent);
    }
    match OpenOptions::new().create(true).append(true).open(LOG_FILE_PATH) {
        Ok(file) => {
            if let Ok(mut guard) = LOG_FILE.lock() {
                *guard = Some(file);
            }
        }
        Err(e) => {
            eprintln!("Failed to open log file {}: {}", LOG_FILE_PATH, e);
        }
    }
}

/// Format and output a log message to console and file
pub fn format_and_log(tag: LogTag, status: &str, message: &str) {
    let now = Local::now();
    let time = now.format("%H:%M:%S").to_string();

    let tag_plain = tag.to_plain_string();
    let tag_padding = TAG_WIDTH.saturating_sub(tag_plain.len());
    let status_padding = STATUS_WIDTH.saturating_sub(status.len());

    let console_line = format!(
        "{} [{}]{} [{}]{} {}",
        time.dimmed(),
        tag.to_colored_string(),
        " ".repeat(tag_padding),
        format_status(status),
        " ".repeat(status_padding),
        message
    );
    print_stdout_safe(&console_line);

    let timestamp = now.format("%Y-%m-%d %H:%M:%S").to_string();
    let file_line = format!("{} [{}] [{}] {}", timestamp, tag_plain, status, message);
    write_to_file(&file_line);
}

/// Colorize the status token by severity
fn format_status(status: &str) -> ColoredString {
    match status {
        "ERROR" => status.red().bold(),
        "WARNING" => status.yellow().bold(),
        "DEBUG" | "VERBOSE" => status.bright_black(),
        s if s.contains("FAIL") || s.contains("ANOMALY") => status.red(),
        s if s.contains("SKIP") => status.yellow(),
        _ => status.normal(),
    }
}

/// Print to stdout, tolerating broken pipes when output is piped
fn print_stdout_safe(line: &str) {
    let mut out = stdout();
    if let Err(e) = writeln!(out, "{}", line) {
        if e.kind() != ErrorKind::BrokenPipe {
            eprintln!("stdout write failed: {}", e);
        }
    }
}

fn write_to_file(line: &str) {
    if let Ok(mut guard) = LOG_FILE.lock() {
        if let Some(ref mut file) = *guard {
            let _ = writeln!(file, "{}", line);
        }
    }
}

/// Flush pending file writes (called during shutdown)
pub fn flush_file_logging() {
    if let Ok(mut guard) = LOG_FILE.lock() {
        if let Some(ref mut file) = *guard {
            let _ = file.flush();
        }
    }
}
