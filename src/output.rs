//! Output handling for commands and service logs.
//!
//! Commands print either one JSON object or human-readable text. Service
//! output from a foreground run is prefixed per service on stdout and appended
//! to per-service log files with ANSI escapes removed.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use strip_ansi_escapes::strip;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// Prints a command result: pretty JSON when `json` is set, else `text()`.
pub fn print_result<T, F>(json: bool, data: &T, text: F) -> Result<()>
where
    T: Serialize,
    F: FnOnce() -> String,
{
    if json {
        let rendered = serde_json::to_string_pretty(data).context("failed to render JSON")?;
        println!("{}", rendered);
    } else {
        let rendered = text();
        if !rendered.is_empty() {
            println!("{}", rendered.trim_end());
        }
    }
    Ok(())
}

/// Prints an error to stderr, as JSON when requested.
pub fn print_error(json: bool, err: &anyhow::Error) {
    if json {
        let payload = serde_json::json!({ "ok": false, "error": format!("{:#}", err) });
        eprintln!("{}", payload);
    } else {
        eprintln!("error: {:#}", err);
    }
}

/// Sanitizes text for log files, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

const PREFIX_COLORS: [&str; 6] = ["36", "35", "33", "32", "34", "31"];

/// `[name] ` prefix padded to the longest name, colored by index when `color` is set.
pub fn service_prefix(name: &str, index: usize, width: usize, color: bool) -> String {
    let label = format!("[{}]", name);
    let padded = format!("{:<width$}", label, width = width + 2);
    if color {
        let code = PREFIX_COLORS[index % PREFIX_COLORS.len()];
        format!("\u{1b}[{}m{}\u{1b}[0m ", code, padded)
    } else {
        format!("{} ", padded)
    }
}

/// Supervisor's own messages, set apart from service output.
pub fn format_tool_message(text: &str) -> String {
    format!("◆ hstack: {}", text)
}

/// Append-only log file per service.
pub struct LogSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl LogSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn write_line(&mut self, line: &str) {
        let clean = sanitize_text(line, true);
        if writeln!(self.writer, "{}", clean).is_err() {
            tracing::debug!("failed to write log line to {}", self.path.display());
        }
    }

    pub fn flush(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Last `max` lines of a file; missing files read as empty.
pub fn read_last_lines(path: &Path, max: usize) -> Vec<String> {
    let Ok(file) = File::open(path) else {
        return Vec::new();
    };
    let mut tail: VecDeque<String> = VecDeque::with_capacity(max.min(1024));
    for line in BufReader::new(file).lines().map_while(|l| l.ok()) {
        if tail.len() == max {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect()
}
