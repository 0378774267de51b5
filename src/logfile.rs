//! Combined service log files.
//!
//! Each supervised run writes one newline-delimited JSON log per service,
//! mixing the command's stdout and stderr with supervisor-internal diagnostics
//! (`messages`). Readers parse line-by-line and may follow the file from any
//! line offset, which is how the log-text readiness check works.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Supervisor-internal diagnostics, not produced by the command.
    Messages,
}

/// One record in the combined log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub name: String,
    pub time: DateTime<Utc>,
    pub stream: LogStream,
    pub message: String,
}

/// Append-only writer for a service's combined log.
///
/// Creating a writer rotates any log left over from a prior run to `.old`, so
/// line offsets within one run always start at zero.
pub struct LogWriter {
    name: String,
    file: Mutex<BufWriter<File>>,
    stdout_lines: AtomicU64,
    stderr_lines: AtomicU64,
}

impl LogWriter {
    pub fn create(name: &str, path: &Path) -> Result<Self> {
        rotate(path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            name: name.to_string(),
            file: Mutex::new(BufWriter::new(file)),
            stdout_lines: AtomicU64::new(0),
            stderr_lines: AtomicU64::new(0),
        })
    }

    /// Appends one record and flushes so followers observe it promptly.
    pub fn append(&self, stream: LogStream, message: &str) {
        match stream {
            LogStream::Stdout => {
                self.stdout_lines.fetch_add(1, Ordering::Relaxed);
            }
            LogStream::Stderr => {
                self.stderr_lines.fetch_add(1, Ordering::Relaxed);
            }
            LogStream::Messages => {}
        }
        let record = LogRecord {
            name: self.name.clone(),
            time: Utc::now(),
            stream,
            message: message.to_string(),
        };
        let Ok(line) = serde_json::to_string(&record) else {
            return;
        };
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{}", line);
            let _ = file.flush();
        }
    }

    pub fn stdout_lines(&self) -> u64 {
        self.stdout_lines.load(Ordering::Relaxed)
    }

    pub fn stderr_lines(&self) -> u64 {
        self.stderr_lines.load(Ordering::Relaxed)
    }
}

/// Moves an existing log aside to `<path>.old`. A no-op when the file does
/// not exist. The controller rotates before spawning a supervisor so a
/// leftover log from a prior run can never satisfy a log-text readiness
/// check; the writer rotates again on creation, which is then a no-op.
pub fn rotate(path: &Path) -> Result<()> {
    if path.exists() {
        let old = rotated_path(path);
        std::fs::rename(path, &old)
            .with_context(|| format!("failed to rotate {}", path.display()))?;
    }
    Ok(())
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".old");
    PathBuf::from(os)
}

/// Incremental reader over a combined log, tracking a line offset between
/// polls. Tolerates the file not existing yet and partially written trailing
/// lines.
pub struct LogFollower {
    path: PathBuf,
    line_offset: usize,
}

impl LogFollower {
    pub fn new(path: &Path, line_offset: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            line_offset,
        }
    }

    /// Returns records appended since the last call.
    pub fn read_new(&mut self) -> Vec<LogRecord> {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        let complete = match raw.rfind('\n') {
            Some(end) => &raw[..end],
            None => return Vec::new(),
        };
        let mut records = Vec::new();
        for line in complete.lines().skip(self.line_offset) {
            self.line_offset += 1;
            if let Ok(record) = serde_json::from_str::<LogRecord>(line) {
                records.push(record);
            }
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_follow_from_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("api.log");
        let writer = LogWriter::create("api", &path).unwrap();
        writer.append(LogStream::Stdout, "one");
        writer.append(LogStream::Stderr, "two");
        writer.append(LogStream::Messages, "supervisor note");

        let mut follower = LogFollower::new(&path, 1);
        let records = follower.read_new();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stream, LogStream::Stderr);
        assert_eq!(records[0].message, "two");
        assert_eq!(records[1].stream, LogStream::Messages);

        writer.append(LogStream::Stdout, "three");
        let more = follower.read_new();
        assert_eq!(more.len(), 1);
        assert_eq!(more[0].message, "three");

        assert_eq!(writer.stdout_lines(), 2);
        assert_eq!(writer.stderr_lines(), 1);
    }

    #[test]
    fn create_rotates_previous_run() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("api.log");
        {
            let writer = LogWriter::create("api", &path).unwrap();
            writer.append(LogStream::Stdout, "from the first run");
        }
        let writer = LogWriter::create("api", &path).unwrap();
        writer.append(LogStream::Stdout, "fresh");

        let mut follower = LogFollower::new(&path, 0);
        let records = follower.read_new();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "fresh");
        assert!(tmp.path().join("api.log.old").exists());
    }

    #[test]
    fn rotate_without_a_file_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("api.log");
        rotate(&path).unwrap();
        assert!(!tmp.path().join("api.log.old").exists());
    }

    #[test]
    fn follower_tolerates_missing_file() {
        let mut follower = LogFollower::new(Path::new("/nonexistent/railyard.log"), 0);
        assert!(follower.read_new().is_empty());
    }
}
