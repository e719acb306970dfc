//! Per-project output capture with bounded retention.
//!
//! Each project gets a fixed-capacity ring of its most recent lines, kept in
//! memory and mirrored to `<logs_dir>/<id>/output.log` as JSON lines. The
//! file is append-only between compactions; once it holds more than twice the
//! retained window it is rewritten (atomically) down to the ring contents.
//!
//! ## Layout
//!
//! ```text
//! <logs_dir>/{project_id}/
//!   output.log        one LogEntry per line
//! ```

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const LOG_FILENAME: &str = "output.log";

/// Where a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    Install,
    Supervisor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub line: String,
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ts = self.timestamp.format("%Y-%m-%d %H:%M:%S");
        match self.stream {
            LogStream::Stdout => write!(f, "{ts} {}", self.line),
            LogStream::Stderr => write!(f, "{ts} [stderr] {}", self.line),
            LogStream::Install => write!(f, "{ts} [install] {}", self.line),
            LogStream::Supervisor => write!(f, "{ts} [supervisor] {}", self.line),
        }
    }
}

/// Thread-safe log store shared by every project.
pub struct LogSink {
    dir: PathBuf,
    max_lines: usize,
    logs: Mutex<HashMap<String, Arc<Mutex<ProjectLog>>>>,
}

impl LogSink {
    /// Create a sink rooted at `dir`, retaining `max_lines` per project.
    pub fn new(dir: impl Into<PathBuf>, max_lines: usize) -> Self {
        Self {
            dir: dir.into(),
            max_lines: max_lines.max(1),
            logs: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_lines(&self) -> usize {
        self.max_lines
    }

    /// Path of the persisted log for `id`.
    pub fn log_path(&self, id: &str) -> PathBuf {
        self.dir.join(id).join(LOG_FILENAME)
    }

    /// Append one line. Persistence failures are logged; the line is still
    /// retained in memory.
    pub fn append(&self, id: &str, stream: LogStream, line: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            stream,
            line: line.into(),
        };
        let log = self.project_log(id);
        let mut guard = log.lock().unwrap_or_else(PoisonError::into_inner);
        guard.push(entry);
    }

    /// The most recent `max_lines` entries, oldest first.
    pub fn tail(&self, id: &str, max_lines: usize) -> Vec<LogEntry> {
        let log = self.project_log(id);
        let guard = log.lock().unwrap_or_else(PoisonError::into_inner);
        guard.ring.tail(max_lines)
    }

    /// Drop all retained and persisted lines for `id`.
    pub fn clear(&self, id: &str) {
        let removed = {
            let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
            logs.remove(id)
        };
        if let Some(log) = removed {
            let mut guard = log.lock().unwrap_or_else(PoisonError::into_inner);
            guard.ring.clear();
            guard.file = None;
        }
        let dir = self.dir.join(id);
        if let Err(e) = std::fs::remove_dir_all(&dir)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!("Failed to remove log directory {}: {e}", dir.display());
        }
    }

    fn project_log(&self, id: &str) -> Arc<Mutex<ProjectLog>> {
        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        let log = logs.entry(id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(ProjectLog::open(
                self.log_path(id),
                self.max_lines,
            )))
        });
        Arc::clone(log)
    }
}

/// In-memory ring plus the append handle for one project's file.
struct ProjectLog {
    path: PathBuf,
    ring: LineRing,
    file: Option<File>,
    /// Lines currently in the file, used to decide when to compact.
    file_lines: usize,
}

impl ProjectLog {
    /// Load whatever history survives on disk into a fresh ring.
    fn open(path: PathBuf, max_lines: usize) -> Self {
        let mut ring = LineRing::new(max_lines);
        let mut file_lines = 0;
        match File::open(&path) {
            Ok(file) => {
                for line in BufReader::new(file).lines() {
                    let Ok(line) = line else { break };
                    file_lines += 1;
                    match serde_json::from_str::<LogEntry>(&line) {
                        Ok(entry) => ring.push(entry),
                        Err(e) => tracing::debug!(
                            "Skipping malformed log line in {}: {e}",
                            path.display()
                        ),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to read {}: {e}", path.display()),
        }
        Self {
            path,
            ring,
            file: None,
            file_lines,
        }
    }

    fn push(&mut self, entry: LogEntry) {
        if let Err(e) = self.persist(&entry) {
            tracing::warn!("Failed to persist log line to {}: {e}", self.path.display());
            self.file = None;
        }
        self.ring.push(entry);
        if self.file_lines > self.ring.max.saturating_mul(2)
            && let Err(e) = self.compact()
        {
            tracing::warn!("Failed to compact {}: {e}", self.path.display());
        }
    }

    fn persist(&mut self, entry: &LogEntry) -> std::io::Result<()> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.file = Some(file);
        }
        let mut bytes = serde_json::to_vec(entry).map_err(std::io::Error::other)?;
        bytes.push(b'\n');
        if let Some(file) = self.file.as_mut() {
            file.write_all(&bytes)?;
        }
        self.file_lines += 1;
        Ok(())
    }

    /// Rewrite the file so it holds exactly the retained window.
    fn compact(&mut self) -> std::io::Result<()> {
        let mut data = Vec::new();
        for entry in self.ring.iter() {
            data.extend(serde_json::to_vec(entry).map_err(std::io::Error::other)?);
            data.push(b'\n');
        }
        atomic_write(&self.path, &data)?;
        self.file = None;
        self.file_lines = self.ring.len();
        Ok(())
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}

/// Fixed-capacity ring that evicts the oldest line when full.
struct LineRing {
    max: usize,
    buf: VecDeque<LogEntry>,
}

impl LineRing {
    fn new(capacity: usize) -> Self {
        Self {
            max: capacity,
            buf: VecDeque::with_capacity(capacity),
        }
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn clear(&mut self) {
        self.buf.clear();
    }

    fn push(&mut self, entry: LogEntry) {
        if self.buf.len() == self.max {
            self.buf.pop_front();
        }
        self.buf.push_back(entry);
    }

    fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.buf.iter()
    }

    fn tail(&self, n: usize) -> Vec<LogEntry> {
        let skip = self.buf.len().saturating_sub(n);
        self.buf.iter().skip(skip).cloned().collect()
    }
}
