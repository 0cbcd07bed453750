use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{FarmError, Result};
use crate::session::make_shared_dir;

/// Extension of per-frame log files.
pub const LOG_EXTENSION: &str = "rqlog";

/// `{base}/{job_name}/{frame_name}.rqlog`
pub fn frame_log_path(base: &Path, job_name: &str, frame_name: &str) -> PathBuf {
    base.join(job_name)
        .join(format!("{}.{}", frame_name, LOG_EXTENSION))
}

/// Keeps the first few output lines that look like errors.
#[derive(Debug, Clone)]
pub struct LogWatcher {
    patterns: Vec<String>,
    max_lines: usize,
    captured: Vec<String>,
}

impl LogWatcher {
    pub fn new(patterns: &[String], max_lines: usize) -> Self {
        Self {
            patterns: patterns.iter().map(|p| p.to_lowercase()).collect(),
            max_lines,
            captured: Vec::new(),
        }
    }

    /// Returns true when `line` was captured.
    pub fn observe(&mut self, line: &str) -> bool {
        if self.captured.len() >= self.max_lines {
            return false;
        }
        let lower = line.to_lowercase();
        if self.patterns.iter().any(|p| lower.contains(p.as_str())) {
            self.captured.push(line.trim_end().to_string());
            return true;
        }
        false
    }

    pub fn captured(&self) -> &[String] {
        &self.captured
    }
}

#[derive(Debug)]
enum LogEntry {
    Output(String),
    Banner(String),
}

/// Sending half handed to output readers.
#[derive(Debug, Clone)]
pub struct LogWriter {
    tx: mpsc::UnboundedSender<LogEntry>,
}

impl LogWriter {
    /// Append one line of frame output. Dropped silently once the log closed.
    pub fn line(&self, line: impl Into<String>) {
        let _ = self.tx.send(LogEntry::Output(line.into()));
    }

    /// Append launcher text without the timestamp prefix.
    pub fn banner(&self, text: impl Into<String>) {
        let _ = self.tx.send(LogEntry::Banner(text.into()));
    }
}

/// An open `.rqlog` file fed by a single writer task.
///
/// Output lines are prefixed with the seconds elapsed since the log was
/// opened and flushed one by one.
pub struct FrameLog {
    path: PathBuf,
    writer: LogWriter,
    task: JoinHandle<Result<Vec<String>>>,
}

impl FrameLog {
    pub async fn open(path: &Path, watcher: LogWatcher) -> Result<Self> {
        if let Some(dir) = path.parent() {
            make_shared_dir(dir).map_err(|e| FarmError::SessionPath {
                path: dir.display().to_string(),
                reason: e.to_string(),
            })?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_loop(file, rx, watcher));
        Ok(Self {
            path: path.to_path_buf(),
            writer: LogWriter { tx },
            task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn writer(&self) -> LogWriter {
        self.writer.clone()
    }

    pub fn line(&self, line: impl Into<String>) {
        self.writer.line(line);
    }

    pub fn banner(&self, text: impl Into<String>) {
        self.writer.banner(text);
    }

    /// Flush and close the log once every writer is gone. Returns the lines
    /// the watcher captured.
    pub async fn close(self) -> Result<Vec<String>> {
        drop(self.writer);
        self.task
            .await
            .map_err(|e| FarmError::Internal(format!("log writer task failed: {}", e)))?
    }
}

async fn write_loop(
    mut file: tokio::fs::File,
    mut rx: mpsc::UnboundedReceiver<LogEntry>,
    mut watcher: LogWatcher,
) -> Result<Vec<String>> {
    let opened = Instant::now();
    while let Some(entry) = rx.recv().await {
        let text = match entry {
            LogEntry::Output(line) => {
                watcher.observe(&line);
                format!("[{:>10.3}] {}\n", opened.elapsed().as_secs_f64(), line.trim_end())
            }
            LogEntry::Banner(text) => format!("{}\n", text.trim_end()),
        };
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
    }
    file.sync_all().await?;
    Ok(watcher.captured)
}
