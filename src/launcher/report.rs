//! Reports pushed to the orchestrator.
//!
//! The transport is not ours: reports go to a [`ReportSink`]. The default
//! sink logs them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::HostCapacity;
use crate::error::ExitCategory;

use super::running::RunningFrameInfo;

/// Sent once when the launcher starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupReport {
    pub hostname: String,
    pub capacity: HostCapacity,
    pub container_mode: bool,
    pub version: String,
    pub booted_at: DateTime<Utc>,
}

/// Periodic snapshot of the host and its running frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub hostname: String,
    pub locked: bool,
    pub nimby: bool,
    pub reboot_pending: bool,
    pub capacity: HostCapacity,
    pub reserved_cores: f32,
    pub reserved_memory_kb: u64,
    pub reserved_gpu_memory_kb: u64,
    pub load_average: (f64, f64, f64),
    pub frames: Vec<RunningFrameInfo>,
    pub reported_at: DateTime<Utc>,
}

/// Completion record of one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameCompleteReport {
    pub frame_id: String,
    pub hostname: String,
    pub job_name: String,
    pub layer: String,
    pub frame: i64,
    pub frame_name: String,
    pub category: ExitCategory,
    pub exit_status: i32,
    pub exit_signal: i32,
    pub run_time_secs: f64,
    pub max_rss_kb: u64,
    pub max_gpu_memory_kb: u64,
    pub cores: f32,
    pub error_lines: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FrameCompleteReport {
    pub fn is_success(&self) -> bool {
        self.category.is_success()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "report", rename_all = "snake_case")]
pub enum Report {
    Startup(StartupReport),
    Status(StatusReport),
    FrameComplete(FrameCompleteReport),
}

/// Where reports go.
#[tonic::async_trait]
pub trait ReportSink: Send + Sync {
    async fn send(&self, report: Report);
}

/// Writes reports to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReportSink;

#[tonic::async_trait]
impl ReportSink for LogReportSink {
    async fn send(&self, report: Report) {
        match &report {
            Report::Startup(r) => {
                tracing::info!(host = %r.hostname, cores = r.capacity.cores, memory_kb = r.capacity.memory_kb, container_mode = r.container_mode, "Launcher started")
            }
            Report::Status(r) => {
                tracing::debug!(host = %r.hostname, frames = r.frames.len(), locked = r.locked, reserved_cores = r.reserved_cores, "Host status")
            }
            Report::FrameComplete(r) => {
                tracing::info!(
                    frame_id = %r.frame_id,
                    frame = %r.frame_name,
                    job = %r.job_name,
                    category = %r.category,
                    exit_status = r.exit_status,
                    exit_signal = r.exit_signal,
                    run_time = r.run_time_secs,
                    max_rss_kb = r.max_rss_kb,
                    "Frame complete"
                )
            }
        }
    }
}

/// Forwards reports over a channel; dropped reports are logged.
#[derive(Debug, Clone)]
pub struct ChannelReportSink {
    tx: mpsc::Sender<Report>,
}

impl ChannelReportSink {
    pub fn new(tx: mpsc::Sender<Report>) -> Self {
        Self { tx }
    }
}

#[tonic::async_trait]
impl ReportSink for ChannelReportSink {
    async fn send(&self, report: Report) {
        if self.tx.send(report).await.is_err() {
            tracing::warn!("Report receiver dropped");
        }
    }
}

/// Sends a [`StatusReport`] on a fixed interval until cancelled.
pub struct StatusReporter {
    interval: Duration,
}

impl StatusReporter {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
        }
    }

    pub async fn run(
        &self,
        launcher: Arc<super::FrameLauncher>,
        sink: Arc<dyn ReportSink>,
        shutdown: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = launcher.status().await;
                    sink.send(Report::Status(report)).await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }
}
