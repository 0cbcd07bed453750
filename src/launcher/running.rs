use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

use crate::error::ExitCategory;

use super::run_frame::RunFrame;
use super::sampler::ResourceSample;

/// Why the launcher is killing a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    Cancelled,
    TimedOut,
    Oom,
    Shutdown,
}

impl KillReason {
    pub fn category(&self) -> ExitCategory {
        match self {
            KillReason::Cancelled | KillReason::Shutdown => ExitCategory::Cancelled,
            KillReason::TimedOut => ExitCategory::TimedOut,
            KillReason::Oom => ExitCategory::Oom,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillRequest {
    /// Skip the grace period
    pub hard: bool,
    pub reason: KillReason,
    pub message: String,
}

impl KillRequest {
    pub fn soft(reason: KillReason, message: impl Into<String>) -> Self {
        Self {
            hard: false,
            reason,
            message: message.into(),
        }
    }

    pub fn hard(reason: KillReason, message: impl Into<String>) -> Self {
        Self {
            hard: true,
            reason,
            message: message.into(),
        }
    }
}

/// Latest samples of a running frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameStats {
    pub pid: Option<u32>,
    pub container_id: Option<String>,
    pub rss_kb: u64,
    pub max_rss_kb: u64,
    pub cpu_secs: f64,
    pub gpu_memory_kb: u64,
    pub max_gpu_memory_kb: u64,
}

/// Snapshot of a running frame for status reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningFrameInfo {
    pub frame_id: String,
    pub job_name: String,
    pub frame_name: String,
    pub layer: String,
    pub frame: i64,
    pub cores: f32,
    pub started_at: DateTime<Utc>,
    pub log_path: PathBuf,
    pub stats: FrameStats,
}

/// A frame the launcher has accepted and not yet reported.
#[derive(Debug)]
pub struct RunningFrame {
    pub run_frame: RunFrame,
    pub job_name: String,
    pub frame_name: String,
    pub log_path: PathBuf,
    pub started_at: DateTime<Utc>,
    stats: RwLock<FrameStats>,
    kill_tx: watch::Sender<Option<KillRequest>>,
}

impl RunningFrame {
    pub fn new(
        run_frame: RunFrame,
        job_name: String,
        frame_name: String,
        log_path: PathBuf,
    ) -> (Self, watch::Receiver<Option<KillRequest>>) {
        let (kill_tx, kill_rx) = watch::channel(None);
        let frame = Self {
            run_frame,
            job_name,
            frame_name,
            log_path,
            started_at: Utc::now(),
            stats: RwLock::new(FrameStats::default()),
            kill_tx,
        };
        (frame, kill_rx)
    }

    pub fn frame_id(&self) -> &str {
        &self.run_frame.frame_id
    }

    pub fn kill(&self, request: KillRequest) {
        tracing::info!(
            frame_id = %self.run_frame.frame_id,
            frame = %self.frame_name,
            reason = ?request.reason,
            hard = request.hard,
            message = %request.message,
            "Kill requested"
        );
        self.kill_tx.send_replace(Some(request));
    }

    pub async fn set_pid(&self, pid: Option<u32>) {
        self.stats.write().await.pid = pid;
    }

    pub async fn set_container(&self, id: &str) {
        self.stats.write().await.container_id = Some(id.to_string());
    }

    pub async fn record_sample(&self, sample: ResourceSample) {
        let mut stats = self.stats.write().await;
        stats.rss_kb = sample.rss_kb;
        stats.max_rss_kb = stats.max_rss_kb.max(sample.rss_kb);
        stats.cpu_secs = stats.cpu_secs.max(sample.cpu_secs);
    }

    pub async fn stats(&self) -> FrameStats {
        self.stats.read().await.clone()
    }

    pub async fn info(&self) -> RunningFrameInfo {
        RunningFrameInfo {
            frame_id: self.run_frame.frame_id.clone(),
            job_name: self.job_name.clone(),
            frame_name: self.frame_name.clone(),
            layer: self.run_frame.layer.clone(),
            frame: self.run_frame.frame,
            cores: self.run_frame.reservation.cores,
            started_at: self.started_at,
            log_path: self.log_path.clone(),
            stats: self.stats().await,
        }
    }
}
