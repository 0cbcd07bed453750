use std::path::PathBuf;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::launcher::{
    FrameCompleteReport, FrameLauncher, LaunchOutcome, Reservation, RunFrame, RunningFrameInfo,
    ShutdownMode,
};
use crate::proto;
use crate::proto::launcher_service_server::LauncherService as LauncherServiceApi;

/// gRPC front of a [`FrameLauncher`].
pub struct LauncherService {
    launcher: Arc<FrameLauncher>,
}

impl LauncherService {
    pub fn new(launcher: Arc<FrameLauncher>) -> Self {
        Self { launcher }
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl TryFrom<proto::RunFrame> for RunFrame {
    type Error = Status;

    fn try_from(frame: proto::RunFrame) -> Result<Self, Self::Error> {
        if frame.session_path.trim().is_empty() {
            return Err(Status::invalid_argument("session_path cannot be empty"));
        }
        if frame.layer.trim().is_empty() {
            return Err(Status::invalid_argument("layer cannot be empty"));
        }
        let reservation = frame.reservation.unwrap_or_default();
        Ok(RunFrame {
            frame_id: if frame.frame_id.is_empty() {
                Uuid::new_v4().to_string()
            } else {
                frame.frame_id
            },
            session_path: PathBuf::from(frame.session_path),
            layer: frame.layer,
            frame: frame.frame,
            uid: frame.uid,
            gid: frame.gid,
            user_name: frame.user_name,
            env: frame.env.into_iter().collect(),
            log_dir: frame.log_dir.filter(|d| !d.is_empty()).map(PathBuf::from),
            reservation: Reservation {
                cores: reservation.cores,
                memory_kb: reservation.memory_kb,
                gpu_memory_kb: reservation.gpu_memory_kb,
            },
            os: frame.os.filter(|os| !os.is_empty()),
        })
    }
}

impl From<RunFrame> for proto::RunFrame {
    fn from(frame: RunFrame) -> Self {
        proto::RunFrame {
            frame_id: frame.frame_id,
            session_path: frame.session_path.display().to_string(),
            layer: frame.layer,
            frame: frame.frame,
            uid: frame.uid,
            gid: frame.gid,
            user_name: frame.user_name,
            env: frame.env.into_iter().collect(),
            log_dir: frame.log_dir.map(|d| d.display().to_string()),
            reservation: Some(proto::Reservation {
                cores: frame.reservation.cores,
                memory_kb: frame.reservation.memory_kb,
                gpu_memory_kb: frame.reservation.gpu_memory_kb,
            }),
            os: frame.os,
        }
    }
}

impl From<FrameCompleteReport> for proto::FrameComplete {
    fn from(report: FrameCompleteReport) -> Self {
        proto::FrameComplete {
            frame_id: report.frame_id,
            job_name: report.job_name,
            layer: report.layer,
            frame: report.frame,
            frame_name: report.frame_name,
            category: report.category.to_string(),
            exit_status: report.exit_status,
            exit_signal: report.exit_signal,
            run_time_secs: report.run_time_secs,
            max_rss_kb: report.max_rss_kb,
            error_lines: report.error_lines,
            message: report.message.unwrap_or_default(),
        }
    }
}

impl From<RunningFrameInfo> for proto::RunningFrameInfo {
    fn from(info: RunningFrameInfo) -> Self {
        proto::RunningFrameInfo {
            frame_id: info.frame_id,
            job_name: info.job_name,
            frame_name: info.frame_name,
            layer: info.layer,
            frame: info.frame,
            cores: info.cores,
            started_at: info.started_at.to_rfc3339(),
            rss_kb: info.stats.rss_kb,
            max_rss_kb: info.stats.max_rss_kb,
            cpu_secs: info.stats.cpu_secs,
            log_path: info.log_path.display().to_string(),
        }
    }
}

#[tonic::async_trait]
impl LauncherServiceApi for LauncherService {
    async fn launch_frame(
        &self,
        request: Request<proto::LaunchFrameRequest>,
    ) -> Result<Response<proto::LaunchFrameResponse>, Status> {
        let run_frame: RunFrame = request
            .into_inner()
            .run_frame
            .ok_or_else(|| Status::invalid_argument("run_frame is required"))?
            .try_into()?;

        let response = match self.launcher.launch(run_frame).await? {
            LaunchOutcome::Started { frame_id } => proto::LaunchFrameResponse {
                started: true,
                frame_id,
                completed: None,
            },
            LaunchOutcome::Finished(report) => proto::LaunchFrameResponse {
                started: false,
                frame_id: report.frame_id.clone(),
                completed: Some(report.into()),
            },
        };
        Ok(Response::new(response))
    }

    async fn get_status(
        &self,
        _request: Request<proto::GetStatusRequest>,
    ) -> Result<Response<proto::GetStatusResponse>, Status> {
        let status = self.launcher.status().await;
        Ok(Response::new(proto::GetStatusResponse {
            hostname: status.hostname,
            locked: status.locked,
            nimby: status.nimby,
            reboot_pending: status.reboot_pending,
            total_cores: status.capacity.cores,
            reserved_cores: status.reserved_cores,
            total_memory_kb: status.capacity.memory_kb,
            reserved_memory_kb: status.reserved_memory_kb,
            load_average: status.load_average.0,
            frames: status.frames.into_iter().map(Into::into).collect(),
        }))
    }

    async fn kill_frame(
        &self,
        request: Request<proto::KillFrameRequest>,
    ) -> Result<Response<proto::KillFrameResponse>, Status> {
        let req = request.into_inner();
        if req.frame_id.is_empty() {
            return Err(Status::invalid_argument("frame_id cannot be empty"));
        }
        let reason = if req.reason.is_empty() {
            "killed on request".to_string()
        } else {
            req.reason
        };
        self.launcher.kill(&req.frame_id, &reason).await?;
        Ok(Response::new(proto::KillFrameResponse {}))
    }

    async fn lock(
        &self,
        _request: Request<proto::LockRequest>,
    ) -> Result<Response<proto::LockResponse>, Status> {
        self.launcher.lock().await;
        Ok(Response::new(proto::LockResponse {}))
    }

    async fn unlock(
        &self,
        _request: Request<proto::UnlockRequest>,
    ) -> Result<Response<proto::UnlockResponse>, Status> {
        self.launcher.unlock().await;
        Ok(Response::new(proto::UnlockResponse {}))
    }

    async fn set_nimby(
        &self,
        request: Request<proto::SetNimbyRequest>,
    ) -> Result<Response<proto::SetNimbyResponse>, Status> {
        self.launcher.set_nimby(request.into_inner().enabled).await;
        Ok(Response::new(proto::SetNimbyResponse {}))
    }

    async fn reboot_idle(
        &self,
        _request: Request<proto::RebootIdleRequest>,
    ) -> Result<Response<proto::RebootIdleResponse>, Status> {
        let rebooting = self.launcher.reboot_idle().await;
        Ok(Response::new(proto::RebootIdleResponse { rebooting }))
    }

    async fn shutdown(
        &self,
        request: Request<proto::ShutdownRequest>,
    ) -> Result<Response<proto::ShutdownResponse>, Status> {
        let mode = match proto::ShutdownMode::try_from(request.into_inner().mode) {
            Ok(proto::ShutdownMode::Idle) => ShutdownMode::Idle,
            Ok(proto::ShutdownMode::Now) => ShutdownMode::Now,
            Err(_) => return Err(Status::invalid_argument("unknown shutdown mode")),
        };
        let running = self.launcher.shutdown(mode).await;
        Ok(Response::new(proto::ShutdownResponse {
            running_frames: running as u32,
        }))
    }
}
