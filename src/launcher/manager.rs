use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{LauncherConfig, MountConfig};
use crate::error::{ExitCategory, FarmError, Result};
use crate::modules::{frame_command, FrameCommand, ModuleRegistry};
use crate::outline::{load_outline, Outline};
use crate::tokens::FrameContext;

use super::container::{
    ContainerLedger, ContainerRuntime, ContainerSpec, DockerCli, CONTAINER_CREATE_LOCK, FRAME_LABEL,
};
use super::env::{build_frame_env, FrameEnvSource};
use super::logging::{frame_log_path, FrameLog, LogWatcher, LOG_EXTENSION};
use super::native::{self, NativeSpec};
use super::report::{FrameCompleteReport, LogReportSink, Report, ReportSink, StartupReport, StatusReport};
use super::reservation::ReservationBook;
use super::run_frame::RunFrame;
use super::running::{KillReason, KillRequest, RunningFrame, RunningFrameInfo};
use super::sampler::load_average;
use super::supervisor::{pipe_lines, supervise_container, supervise_native, ExitInfo, SupervisionPolicy};

/// How long output readers may linger after the frame exits.
const READER_DRAIN: Duration = Duration::from_secs(5);

/// Administrative state of the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostState {
    /// No new frames are accepted
    pub locked: bool,
    /// Frames are released when a local user becomes active
    pub nimby: bool,
    pub reboot_pending: bool,
    pub shutdown_pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Stop accepting frames and exit once the running ones finish
    Idle,
    /// Kill running frames and exit
    Now,
}

/// Result of handing a RunFrame to [`FrameLauncher::launch`].
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchOutcome {
    Started { frame_id: String },
    /// The frame finished without running, e.g. it was skipped or invalid
    Finished(FrameCompleteReport),
}

/// A validated frame, ready to run.
#[derive(Debug, Clone)]
struct PreparedFrame {
    run_frame: RunFrame,
    job_name: String,
    frame_name: String,
    log_path: PathBuf,
    command: Vec<String>,
    env: BTreeMap<String, String>,
    /// Session directory, needed inside a container by in-process frames
    session_path: PathBuf,
    in_process: bool,
}

/// Runs frames on this host.
pub struct FrameLauncher {
    config: Arc<LauncherConfig>,
    registry: Arc<ModuleRegistry>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    ledger: ContainerLedger,
    book: ReservationBook,
    running: RwLock<HashMap<String, Arc<RunningFrame>>>,
    running_count: watch::Sender<usize>,
    host: RwLock<HostState>,
    sink: Arc<dyn ReportSink>,
    shutdown: CancellationToken,
}

impl FrameLauncher {
    pub fn new(config: LauncherConfig, registry: ModuleRegistry) -> Self {
        let runtime: Option<Arc<dyn ContainerRuntime>> = if config.container_mode {
            Some(Arc::new(DockerCli::from_config(&config)))
        } else {
            None
        };
        let (running_count, _) = watch::channel(0);
        Self {
            ledger: ContainerLedger::new(&config.working_dir),
            book: ReservationBook::new(config.capacity.clone()),
            config: Arc::new(config),
            registry: Arc::new(registry),
            runtime,
            running: RwLock::new(HashMap::new()),
            running_count,
            host: RwLock::new(HostState::default()),
            sink: Arc::new(LogReportSink),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Cancelled once the launcher should exit.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn sink(&self) -> Arc<dyn ReportSink> {
        self.sink.clone()
    }

    /// Reap containers left by a previous run and announce the host.
    pub async fn start(&self) -> StartupReport {
        if let Some(runtime) = &self.runtime {
            let reaped = self.ledger.reap(runtime.as_ref()).await;
            if reaped > 0 {
                tracing::warn!(reaped, "Reaped containers from a previous run");
            }
        }
        let report = StartupReport {
            hostname: self.config.hostname.clone(),
            capacity: self.config.capacity.clone(),
            container_mode: self.config.container_mode,
            version: env!("CARGO_PKG_VERSION").to_string(),
            booted_at: Utc::now(),
        };
        self.sink.send(Report::Startup(report.clone())).await;
        report
    }

    // =========================================================================
    // Launch
    // =========================================================================

    /// Validate and admit `run_frame`, then run it in the background.
    ///
    /// Host-level refusals (locked, duplicate, no capacity) are errors.
    /// Frame-level faults produce a completion report instead.
    pub async fn launch(self: &Arc<Self>, run_frame: RunFrame) -> Result<LaunchOutcome> {
        self.check_accepting().await?;
        let prepared = match self.prepare(&run_frame).await {
            Ok(prepared) => prepared,
            Err(err) => return Ok(LaunchOutcome::Finished(self.reject(&run_frame, err).await)),
        };
        let (frame, kill_rx) = self.admit(&prepared).await?;
        let frame_id = prepared.run_frame.frame_id.clone();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.execute(prepared, frame, kill_rx).await;
        });
        Ok(LaunchOutcome::Started { frame_id })
    }

    /// Run `run_frame` to completion.
    pub async fn run(&self, run_frame: RunFrame) -> Result<FrameCompleteReport> {
        self.check_accepting().await?;
        let prepared = match self.prepare(&run_frame).await {
            Ok(prepared) => prepared,
            Err(err) => return Ok(self.reject(&run_frame, err).await),
        };
        let (frame, kill_rx) = self.admit(&prepared).await?;
        Ok(self.execute(prepared, frame, kill_rx).await)
    }

    async fn check_accepting(&self) -> Result<()> {
        let host = self.host.read().await;
        if host.shutdown_pending {
            return Err(FarmError::HostLocked("host is shutting down".to_string()));
        }
        if host.reboot_pending {
            return Err(FarmError::HostLocked("host is waiting to reboot".to_string()));
        }
        if host.locked {
            return Err(FarmError::HostLocked("host is locked".to_string()));
        }
        Ok(())
    }

    async fn load_outline_retrying(&self, path: &Path) -> Result<Outline> {
        match self.load_outline(path).await {
            Err(err) if err.is_retryable() => {
                tracing::warn!(session = %path.display(), error = %err, "Session unreadable, retrying once");
                tokio::time::sleep(Duration::from_millis(self.config.session_retry_backoff_ms)).await;
                self.load_outline(path).await
            }
            other => other,
        }
    }

    async fn load_outline(&self, path: &Path) -> Result<Outline> {
        let registry = self.registry.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || load_outline(&path, &registry))
            .await
            .map_err(|e| FarmError::Internal(format!("outline loader failed: {}", e)))?
    }

    /// Input validation, environment and command assembly.
    async fn prepare(&self, run_frame: &RunFrame) -> Result<PreparedFrame> {
        let outline = self.load_outline_retrying(&run_frame.session_path).await?;
        let mut layer = outline.get_layer(&run_frame.layer)?.clone();

        let frames = layer.frame_set(&outline)?;
        if !frames.contains(run_frame.frame) {
            return Err(FarmError::FrameOutOfRange {
                layer: run_frame.layer.clone(),
                frame: run_frame.frame,
            });
        }
        if let Some(uid) = outline.uid() {
            if uid != run_frame.uid {
                return Err(FarmError::UidMismatch {
                    expected: uid,
                    actual: run_frame.uid,
                });
            }
        }

        let session = outline
            .session()
            .ok_or_else(|| FarmError::Internal("loaded outline has no session".to_string()))?;
        let outputs_loaded = layer.prepare(session)?;
        tracing::info!(
            layer = %layer.name(),
            frame = run_frame.frame,
            outputs_loaded,
            "Layer scope inspected"
        );

        let job_name = outline.job_name();
        let local = frames.local_frame_set(run_frame.frame, layer.chunk_size())?;
        let context = FrameContext::new(
            &job_name,
            layer.name(),
            run_frame.frame,
            &local,
            layer.chunk_size(),
        );
        let frame_name = context.frame_name();

        let strategy = frame_command(&self.registry, &layer, &local)?;
        let in_process = strategy == FrameCommand::InProcess;
        let command = match strategy {
            FrameCommand::Direct(command) => context.substitute_all(&command),
            FrameCommand::InProcess => vec![
                self.config.executor_path.display().to_string(),
                "execute".to_string(),
                "--session".to_string(),
                session.path().display().to_string(),
                "--layer".to_string(),
                layer.name().to_string(),
                "--frame".to_string(),
                run_frame.frame.to_string(),
            ],
        };

        let log_base = run_frame
            .log_dir
            .clone()
            .unwrap_or_else(|| self.config.log_root.clone());
        let log_path = frame_log_path(&log_base, &job_name, &frame_name);
        let log_file = format!("{}.{}", frame_name, LOG_EXTENSION);
        let outline_env = outline.frame_env(&layer, &frames)?;
        let env = build_frame_env(&FrameEnvSource {
            config: &self.config,
            user_name: &run_frame.user_name,
            show: outline.show(),
            shot: outline.shot(),
            frame: &context,
            log_file: &log_file,
            outline_env: &outline_env,
            overrides: &run_frame.env,
        });

        Ok(PreparedFrame {
            run_frame: run_frame.clone(),
            job_name,
            frame_name,
            log_path,
            command,
            env,
            session_path: session.path().to_path_buf(),
            in_process,
        })
    }

    /// Reservation bookkeeping; the frame is visible to kill and status
    /// from here on.
    async fn admit(
        &self,
        prepared: &PreparedFrame,
    ) -> Result<(Arc<RunningFrame>, watch::Receiver<Option<KillRequest>>)> {
        self.check_accepting().await?;
        let run_frame = &prepared.run_frame;
        let key = run_frame.dispatch_key();
        self.book.reserve(&key, run_frame.reservation).await?;

        let mut running = self.running.write().await;
        if running.contains_key(&run_frame.frame_id) {
            self.book.release(&key).await;
            return Err(FarmError::DuplicateFrame(run_frame.frame_id.clone()));
        }
        let (frame, kill_rx) = RunningFrame::new(
            run_frame.clone(),
            prepared.job_name.clone(),
            prepared.frame_name.clone(),
            prepared.log_path.clone(),
        );
        let frame = Arc::new(frame);
        running.insert(run_frame.frame_id.clone(), frame.clone());
        self.running_count.send_replace(running.len());
        Ok((frame, kill_rx))
    }

    async fn reject(&self, run_frame: &RunFrame, err: FarmError) -> FrameCompleteReport {
        let category = err.category();
        if category == ExitCategory::Skipped {
            tracing::info!(frame_id = %run_frame.frame_id, layer = %run_frame.layer, frame = run_frame.frame, "Frame outside layer range, skipped");
        } else {
            tracing::warn!(frame_id = %run_frame.frame_id, layer = %run_frame.layer, frame = run_frame.frame, category = %category, error = %err, "Frame rejected");
        }
        let report = FrameCompleteReport {
            frame_id: run_frame.frame_id.clone(),
            hostname: self.config.hostname.clone(),
            job_name: String::new(),
            layer: run_frame.layer.clone(),
            frame: run_frame.frame,
            frame_name: format!("{:04}-{}", run_frame.frame, run_frame.layer),
            category,
            exit_status: 0,
            exit_signal: 0,
            run_time_secs: 0.0,
            max_rss_kb: 0,
            max_gpu_memory_kb: 0,
            cores: run_frame.reservation.cores,
            error_lines: Vec::new(),
            log_path: None,
            message: Some(err.to_string()),
        };
        self.sink.send(Report::FrameComplete(report.clone())).await;
        report
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn policy(&self, run_frame: &RunFrame) -> SupervisionPolicy {
        let memory_limit_kb = (self.config.enforce_memory_limit
            && !self.config.container_mode
            && run_frame.reservation.memory_kb > 0)
            .then_some(run_frame.reservation.memory_kb);
        SupervisionPolicy {
            sample_interval: Duration::from_millis(self.config.sample_interval_ms.max(1)),
            kill_grace: Duration::from_millis(self.config.kill_grace_ms),
            max_wall_time: self.config.max_wall_time_secs.map(Duration::from_secs),
            memory_limit_kb,
            log_interval: Duration::from_millis(self.config.container_log_interval_ms.max(1)),
        }
    }

    async fn execute(
        &self,
        prepared: PreparedFrame,
        frame: Arc<RunningFrame>,
        kill_rx: watch::Receiver<Option<KillRequest>>,
    ) -> FrameCompleteReport {
        let started = Instant::now();
        tracing::info!(
            frame_id = %prepared.run_frame.frame_id,
            frame = %prepared.frame_name,
            job = %prepared.job_name,
            command = ?prepared.command,
            "Starting frame"
        );

        let outcome = self.run_logged(&prepared, &frame, kill_rx, started).await;
        let stats = frame.stats().await;
        self.finish(&prepared.run_frame).await;

        let (category, exit, error_lines, message) = match outcome {
            Ok((exit, lines)) => {
                let message = exit
                    .killed
                    .as_ref()
                    .map(|k| k.message.clone())
                    .or_else(|| exit.failure.clone());
                (exit.category(), exit, lines, message)
            }
            Err(err) => {
                tracing::error!(frame = %prepared.frame_name, error = %err, "Frame failed to launch");
                let category = match err.category() {
                    ExitCategory::SessionIo | ExitCategory::Usage => ExitCategory::FailedLaunch,
                    other => other,
                };
                (category, ExitInfo::default(), Vec::new(), Some(err.to_string()))
            }
        };

        let report = FrameCompleteReport {
            frame_id: prepared.run_frame.frame_id.clone(),
            hostname: self.config.hostname.clone(),
            job_name: prepared.job_name.clone(),
            layer: prepared.run_frame.layer.clone(),
            frame: prepared.run_frame.frame,
            frame_name: prepared.frame_name.clone(),
            category,
            exit_status: exit.exit_status,
            exit_signal: exit.exit_signal,
            run_time_secs: started.elapsed().as_secs_f64(),
            max_rss_kb: stats.max_rss_kb,
            max_gpu_memory_kb: stats.max_gpu_memory_kb,
            cores: prepared.run_frame.reservation.cores,
            error_lines,
            log_path: Some(prepared.log_path.clone()),
            message,
        };
        self.sink.send(Report::FrameComplete(report.clone())).await;
        self.after_frame().await;
        report
    }

    async fn run_logged(
        &self,
        prepared: &PreparedFrame,
        frame: &RunningFrame,
        kill_rx: watch::Receiver<Option<KillRequest>>,
        started: Instant,
    ) -> Result<(ExitInfo, Vec<String>)> {
        let watcher = LogWatcher::new(&self.config.error_patterns, self.config.max_error_lines);
        let log = FrameLog::open(&prepared.log_path, watcher).await?;
        log.banner(self.header(prepared));

        let result = if self.config.container_mode {
            self.run_container(prepared, frame, kill_rx, &log).await
        } else {
            self.run_native(prepared, frame, kill_rx, &log).await
        };

        match &result {
            Ok(exit) => {
                let stats = frame.stats().await;
                log.banner(format!(
                    "{}\n  exit status {}  signal {}  category {}\n  run time    {:.3}s\n  max rss     {} KiB\n  ended       {}\n{}",
                    "=".repeat(72),
                    exit.exit_status,
                    exit.exit_signal,
                    exit.category(),
                    started.elapsed().as_secs_f64(),
                    stats.max_rss_kb,
                    Utc::now().to_rfc3339(),
                    "=".repeat(72),
                ));
            }
            Err(err) => log.banner(format!("[launcher] frame failed to start: {}", err)),
        }
        let error_lines = log.close().await?;
        result.map(|exit| (exit, error_lines))
    }

    fn header(&self, prepared: &PreparedFrame) -> String {
        format!(
            "{}\nframefarm frame {} of job {}\n  frame id    {}\n  host        {}\n  user        {} ({})\n  started     {}\n  command     {}\n{}",
            "=".repeat(72),
            prepared.frame_name,
            prepared.job_name,
            prepared.run_frame.frame_id,
            self.config.hostname,
            prepared.run_frame.user_name,
            prepared.run_frame.uid,
            Utc::now().to_rfc3339(),
            prepared.command.join(" "),
            "=".repeat(72),
        )
    }

    async fn run_native(
        &self,
        prepared: &PreparedFrame,
        frame: &RunningFrame,
        kill_rx: watch::Receiver<Option<KillRequest>>,
        log: &FrameLog,
    ) -> Result<ExitInfo> {
        let spec = NativeSpec {
            command: prepared.command.clone(),
            env: prepared.env.clone(),
            working_dir: self.config.working_dir.clone(),
            uid: prepared.run_frame.uid,
            gid: prepared.run_frame.gid,
            rlimits: self.config.rlimits.clone(),
        };
        let mut child = native::spawn(&spec)?;

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(pipe_lines(stdout, log.writer()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(pipe_lines(stderr, log.writer()));
        }

        let exit = supervise_native(child, frame, kill_rx, self.policy(&prepared.run_frame)).await;

        for mut reader in readers {
            if tokio::time::timeout(READER_DRAIN, &mut reader).await.is_err() {
                tracing::debug!(frame = %prepared.frame_name, "Output still open after exit, closing");
                reader.abort();
            }
        }
        Ok(exit)
    }

    async fn run_container(
        &self,
        prepared: &PreparedFrame,
        frame: &RunningFrame,
        kill_rx: watch::Receiver<Option<KillRequest>>,
        log: &FrameLog,
    ) -> Result<ExitInfo> {
        let runtime = self
            .runtime
            .clone()
            .ok_or_else(|| FarmError::FailedLaunch("container mode without a runtime".to_string()))?;
        let run_frame = &prepared.run_frame;
        let image = self.config.image_for(run_frame.os.as_deref())?;

        let mounts = self.container_mounts(prepared)?;
        let mut labels = BTreeMap::new();
        labels.insert(FRAME_LABEL.to_string(), run_frame.frame_id.clone());
        let spec = ContainerSpec {
            name: format!("framefarm-{}", run_frame.frame_id),
            image: image.clone(),
            command: prepared.command.clone(),
            env: prepared.env.clone(),
            working_dir: self.config.working_dir.clone(),
            mounts,
            hostname: self.config.hostname.clone(),
            mem_reservation_kb: run_frame.reservation.memory_kb,
            mem_limit_kb: run_frame.reservation.memory_kb,
            user: format!("{}:{}", run_frame.uid, run_frame.gid.unwrap_or(run_frame.uid)),
            gpus: self.config.gpu_mode,
            labels,
        };

        let created = {
            let _create = CONTAINER_CREATE_LOCK.lock().await;
            runtime.run(&spec).await
        };
        let handle = match created {
            Ok(handle) => handle,
            Err(first) => {
                tracing::info!(image = %image, error = %first, "Container create failed, pulling image");
                runtime.pull(&image).await?;
                let _create = CONTAINER_CREATE_LOCK.lock().await;
                runtime.run(&spec).await?
            }
        };
        if let Err(e) = self.ledger.record(&run_frame.frame_id, &handle) {
            tracing::warn!(container = %handle.id, error = %e, "Failed to record container id");
        }
        tracing::info!(frame = %prepared.frame_name, container = %handle.id, image = %image, "Container started");

        let exit = supervise_container(
            runtime.as_ref(),
            &handle,
            frame,
            kill_rx,
            self.policy(run_frame),
            log.writer(),
        )
        .await;

        if let Err(e) = runtime.remove(&handle).await {
            tracing::warn!(container = %handle.id, error = %e, "Failed to remove container");
        }
        self.ledger.forget(&handle);
        Ok(exit)
    }

    /// Configured mounts, plus the executor binary and the session for
    /// frames that re-enter `execute` inside the container.
    fn container_mounts(&self, prepared: &PreparedFrame) -> Result<Vec<MountConfig>> {
        let mut mounts = self.config.mounts.clone();
        if !prepared.in_process {
            return Ok(mounts);
        }
        let executor = &self.config.executor_path;
        if !executor.is_absolute() || !executor.is_file() {
            return Err(FarmError::FailedLaunch(format!(
                "in-process frame needs the executor at an absolute path, {} is not a file",
                executor.display()
            )));
        }
        let bind = |path: &Path, read_only: bool| MountConfig {
            source: path.display().to_string(),
            target: path.display().to_string(),
            read_only,
        };
        mounts.push(bind(executor, true));
        mounts.push(bind(&prepared.session_path, false));
        Ok(mounts)
    }

    /// Release everything the frame held.
    async fn finish(&self, run_frame: &RunFrame) {
        self.book.release(&run_frame.dispatch_key()).await;
        let mut running = self.running.write().await;
        running.remove(&run_frame.frame_id);
        self.running_count.send_replace(running.len());
    }

    async fn after_frame(&self) {
        if self.running.read().await.is_empty() {
            let host = *self.host.read().await;
            if host.reboot_pending {
                self.reboot().await;
            } else if host.shutdown_pending {
                tracing::info!("Last frame finished, shutting down");
                self.shutdown.cancel();
            }
        }
    }

    // =========================================================================
    // Host operations
    // =========================================================================

    /// Ask a running frame to stop. It is reported as cancelled.
    pub async fn kill(&self, frame_id: &str, reason: &str) -> Result<()> {
        let frame = self
            .running
            .read()
            .await
            .get(frame_id)
            .cloned()
            .ok_or_else(|| FarmError::FrameNotFound(frame_id.to_string()))?;
        frame.kill(KillRequest::soft(KillReason::Cancelled, reason));
        Ok(())
    }

    async fn kill_all(&self, request: KillRequest) -> usize {
        let running = self.running.read().await;
        for frame in running.values() {
            frame.kill(request.clone());
        }
        running.len()
    }

    pub async fn lock(&self) {
        self.host.write().await.locked = true;
        tracing::info!("Host locked");
    }

    pub async fn unlock(&self) {
        self.host.write().await.locked = false;
        tracing::info!("Host unlocked");
    }

    pub async fn set_nimby(&self, enabled: bool) {
        self.host.write().await.nimby = enabled;
        tracing::info!(enabled, "NIMBY changed");
    }

    /// A local user became active. With NIMBY on the host locks and its
    /// frames are killed; returns how many.
    pub async fn user_active(&self) -> usize {
        {
            let mut host = self.host.write().await;
            if !host.nimby {
                return 0;
            }
            host.locked = true;
        }
        let killed = self
            .kill_all(KillRequest::hard(KillReason::Cancelled, "released to local user"))
            .await;
        tracing::info!(killed, "Host released to local user");
        killed
    }

    /// Reboot once the host is idle. Returns true when it rebooted now.
    pub async fn reboot_idle(&self) -> bool {
        self.host.write().await.reboot_pending = true;
        if self.running.read().await.is_empty() {
            self.reboot().await;
            return true;
        }
        tracing::info!("Reboot scheduled for when the host is idle");
        false
    }

    async fn reboot(&self) {
        self.host.write().await.reboot_pending = false;
        let Some((program, args)) = self.config.reboot_command.split_first() else {
            tracing::warn!("No reboot command configured");
            return;
        };
        tracing::warn!(command = ?self.config.reboot_command, "Rebooting host");
        match tokio::process::Command::new(program).args(args).status().await {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::error!(status = %status, "Reboot command failed"),
            Err(e) => tracing::error!(error = %e, "Reboot command could not run"),
        }
    }

    /// Stop the launcher. Returns the number of frames still running.
    pub async fn shutdown(&self, mode: ShutdownMode) -> usize {
        self.host.write().await.shutdown_pending = true;
        let running = match mode {
            ShutdownMode::Now => {
                self.kill_all(KillRequest::hard(KillReason::Shutdown, "launcher shutting down"))
                    .await
            }
            ShutdownMode::Idle => self.running.read().await.len(),
        };
        if running == 0 || mode == ShutdownMode::Now {
            self.shutdown.cancel();
        }
        tracing::info!(?mode, running, "Shutdown requested");
        running
    }

    /// Resolves once no frame is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.running_count.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn host_state(&self) -> HostState {
        *self.host.read().await
    }

    pub async fn running_frames(&self) -> Vec<RunningFrameInfo> {
        let frames: Vec<Arc<RunningFrame>> = self.running.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(frames.len());
        for frame in frames {
            infos.push(frame.info().await);
        }
        infos.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        infos
    }

    pub async fn status(&self) -> StatusReport {
        let host = self.host_state().await;
        let totals = self.book.totals().await;
        StatusReport {
            hostname: self.config.hostname.clone(),
            locked: host.locked,
            nimby: host.nimby,
            reboot_pending: host.reboot_pending,
            capacity: self.book.capacity().clone(),
            reserved_cores: totals.cores,
            reserved_memory_kb: totals.memory_kb,
            reserved_gpu_memory_kb: totals.gpu_memory_kb,
            load_average: load_average(),
            frames: self.running_frames().await,
            reported_at: Utc::now(),
        }
    }
}
