
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::{mpsc, Mutex, Notify};

use framefarm::error::{ExitCategory, FarmError, Result};
use framefarm::launcher::container::CONTAINER_CREATE_LOCK;
use framefarm::launcher::{
    ChannelReportSink, ContainerExit, ContainerHandle, ContainerLogs, ContainerRuntime,
    ContainerSpec, FrameCompleteReport, FrameLauncher, LaunchOutcome, Report, Reservation,
    RunFrame, ShutdownMode,
};
use framefarm::modules::{ModuleRegistry, ShellModule};
use framefarm::outline::{IoPath, Layer, Outline};

use test_harness::{basic_job_session, setup_outline, test_launcher, test_launcher_config};

/// Set up a single-frame-range job made of `layers` under `dir`.
fn setup_job(dir: &Path, layers: Vec<Layer>) -> (Outline, PathBuf) {
    let mut outline = Outline::new("launch_job", "testing", "shot01", "u")
        .with_frame_range("1-5")
        .unwrap();
    for layer in layers {
        outline.add_layer(layer).unwrap();
    }
    let session = setup_outline(&mut outline, dir);
    (outline, session)
}

fn shell(name: &str, command: &[&str]) -> Layer {
    ShellModule::layer(name, command).unwrap()
}

/// Wait for the completion report of `frame_id`.
async fn complete_report(rx: &mut mpsc::Receiver<Report>, frame_id: &str) -> FrameCompleteReport {
    let wait = async {
        while let Some(report) = rx.recv().await {
            if let Report::FrameComplete(report) = report {
                if report.frame_id == frame_id {
                    return report;
                }
            }
        }
        panic!("report channel closed");
    };
    tokio::time::timeout(Duration::from_secs(15), wait)
        .await
        .expect("frame did not complete in time")
}

fn started_id(outcome: LaunchOutcome) -> String {
    match outcome {
        LaunchOutcome::Started { frame_id } => frame_id,
        LaunchOutcome::Finished(report) => panic!("frame did not start: {:?}", report),
    }
}

// =============================================================================
// Native frames
// =============================================================================

#[tokio::test]
async fn test_basic_job_frames_echo_their_number() {
    let (dir, outline, session) = basic_job_session();
    let (launcher, _rx) = test_launcher(test_launcher_config(dir.path()));

    for frame in 1..=5 {
        let report = launcher
            .run(RunFrame::new(&session, "echo_frame", frame))
            .await
            .unwrap();
        assert_eq!(report.category, ExitCategory::Success, "{:?}", report);
        assert_eq!(report.exit_status, 0);
        assert_eq!(report.frame_name, format!("{:04}-echo_frame", frame));

        let log_path = report.log_path.unwrap();
        assert_eq!(
            log_path,
            dir.path()
                .join("logs")
                .join(outline.job_name())
                .join(format!("{:04}-echo_frame.rqlog", frame))
        );
        let log = std::fs::read_to_string(&log_path).unwrap();
        let expected = format!("] {}", frame);
        assert!(
            log.lines().any(|line| line.starts_with('[') && line.ends_with(&expected)),
            "{}",
            log
        );
    }
    assert!(launcher.running_frames().await.is_empty());
}

#[tokio::test]
async fn test_nonzero_exit_is_reported() {
    let dir = TempDir::new().unwrap();
    let (_outline, session) = setup_job(dir.path(), vec![shell("fail", &["/bin/sh", "-c", "exit 3"])]);
    let (launcher, _rx) = test_launcher(test_launcher_config(dir.path()));

    let report = launcher.run(RunFrame::new(&session, "fail", 1)).await.unwrap();
    assert_eq!(report.category, ExitCategory::ChildExitNonzero);
    assert_eq!(report.exit_status, 3);
    assert_eq!(report.exit_signal, 0);
    assert!(!report.is_success());
}

#[tokio::test]
async fn test_in_process_child_signal_is_reported_as_signal() {
    let dir = TempDir::new().unwrap();
    let mut layer = ShellModule::sh("doomed", "kill -TERM $$").unwrap();
    let marker = dir.path().join("never-written").display().to_string();
    layer.add_output("marker", IoPath::new(marker).checked());
    let (_outline, session) = setup_job(dir.path(), vec![layer]);
    let (launcher, _rx) = test_launcher(test_launcher_config(dir.path()));

    let report = launcher.run(RunFrame::new(&session, "doomed", 1)).await.unwrap();
    assert_eq!(report.category, ExitCategory::ChildSignalled, "{:?}", report);
    assert_eq!(report.exit_signal, 15);
}

#[tokio::test]
async fn test_frame_env_layers_and_overrides() {
    let dir = TempDir::new().unwrap();
    let (outline, session) = setup_job(
        dir.path(),
        vec![shell(
            "env_check",
            &["/bin/sh", "-c", "echo jobid=$jobid frame=$frame custom=$CUSTOM"],
        )],
    );
    let (launcher, _rx) = test_launcher(test_launcher_config(dir.path()));

    let run_frame = RunFrame::new(&session, "env_check", 2).with_env("CUSTOM", "f#IFRAME#");
    let report = launcher.run(run_frame).await.unwrap();
    assert_eq!(report.category, ExitCategory::Success);

    let log = std::fs::read_to_string(report.log_path.unwrap()).unwrap();
    let expected = format!(
        "jobid={} frame=0002-env_check custom=f2",
        outline.job_name()
    );
    assert!(log.contains(&expected), "{}", log);
}

#[tokio::test]
async fn test_log_dir_override() {
    let (dir, outline, session) = basic_job_session();
    let (launcher, _rx) = test_launcher(test_launcher_config(dir.path()));

    let custom = dir.path().join("custom_logs");
    let report = launcher
        .run(RunFrame::new(&session, "echo_frame", 1).with_log_dir(&custom))
        .await
        .unwrap();
    assert_eq!(
        report.log_path.unwrap(),
        custom.join(outline.job_name()).join("0001-echo_frame.rqlog")
    );
}

// =============================================================================
// Validation
// =============================================================================

#[tokio::test]
async fn test_frame_outside_layer_range_is_skipped() {
    let (dir, _outline, session) = basic_job_session();
    let (launcher, mut rx) = test_launcher(test_launcher_config(dir.path()));

    let run_frame = RunFrame::new(&session, "echo_frame", 9);
    let frame_id = run_frame.frame_id.clone();
    let report = launcher.run(run_frame).await.unwrap();
    assert_eq!(report.category, ExitCategory::Skipped);
    assert!(report.log_path.is_none());
    assert!(report.is_success());

    // Reported to the sink as well
    assert_eq!(complete_report(&mut rx, &frame_id).await, report);
}

#[tokio::test]
async fn test_unknown_layer() {
    let (dir, _outline, session) = basic_job_session();
    let (launcher, _rx) = test_launcher(test_launcher_config(dir.path()));

    let report = launcher.run(RunFrame::new(&session, "missing", 1)).await.unwrap();
    assert_eq!(report.category, ExitCategory::UnknownLayer);
}

#[tokio::test]
async fn test_missing_session_is_session_io() {
    let dir = TempDir::new().unwrap();
    let (launcher, _rx) = test_launcher(test_launcher_config(dir.path()));

    let report = launcher
        .run(RunFrame::new(dir.path().join("no_such_session"), "echo_frame", 1))
        .await
        .unwrap();
    assert_eq!(report.category, ExitCategory::SessionIo);
    assert!(report.message.is_some());
}

#[tokio::test]
async fn test_uid_mismatch_is_refused() {
    let (dir, outline, session) = basic_job_session();
    let (launcher, _rx) = test_launcher(test_launcher_config(dir.path()));

    let uid = outline.uid().unwrap();
    let report = launcher
        .run(RunFrame::new(&session, "echo_frame", 1).with_uid(uid.wrapping_add(1)))
        .await
        .unwrap();
    assert_eq!(report.category, ExitCategory::Usage);
    assert!(report.log_path.is_none());
}

// =============================================================================
// Admission
// =============================================================================

#[tokio::test]
async fn test_duplicate_dispatch_is_refused_and_kill_cancels() {
    let dir = TempDir::new().unwrap();
    let (_outline, session) = setup_job(dir.path(), vec![shell("sleeper", &["sleep", "30"])]);
    let (launcher, mut rx) = test_launcher(test_launcher_config(dir.path()));

    let frame_id = started_id(
        launcher
            .launch(RunFrame::new(&session, "sleeper", 1))
            .await
            .unwrap(),
    );
    assert!(matches!(
        launcher.launch(RunFrame::new(&session, "sleeper", 1)).await,
        Err(FarmError::DuplicateFrame(_))
    ));

    let running = launcher.running_frames().await;
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].frame_id, frame_id);

    tokio::time::sleep(Duration::from_millis(200)).await;
    launcher.kill(&frame_id, "requested by test").await.unwrap();
    let report = complete_report(&mut rx, &frame_id).await;
    assert_eq!(report.category, ExitCategory::Cancelled);
    assert_eq!(report.message.as_deref(), Some("requested by test"));

    launcher.wait_idle().await;
    assert!(matches!(
        launcher.kill(&frame_id, "again").await,
        Err(FarmError::FrameNotFound(_))
    ));
}

#[tokio::test]
async fn test_locked_host_refuses_frames() {
    let (dir, _outline, session) = basic_job_session();
    let (launcher, _rx) = test_launcher(test_launcher_config(dir.path()));

    launcher.lock().await;
    assert!(matches!(
        launcher.run(RunFrame::new(&session, "echo_frame", 1)).await,
        Err(FarmError::HostLocked(_))
    ));

    launcher.unlock().await;
    let report = launcher.run(RunFrame::new(&session, "echo_frame", 1)).await.unwrap();
    assert_eq!(report.category, ExitCategory::Success);
}

#[tokio::test]
async fn test_reservation_beyond_capacity() {
    let (dir, _outline, session) = basic_job_session();
    let (launcher, _rx) = test_launcher(test_launcher_config(dir.path()));

    let run_frame = RunFrame::new(&session, "echo_frame", 1)
        .with_reservation(Reservation::new(16.0, 1024));
    assert!(matches!(
        launcher.run(run_frame).await,
        Err(FarmError::InsufficientResources(_))
    ));
}

#[tokio::test]
async fn test_status_tracks_reservations() {
    let dir = TempDir::new().unwrap();
    let (_outline, session) = setup_job(dir.path(), vec![shell("sleeper", &["sleep", "30"])]);
    let (launcher, mut rx) = test_launcher(test_launcher_config(dir.path()));

    let frame_id = started_id(
        launcher
            .launch(
                RunFrame::new(&session, "sleeper", 2)
                    .with_reservation(Reservation::new(2.0, 512 * 1024)),
            )
            .await
            .unwrap(),
    );

    let status = launcher.status().await;
    assert_eq!(status.hostname, "test-host");
    assert_eq!(status.reserved_cores, 2.0);
    assert_eq!(status.reserved_memory_kb, 512 * 1024);
    assert_eq!(status.frames.len(), 1);
    assert_eq!(status.frames[0].frame_name, "0002-sleeper");

    launcher.kill(&frame_id, "done").await.unwrap();
    complete_report(&mut rx, &frame_id).await;

    let status = launcher.status().await;
    assert_eq!(status.reserved_cores, 0.0);
    assert!(status.frames.is_empty());
}

// =============================================================================
// Supervision
// =============================================================================

#[tokio::test]
async fn test_max_wall_time_times_out() {
    let dir = TempDir::new().unwrap();
    let (_outline, session) = setup_job(dir.path(), vec![shell("sleeper", &["sleep", "30"])]);
    let mut config = test_launcher_config(dir.path());
    config.max_wall_time_secs = Some(1);
    let (launcher, _rx) = test_launcher(config);

    let report = launcher.run(RunFrame::new(&session, "sleeper", 1)).await.unwrap();
    assert_eq!(report.category, ExitCategory::TimedOut);
    assert!(report.run_time_secs < 10.0);
}

// =============================================================================
// Host operations
// =============================================================================

#[tokio::test]
async fn test_start_announces_host() {
    let dir = TempDir::new().unwrap();
    let (launcher, mut rx) = test_launcher(test_launcher_config(dir.path()));

    let startup = launcher.start().await;
    assert_eq!(startup.hostname, "test-host");
    assert!(!startup.container_mode);
    match rx.recv().await {
        Some(Report::Startup(report)) => assert_eq!(report, startup),
        other => panic!("expected a startup report, got {:?}", other),
    }
}

#[tokio::test]
async fn test_nimby_releases_host_to_user() {
    let dir = TempDir::new().unwrap();
    let (_outline, session) = setup_job(dir.path(), vec![shell("sleeper", &["sleep", "30"])]);
    let (launcher, mut rx) = test_launcher(test_launcher_config(dir.path()));

    let frame_id = started_id(
        launcher
            .launch(RunFrame::new(&session, "sleeper", 1))
            .await
            .unwrap(),
    );

    // Without NIMBY user activity is ignored
    assert_eq!(launcher.user_active().await, 0);
    assert!(!launcher.host_state().await.locked);

    launcher.set_nimby(true).await;
    assert_eq!(launcher.user_active().await, 1);
    let report = complete_report(&mut rx, &frame_id).await;
    assert_eq!(report.category, ExitCategory::Cancelled);

    let state = launcher.host_state().await;
    assert!(state.locked);
    assert!(state.nimby);
}

#[tokio::test]
async fn test_shutdown_idle_without_frames_cancels_at_once() {
    let (dir, _outline, session) = basic_job_session();
    let (launcher, _rx) = test_launcher(test_launcher_config(dir.path()));

    assert_eq!(launcher.shutdown(ShutdownMode::Idle).await, 0);
    assert!(launcher.shutdown_token().is_cancelled());
    assert!(matches!(
        launcher.run(RunFrame::new(&session, "echo_frame", 1)).await,
        Err(FarmError::HostLocked(_))
    ));
}

#[tokio::test]
async fn test_shutdown_idle_waits_for_running_frames() {
    let dir = TempDir::new().unwrap();
    let (_outline, session) = setup_job(
        dir.path(),
        vec![shell("short_sleep", &["sleep", "1"])],
    );
    let (launcher, mut rx) = test_launcher(test_launcher_config(dir.path()));

    let frame_id = started_id(
        launcher
            .launch(RunFrame::new(&session, "short_sleep", 1))
            .await
            .unwrap(),
    );
    assert_eq!(launcher.shutdown(ShutdownMode::Idle).await, 1);
    assert!(!launcher.shutdown_token().is_cancelled());

    let report = complete_report(&mut rx, &frame_id).await;
    assert_eq!(report.category, ExitCategory::Success);
    tokio::time::timeout(Duration::from_secs(5), launcher.shutdown_token().cancelled())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_now_kills_running_frames() {
    let dir = TempDir::new().unwrap();
    let (_outline, session) = setup_job(dir.path(), vec![shell("sleeper", &["sleep", "30"])]);
    let (launcher, mut rx) = test_launcher(test_launcher_config(dir.path()));

    let frame_id = started_id(
        launcher
            .launch(RunFrame::new(&session, "sleeper", 1))
            .await
            .unwrap(),
    );
    assert_eq!(launcher.shutdown(ShutdownMode::Now).await, 1);
    assert!(launcher.shutdown_token().is_cancelled());

    let report = complete_report(&mut rx, &frame_id).await;
    assert_eq!(report.category, ExitCategory::Cancelled);
    tokio::time::timeout(Duration::from_secs(5), launcher.wait_idle())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_reboot_idle_runs_immediately_when_idle() {
    let dir = TempDir::new().unwrap();
    let (launcher, _rx) = test_launcher(test_launcher_config(dir.path()));

    assert!(launcher.reboot_idle().await);
    assert!(!launcher.host_state().await.reboot_pending);
}

#[tokio::test]
async fn test_reboot_idle_waits_and_blocks_new_frames() {
    let dir = TempDir::new().unwrap();
    let (_outline, session) = setup_job(dir.path(), vec![shell("sleeper", &["sleep", "30"])]);
    let (launcher, mut rx) = test_launcher(test_launcher_config(dir.path()));

    let frame_id = started_id(
        launcher
            .launch(RunFrame::new(&session, "sleeper", 1))
            .await
            .unwrap(),
    );
    assert!(!launcher.reboot_idle().await);
    assert!(launcher.host_state().await.reboot_pending);
    assert!(matches!(
        launcher.launch(RunFrame::new(&session, "sleeper", 2)).await,
        Err(FarmError::HostLocked(_))
    ));

    launcher.kill(&frame_id, "drain").await.unwrap();
    complete_report(&mut rx, &frame_id).await;

    // The reboot runs right after the last report goes out
    tokio::time::timeout(Duration::from_secs(5), async {
        while launcher.host_state().await.reboot_pending {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

// =============================================================================
// Container mode
// =============================================================================

/// In-memory container runtime that records what the launcher asks of it.
struct FakeRuntime {
    creating: AtomicUsize,
    max_creating: AtomicUsize,
    failed_creates_left: AtomicUsize,
    pulls: AtomicUsize,
    pulled_without_lock: AtomicBool,
    removed: AtomicUsize,
    specs: Mutex<Vec<ContainerSpec>>,
    /// Successive answers to `logs`; the last one repeats
    log_polls: Mutex<VecDeque<ContainerLogs>>,
    exit: ContainerExit,
    run_for: Duration,
    stopped: Notify,
}

impl FakeRuntime {
    fn new(exit: ContainerExit) -> Self {
        Self {
            creating: AtomicUsize::new(0),
            max_creating: AtomicUsize::new(0),
            failed_creates_left: AtomicUsize::new(0),
            pulls: AtomicUsize::new(0),
            pulled_without_lock: AtomicBool::new(false),
            removed: AtomicUsize::new(0),
            specs: Mutex::new(Vec::new()),
            log_polls: Mutex::new(VecDeque::from([container_logs(
                &["hello from container"],
                &[],
            )])),
            exit,
            run_for: Duration::from_millis(100),
            stopped: Notify::new(),
        }
    }

    fn succeeding() -> Self {
        Self::new(ContainerExit {
            status: 0,
            oom_killed: false,
        })
    }

    fn failing_first_creates(self, count: usize) -> Self {
        self.failed_creates_left.store(count, Ordering::SeqCst);
        self
    }

    fn running_for(mut self, run_for: Duration) -> Self {
        self.run_for = run_for;
        self
    }

    fn with_log_polls(self, polls: Vec<ContainerLogs>) -> Self {
        *self.log_polls.try_lock().unwrap() = polls.into();
        self
    }
}

fn container_logs(stdout: &[&str], stderr: &[&str]) -> ContainerLogs {
    ContainerLogs {
        stdout: stdout.iter().map(|s| s.to_string()).collect(),
        stderr: stderr.iter().map(|s| s.to_string()).collect(),
    }
}

#[tonic::async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull(&self, _image: &str) -> Result<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        // Other tests may hold the lock briefly; a caller holding it never
        // lets go while we wait
        for _ in 0..100 {
            if CONTAINER_CREATE_LOCK.try_lock().is_ok() {
                self.pulled_without_lock.store(true, Ordering::SeqCst);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let now = self.creating.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_creating.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.creating.fetch_sub(1, Ordering::SeqCst);

        let failing = self
            .failed_creates_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FarmError::FailedLaunch("image not present".to_string()));
        }
        self.specs.lock().await.push(spec.clone());
        Ok(ContainerHandle {
            id: format!("fake-{}", spec.name),
        })
    }

    async fn logs(&self, _handle: &ContainerHandle) -> Result<ContainerLogs> {
        let mut polls = self.log_polls.lock().await;
        if polls.len() > 1 {
            Ok(polls.pop_front().unwrap_or_default())
        } else {
            Ok(polls.front().cloned().unwrap_or_default())
        }
    }

    async fn wait(&self, _handle: &ContainerHandle) -> Result<ContainerExit> {
        tokio::select! {
            _ = tokio::time::sleep(self.run_for) => Ok(self.exit),
            _ = self.stopped.notified() => Ok(ContainerExit {
                status: 137,
                oom_killed: false,
            }),
        }
    }

    async fn stop(&self, _handle: &ContainerHandle, _grace: Duration) -> Result<()> {
        self.stopped.notify_one();
        Ok(())
    }

    async fn remove(&self, _handle: &ContainerHandle) -> Result<()> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn container_launcher(
    dir: &Path,
    runtime: Arc<FakeRuntime>,
) -> (Arc<FrameLauncher>, mpsc::Receiver<Report>) {
    let mut config = test_launcher_config(dir);
    config.container_mode = true;
    let (tx, rx) = mpsc::channel(64);
    let launcher = FrameLauncher::new(config, ModuleRegistry::with_builtins())
        .with_runtime(runtime)
        .with_sink(Arc::new(ChannelReportSink::new(tx)));
    (Arc::new(launcher), rx)
}

#[tokio::test]
async fn test_container_creation_is_serialized() {
    let (dir, _outline, session) = basic_job_session();
    let runtime = Arc::new(FakeRuntime::succeeding());
    let (launcher, _rx) = container_launcher(dir.path(), runtime.clone());

    let mut handles = Vec::new();
    for frame in 1..=4 {
        let launcher = launcher.clone();
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            launcher.run(RunFrame::new(&session, "echo_frame", frame)).await
        }));
    }
    for handle in handles {
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.category, ExitCategory::Success, "{:?}", report);
        let log = std::fs::read_to_string(report.log_path.unwrap()).unwrap();
        assert!(log.contains("] hello from container"), "{}", log);
    }

    assert_eq!(runtime.max_creating.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.removed.load(Ordering::SeqCst), 4);
    assert_eq!(runtime.pulls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_container_spec_carries_frame_identity() {
    let (dir, _outline, session) = basic_job_session();
    let runtime = Arc::new(FakeRuntime::succeeding());
    let (launcher, _rx) = container_launcher(dir.path(), runtime.clone());

    let run_frame = RunFrame::new(&session, "echo_frame", 3)
        .with_reservation(Reservation::new(1.0, 2048));
    let expected_user = format!(
        "{}:{}",
        run_frame.uid,
        run_frame.gid.unwrap_or(run_frame.uid)
    );
    let frame_id = run_frame.frame_id.clone();
    launcher.run(run_frame).await.unwrap();

    let specs = runtime.specs.lock().await;
    assert_eq!(specs.len(), 1);
    let spec = &specs[0];
    assert_eq!(spec.name, format!("framefarm-{}", frame_id));
    assert_eq!(spec.image, "ubuntu:latest");
    assert_eq!(spec.command, vec!["echo".to_string(), "3".to_string()]);
    assert_eq!(spec.user, expected_user);
    assert_eq!(spec.mem_limit_kb, 2048);
    assert_eq!(spec.hostname, "test-host");
    assert_eq!(spec.env.get("frame").map(String::as_str), Some("0003-echo_frame"));
}

#[tokio::test]
async fn test_failed_create_pulls_and_retries() {
    let (dir, _outline, session) = basic_job_session();
    let runtime = Arc::new(FakeRuntime::succeeding().failing_first_creates(1));
    let (launcher, _rx) = container_launcher(dir.path(), runtime.clone());

    let report = launcher.run(RunFrame::new(&session, "echo_frame", 1)).await.unwrap();
    assert_eq!(report.category, ExitCategory::Success);
    assert_eq!(runtime.pulls.load(Ordering::SeqCst), 1);
    assert!(runtime.pulled_without_lock.load(Ordering::SeqCst));
    assert_eq!(runtime.specs.lock().await.len(), 1);
}

#[tokio::test]
async fn test_container_logs_follow_each_stream() {
    let (dir, _outline, session) = basic_job_session();
    let runtime = Arc::new(
        FakeRuntime::succeeding()
            .running_for(Duration::from_millis(300))
            .with_log_polls(vec![
                container_logs(&["a"], &["e1"]),
                container_logs(&["a", "b"], &["e1"]),
                container_logs(&["a", "b"], &["e1", "e2"]),
            ]),
    );
    let (launcher, _rx) = container_launcher(dir.path(), runtime);

    let report = launcher.run(RunFrame::new(&session, "echo_frame", 1)).await.unwrap();
    assert_eq!(report.category, ExitCategory::Success);
    let log = std::fs::read_to_string(report.log_path.unwrap()).unwrap();
    for line in ["a", "b", "e1", "e2"] {
        let copies = log
            .lines()
            .filter(|l| l.ends_with(&format!("] {}", line)))
            .count();
        assert_eq!(copies, 1, "{} in\n{}", line, log);
    }
}

#[tokio::test]
async fn test_in_process_container_frames_mount_executor_and_session() {
    let dir = TempDir::new().unwrap();
    let registry = ModuleRegistry::with_builtins();
    let (_outline, session) = setup_job(
        dir.path(),
        vec![registry.create("null", "noop").unwrap()],
    );
    let runtime = Arc::new(FakeRuntime::succeeding());
    let (launcher, _rx) = container_launcher(dir.path(), runtime.clone());

    let report = launcher.run(RunFrame::new(&session, "noop", 1)).await.unwrap();
    assert_eq!(report.category, ExitCategory::Success);

    let executor = env!("CARGO_BIN_EXE_framefarm");
    let specs = runtime.specs.lock().await;
    let spec = &specs[0];
    assert_eq!(spec.command[0], executor);
    assert!(spec
        .mounts
        .iter()
        .any(|m| m.source == executor && m.target == executor && m.read_only));
    let session = session.display().to_string();
    assert!(spec
        .mounts
        .iter()
        .any(|m| m.source == session && m.target == session && !m.read_only));
}

#[tokio::test]
async fn test_in_process_container_frame_needs_the_executor() {
    let dir = TempDir::new().unwrap();
    let registry = ModuleRegistry::with_builtins();
    let (_outline, session) = setup_job(
        dir.path(),
        vec![registry.create("null", "noop").unwrap()],
    );
    let runtime = Arc::new(FakeRuntime::succeeding());
    let mut config = test_launcher_config(dir.path());
    config.container_mode = true;
    config.executor_path = PathBuf::from("framefarm");
    let launcher = FrameLauncher::new(config, registry).with_runtime(runtime.clone());

    let report = launcher.run(RunFrame::new(&session, "noop", 1)).await.unwrap();
    assert_eq!(report.category, ExitCategory::FailedLaunch);
    assert!(runtime.specs.lock().await.is_empty());
}

#[tokio::test]
async fn test_container_exit_mapping() {
    let (dir, _outline, session) = basic_job_session();

    let oom = Arc::new(FakeRuntime::new(ContainerExit {
        status: 137,
        oom_killed: true,
    }));
    let (launcher, _rx) = container_launcher(dir.path(), oom);
    let report = launcher.run(RunFrame::new(&session, "echo_frame", 1)).await.unwrap();
    assert_eq!(report.category, ExitCategory::Oom);

    let signalled = Arc::new(FakeRuntime::new(ContainerExit {
        status: 137,
        oom_killed: false,
    }));
    let (launcher, _rx) = container_launcher(dir.path(), signalled);
    let report = launcher.run(RunFrame::new(&session, "echo_frame", 2)).await.unwrap();
    assert_eq!(report.category, ExitCategory::ChildSignalled);
    assert_eq!(report.exit_signal, 9);
}

#[tokio::test]
async fn test_unknown_os_image_fails_launch() {
    let (dir, _outline, session) = basic_job_session();
    let runtime = Arc::new(FakeRuntime::succeeding());
    let (launcher, _rx) = container_launcher(dir.path(), runtime.clone());

    let report = launcher
        .run(RunFrame::new(&session, "echo_frame", 1).with_os("centos7"))
        .await
        .unwrap();
    assert_eq!(report.category, ExitCategory::FailedLaunch);
    assert!(runtime.specs.lock().await.is_empty());
    assert!(launcher.running_frames().await.is_empty());
}

#[tokio::test]
async fn test_killed_container_is_stopped() {
    let (dir, _outline, session) = basic_job_session();
    let runtime = Arc::new(FakeRuntime::succeeding().running_for(Duration::from_secs(30)));
    let (launcher, mut rx) = container_launcher(dir.path(), runtime.clone());

    let frame_id = started_id(
        launcher
            .launch(RunFrame::new(&session, "echo_frame", 1))
            .await
            .unwrap(),
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    launcher.kill(&frame_id, "stop it").await.unwrap();

    let report = complete_report(&mut rx, &frame_id).await;
    assert_eq!(report.category, ExitCategory::Cancelled);
    assert_eq!(runtime.removed.load(Ordering::SeqCst), 1);
}
