//! Watching a frame until it exits.
//!
//! Both supervisors sample usage on a fixed interval, honour kill requests
//! (soft: terminate, wait out the grace period, then kill; hard: kill at
//! once) and enforce the wall-time and memory limits.

use std::os::unix::process::ExitStatusExt;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};

use crate::error::ExitCategory;

use super::container::{ContainerHandle, ContainerRuntime, LogOffsets};
use super::logging::LogWriter;
use super::native::signal_group;
use super::running::{KillReason, KillRequest, RunningFrame};
use super::sampler::sample_tree;

/// Limits applied while a frame runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupervisionPolicy {
    pub sample_interval: Duration,
    pub kill_grace: Duration,
    pub max_wall_time: Option<Duration>,
    /// Kill when the sampled RSS goes past this
    pub memory_limit_kb: Option<u64>,
    pub log_interval: Duration,
}

/// How a supervised frame ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub exit_status: i32,
    pub exit_signal: i32,
    pub killed: Option<KillRequest>,
    pub oom_killed: bool,
    /// Set when the process could not be waited on
    pub failure: Option<String>,
}

impl ExitInfo {
    pub fn category(&self) -> ExitCategory {
        if let Some(kill) = &self.killed {
            return kill.reason.category();
        }
        if self.oom_killed {
            return ExitCategory::Oom;
        }
        if self.failure.is_some() {
            return ExitCategory::Internal;
        }
        if self.exit_signal != 0 {
            return ExitCategory::ChildSignalled;
        }
        if self.exit_status != 0 {
            return ExitCategory::ChildExitNonzero;
        }
        ExitCategory::Success
    }
}

/// Forward every line of `stream` to the frame log.
pub fn pipe_lines<R>(stream: R, writer: LogWriter) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => writer.line(line),
                Ok(None) => break,
                Err(e) => {
                    writer.banner(format!("[launcher] output stream error: {}", e));
                    break;
                }
            }
        }
    })
}

/// Tracks the first kill request and the SIGKILL deadline it implies.
struct KillState {
    request: Option<KillRequest>,
    hard_at: Option<Instant>,
    hard_sent: bool,
}

impl KillState {
    fn new() -> Self {
        Self {
            request: None,
            hard_at: None,
            hard_sent: false,
        }
    }

    /// Register `request`; returns the signal to send now, if any.
    fn begin(&mut self, request: KillRequest, grace: Duration) -> Option<Signal> {
        if self.hard_sent {
            return None;
        }
        let hard = request.hard;
        if self.request.is_none() {
            self.request = Some(request);
        }
        if hard {
            self.hard_sent = true;
            self.hard_at = None;
            Some(Signal::SIGKILL)
        } else if self.hard_at.is_none() {
            self.hard_at = Some(Instant::now() + grace);
            Some(Signal::SIGTERM)
        } else {
            None
        }
    }

    fn escalate(&mut self) -> Option<Signal> {
        self.hard_at = None;
        if self.hard_sent {
            return None;
        }
        self.hard_sent = true;
        Some(Signal::SIGKILL)
    }

    fn in_progress(&self) -> bool {
        self.request.is_some()
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}

/// Supervise a native child started as its own process-group leader.
pub async fn supervise_native(
    mut child: Child,
    frame: &RunningFrame,
    mut kill_rx: watch::Receiver<Option<KillRequest>>,
    policy: SupervisionPolicy,
) -> ExitInfo {
    let pid = child.id().unwrap_or(0);
    frame.set_pid(Some(pid)).await;

    let wall_deadline = policy.max_wall_time.map(|d| Instant::now() + d);
    let mut ticker = interval(policy.sample_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut kill = KillState::new();
    let mut kill_open = true;

    // A kill may have been requested before supervision started
    if let Some(request) = kill_rx.borrow_and_update().clone() {
        if let Some(sig) = kill.begin(request, policy.kill_grace) {
            signal_group(pid, sig);
        }
    }

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = ticker.tick() => {
                if let Some(sample) = (pid != 0).then(|| sample_tree(pid)).flatten() {
                    frame.record_sample(sample).await;
                    if let Some(limit) = policy.memory_limit_kb {
                        if sample.rss_kb > limit && !kill.in_progress() {
                            let request = KillRequest::hard(
                                KillReason::Oom,
                                format!("rss {} KiB over limit {} KiB", sample.rss_kb, limit),
                            );
                            tracing::warn!(frame = %frame.frame_name, message = %request.message, "Frame exceeded memory limit");
                            if let Some(sig) = kill.begin(request, policy.kill_grace) {
                                signal_group(pid, sig);
                            }
                        }
                    }
                }
            }
            changed = kill_rx.changed(), if kill_open => {
                if changed.is_err() {
                    kill_open = false;
                    continue;
                }
                if let Some(request) = kill_rx.borrow_and_update().clone() {
                    if let Some(sig) = kill.begin(request, policy.kill_grace) {
                        signal_group(pid, sig);
                    }
                }
            }
            _ = sleep_until(kill.hard_at.unwrap_or_else(far_future)), if kill.hard_at.is_some() => {
                if let Some(sig) = kill.escalate() {
                    tracing::info!(frame = %frame.frame_name, "Grace period over, killing frame");
                    signal_group(pid, sig);
                }
            }
            _ = sleep_until(wall_deadline.unwrap_or_else(far_future)), if wall_deadline.is_some() && !kill.in_progress() => {
                let request = KillRequest::soft(KillReason::TimedOut, "maximum wall time exceeded");
                tracing::warn!(frame = %frame.frame_name, "Frame exceeded maximum wall time");
                if let Some(sig) = kill.begin(request, policy.kill_grace) {
                    signal_group(pid, sig);
                }
            }
        }
    };

    // Descendants that outlived the leader go with it
    signal_group(pid, Signal::SIGKILL);

    let mut info = ExitInfo {
        killed: kill.request,
        ..Default::default()
    };
    match status {
        Ok(status) => {
            if let Some(code) = status.code() {
                info.exit_status = code;
            } else if let Some(sig) = status.signal() {
                info.exit_signal = sig;
                info.exit_status = 128 + sig;
            }
        }
        Err(e) => info.failure = Some(format!("wait failed: {}", e)),
    }
    info
}

/// Supervise a detached container, polling its output into `log`.
pub async fn supervise_container(
    runtime: &dyn ContainerRuntime,
    handle: &ContainerHandle,
    frame: &RunningFrame,
    mut kill_rx: watch::Receiver<Option<KillRequest>>,
    policy: SupervisionPolicy,
    log: LogWriter,
) -> ExitInfo {
    frame.set_container(&handle.id).await;
    let pid = runtime.pid(handle).await.ok().flatten();
    frame.set_pid(pid).await;

    let wall_deadline = policy.max_wall_time.map(|d| Instant::now() + d);
    let mut sample_ticker = interval(policy.sample_interval);
    sample_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut log_ticker = interval(policy.log_interval);
    log_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut offsets = LogOffsets::default();
    let mut kill = KillState::new();
    let mut kill_open = true;
    let mut pending_stop: Option<Duration> = None;

    if let Some(request) = kill_rx.borrow_and_update().clone() {
        if let Some(sig) = kill.begin(request, policy.kill_grace) {
            pending_stop = Some(stop_grace(sig, policy.kill_grace));
        }
    }

    let wait = runtime.wait(handle);
    tokio::pin!(wait);

    let exit = loop {
        if let Some(grace) = pending_stop.take() {
            if let Err(e) = runtime.stop(handle, grace).await {
                tracing::warn!(container = %handle.id, error = %e, "Failed to stop container");
            }
        }
        tokio::select! {
            exit = &mut wait => break exit,
            _ = log_ticker.tick() => {
                match runtime.logs(handle).await {
                    Ok(logs) => {
                        for line in logs.unseen(&mut offsets) {
                            log.line(line);
                        }
                    }
                    Err(e) => tracing::debug!(container = %handle.id, error = %e, "Log poll failed"),
                }
            }
            _ = sample_ticker.tick() => {
                if let Some(sample) = pid.and_then(sample_tree) {
                    frame.record_sample(sample).await;
                }
            }
            changed = kill_rx.changed(), if kill_open => {
                if changed.is_err() {
                    kill_open = false;
                    continue;
                }
                if let Some(request) = kill_rx.borrow_and_update().clone() {
                    if let Some(sig) = kill.begin(request, policy.kill_grace) {
                        pending_stop = Some(stop_grace(sig, policy.kill_grace));
                    }
                }
            }
            _ = sleep_until(wall_deadline.unwrap_or_else(far_future)), if wall_deadline.is_some() && !kill.in_progress() => {
                let request = KillRequest::soft(KillReason::TimedOut, "maximum wall time exceeded");
                tracing::warn!(frame = %frame.frame_name, "Frame exceeded maximum wall time");
                if let Some(sig) = kill.begin(request, policy.kill_grace) {
                    pending_stop = Some(stop_grace(sig, policy.kill_grace));
                }
            }
        }
    };

    // Whatever was written after the last poll
    if let Ok(logs) = runtime.logs(handle).await {
        for line in logs.unseen(&mut offsets) {
            log.line(line);
        }
    }

    let mut info = ExitInfo {
        killed: kill.request,
        ..Default::default()
    };
    match exit {
        Ok(exit) => {
            info.oom_killed = exit.oom_killed;
            info.exit_status = exit.status as i32;
            // The runtime reports death by signal as 128 + signal
            if exit.status > 128 && exit.status < 128 + 65 {
                info.exit_signal = (exit.status - 128) as i32;
            }
        }
        Err(e) => info.failure = Some(format!("wait failed: {}", e)),
    }
    info
}

fn stop_grace(signal: Signal, grace: Duration) -> Duration {
    if signal == Signal::SIGKILL {
        Duration::ZERO
    } else {
        grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_kill_reason_wins() {
        let mut state = KillState::new();
        let grace = Duration::from_secs(5);
        assert_eq!(
            state.begin(KillRequest::soft(KillReason::Cancelled, "user"), grace),
            Some(Signal::SIGTERM)
        );
        assert_eq!(
            state.begin(KillRequest::hard(KillReason::Shutdown, "now"), grace),
            Some(Signal::SIGKILL)
        );
        assert_eq!(state.escalate(), None);
        assert_eq!(state.request.unwrap().reason, KillReason::Cancelled);
    }

    #[test]
    fn exit_categories() {
        let mut info = ExitInfo::default();
        assert_eq!(info.category(), ExitCategory::Success);
        info.exit_status = 3;
        assert_eq!(info.category(), ExitCategory::ChildExitNonzero);
        info.exit_signal = 9;
        assert_eq!(info.category(), ExitCategory::ChildSignalled);
        info.oom_killed = true;
        assert_eq!(info.category(), ExitCategory::Oom);
        info.killed = Some(KillRequest::soft(KillReason::TimedOut, "t"));
        assert_eq!(info.category(), ExitCategory::TimedOut);
    }
}
