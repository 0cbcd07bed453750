//! Container execution through a pluggable runtime client.
//!
//! [`DockerCli`] drives the `docker` binary. Frames run detached with the
//! host's pid and network namespaces; their output is polled with
//! `docker logs`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Mutex;

use crate::config::{LauncherConfig, MountConfig};
use crate::error::{FarmError, Result};

/// Smallest memory limit the runtime accepts, in KiB.
pub const MIN_CONTAINER_MEMORY_KB: u64 = 6 * 1024;

/// Label carrying the frame id on every container we create.
pub const FRAME_LABEL: &str = "framefarm.frame";

/// Held across the create call only. Concurrent creates race inside the
/// runtime.
pub static CONTAINER_CREATE_LOCK: Mutex<()> = Mutex::const_new(());

/// Everything needed to start one frame container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub mounts: Vec<MountConfig>,
    pub hostname: String,
    pub mem_reservation_kb: u64,
    pub mem_limit_kb: u64,
    /// `uid:gid` the command runs as
    pub user: String,
    pub gpus: bool,
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    /// Memory flags, lifted to the runtime's minimum. Zero means unlimited.
    fn memory_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.mem_reservation_kb > 0 {
            let kb = self.mem_reservation_kb.max(MIN_CONTAINER_MEMORY_KB);
            args.push(format!("--memory-reservation={}k", kb));
        }
        if self.mem_limit_kb > 0 {
            let kb = self.mem_limit_kb.max(MIN_CONTAINER_MEMORY_KB);
            args.push(format!("--memory={}k", kb));
        }
        args
    }

    /// Arguments of `docker run`, without the binary.
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            // A missing image fails the create so the pull happens outside
            // the create lock
            "--pull=never".to_string(),
            format!("--name={}", self.name),
            format!("--hostname={}", self.hostname),
            "--pid=host".to_string(),
            "--network=host".to_string(),
            format!("--user={}", self.user),
            format!("--workdir={}", self.working_dir.display()),
        ];
        args.extend(self.memory_args());
        if self.gpus {
            args.push("--gpus=all".to_string());
        }
        for mount in &self.mounts {
            args.push(format!("--mount={}", mount.to_docker_arg()));
        }
        for (key, value) in &self.labels {
            args.push(format!("--label={}={}", key, value));
        }
        for (key, value) in &self.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// A created container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    pub id: String,
}

/// How a container ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerExit {
    pub status: i64,
    pub oom_killed: bool,
}

/// Everything a container has written, split by stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerLogs {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// Lines of each stream already copied to the frame log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOffsets {
    pub stdout: usize,
    pub stderr: usize,
}

impl ContainerLogs {
    /// Lines past `offsets`, stdout first. Advances `offsets`.
    pub fn unseen(self, offsets: &mut LogOffsets) -> Vec<String> {
        let stdout: Vec<String> = self.stdout.into_iter().skip(offsets.stdout).collect();
        let stderr: Vec<String> = self.stderr.into_iter().skip(offsets.stderr).collect();
        offsets.stdout += stdout.len();
        offsets.stderr += stderr.len();
        stdout.into_iter().chain(stderr).collect()
    }
}

/// Client for the container runtime.
#[tonic::async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull(&self, image: &str) -> Result<()>;

    /// Create and start a detached container.
    async fn run(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    /// Every output line produced so far.
    async fn logs(&self, handle: &ContainerHandle) -> Result<ContainerLogs>;

    /// Wait for the container to exit.
    async fn wait(&self, handle: &ContainerHandle) -> Result<ContainerExit>;

    /// Stop with a grace period; zero kills immediately.
    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<()>;

    async fn remove(&self, handle: &ContainerHandle) -> Result<()>;

    /// Host pid of the container's main process, when the runtime exposes it.
    async fn pid(&self, _handle: &ContainerHandle) -> Result<Option<u32>> {
        Ok(None)
    }
}

/// [`ContainerRuntime`] backed by the `docker` command line.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn from_config(config: &LauncherConfig) -> Self {
        Self::new(config.docker_binary.clone())
    }

    async fn docker(&self, args: &[String]) -> Result<std::process::Output> {
        tracing::debug!(binary = %self.binary, args = ?args, "Running container runtime command");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| FarmError::FailedLaunch(format!("{}: {}", self.binary, e)))?;
        Ok(output)
    }

    async fn checked(&self, args: &[String]) -> Result<String> {
        let output = self.docker(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(FarmError::FailedLaunch(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                stderr
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn inspect(&self, handle: &ContainerHandle, format: &str) -> Result<String> {
        self.checked(&[
            "inspect".to_string(),
            format!("--format={}", format),
            handle.id.clone(),
        ])
        .await
    }
}

#[tonic::async_trait]
impl ContainerRuntime for DockerCli {
    async fn pull(&self, image: &str) -> Result<()> {
        self.checked(&["pull".to_string(), image.to_string()]).await?;
        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let id = self.checked(&spec.run_args()).await?;
        Ok(ContainerHandle { id })
    }

    async fn logs(&self, handle: &ContainerHandle) -> Result<ContainerLogs> {
        let output = self
            .docker(&["logs".to_string(), handle.id.clone()])
            .await?;
        let lines = |bytes: &[u8]| -> Vec<String> {
            String::from_utf8_lossy(bytes)
                .lines()
                .map(str::to_string)
                .collect()
        };
        Ok(ContainerLogs {
            stdout: lines(output.stdout.as_slice()),
            stderr: lines(output.stderr.as_slice()),
        })
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<ContainerExit> {
        let status = self
            .checked(&["wait".to_string(), handle.id.clone()])
            .await?;
        let status = status
            .lines()
            .last()
            .and_then(|l| l.trim().parse().ok())
            .ok_or_else(|| FarmError::Internal(format!("unexpected wait output: {}", status)))?;
        let oom_killed = self
            .inspect(handle, "{{.State.OOMKilled}}")
            .await
            .map(|v| v == "true")
            .unwrap_or(false);
        Ok(ContainerExit { status, oom_killed })
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<()> {
        self.checked(&[
            "stop".to_string(),
            format!("--time={}", grace.as_secs()),
            handle.id.clone(),
        ])
        .await?;
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        self.checked(&["rm".to_string(), "--force".to_string(), handle.id.clone()])
            .await?;
        Ok(())
    }

    async fn pid(&self, handle: &ContainerHandle) -> Result<Option<u32>> {
        let pid = self.inspect(handle, "{{.State.Pid}}").await?;
        Ok(pid.parse().ok().filter(|p| *p > 0))
    }
}

/// Container ids of running frames, mirrored as files under the working
/// directory so a restarted launcher can reap what it left behind.
#[derive(Debug, Clone)]
pub struct ContainerLedger {
    dir: PathBuf,
}

impl ContainerLedger {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            dir: working_dir.join(".framefarm").join("containers"),
        }
    }

    pub fn record(&self, frame_id: &str, handle: &ContainerHandle) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.dir.join(&handle.id), frame_id)?;
        Ok(())
    }

    pub fn forget(&self, handle: &ContainerHandle) {
        let _ = std::fs::remove_file(self.dir.join(&handle.id));
    }

    pub fn recorded(&self) -> Vec<ContainerHandle> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| ContainerHandle {
                id: e.file_name().to_string_lossy().to_string(),
            })
            .collect()
    }

    /// Stop and remove every recorded container. Returns how many were
    /// reaped.
    pub async fn reap(&self, runtime: &dyn ContainerRuntime) -> usize {
        let mut reaped = 0;
        for handle in self.recorded() {
            if let Err(e) = runtime.stop(&handle, Duration::ZERO).await {
                tracing::debug!(container = %handle.id, error = %e, "Orphaned container did not stop");
            }
            match runtime.remove(&handle).await {
                Ok(()) => {
                    tracing::warn!(container = %handle.id, "Reaped orphaned frame container");
                    reaped += 1;
                }
                Err(e) => {
                    tracing::warn!(container = %handle.id, error = %e, "Failed to remove orphaned container")
                }
            }
            self.forget(&handle);
        }
        reaped
    }
}
