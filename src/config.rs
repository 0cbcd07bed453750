use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FarmError, Result};

/// Environment variable overriding the session root template.
pub const SESSION_ROOT_ENV: &str = "FRAMEFARM_SESSION_ROOT";

fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string())
}

/// Name of the local host as reported by the kernel.
pub fn local_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "Cannot read hostname, using localhost");
            "localhost".to_string()
        }
    }
}

/// Submission-side configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlineConfig {
    /// Template for the directory sessions are created under. `{HOME}`,
    /// `{SHOW}` and `{SHOT}` are expanded when a session is created.
    pub session_root: String,
}

impl Default for OutlineConfig {
    fn default() -> Self {
        Self {
            session_root: std::env::var(SESSION_ROOT_ENV)
                .unwrap_or_else(|_| "{HOME}/.framefarm/sessions".to_string()),
        }
    }
}

impl OutlineConfig {
    pub fn with_session_root(mut self, root: impl Into<String>) -> Self {
        self.session_root = root.into();
        self
    }

    pub fn resolve_session_root(&self, show: &str, shot: &str) -> PathBuf {
        PathBuf::from(
            self.session_root
                .replace("{HOME}", &home_dir())
                .replace("{SHOW}", show)
                .replace("{SHOT}", shot),
        )
    }
}

/// Resources a worker host offers to frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostCapacity {
    pub cores: f32,
    pub memory_kb: u64,
    pub gpu_memory_kb: u64,
}

impl Default for HostCapacity {
    fn default() -> Self {
        Self::detect()
    }
}

impl HostCapacity {
    /// Read core count and total memory from the running host.
    pub fn detect() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as f32)
            .unwrap_or(1.0);
        let memory_kb = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|text| {
                text.lines()
                    .find(|l| l.starts_with("MemTotal:"))
                    .and_then(|l| l.split_whitespace().nth(1))
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(16 * 1024 * 1024);
        Self {
            cores,
            memory_kb,
            gpu_memory_kb: 0,
        }
    }
}

/// A host path bind-mounted into frame containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

impl MountConfig {
    /// Rendered as a `--mount` argument value.
    pub fn to_docker_arg(&self) -> String {
        let mut arg = format!("type=bind,source={},target={}", self.source, self.target);
        if self.read_only {
            arg.push_str(",readonly");
        }
        arg
    }
}

/// OS resource limits applied to native frames. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RlimitConfig {
    pub address_space_kb: Option<u64>,
    pub max_processes: Option<u64>,
    pub open_files: Option<u64>,
    pub cpu_seconds: Option<u64>,
}

/// Worker-side configuration for the frame launcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub listen_addr: SocketAddr,
    /// Reported to the orchestrator and used as the container hostname
    pub hostname: String,
    pub capacity: HostCapacity,
    /// Frame logs land in `{log_root}/{job_name}/` unless the RunFrame names
    /// its own log directory
    pub log_root: PathBuf,
    pub working_dir: PathBuf,
    /// Run frames inside containers instead of as native processes
    pub container_mode: bool,
    /// Request GPU devices for containerized frames
    pub gpu_mode: bool,
    pub docker_binary: String,
    /// Maps RunFrame `os` tags to container images
    pub images: BTreeMap<String, String>,
    pub default_image: String,
    pub mounts: Vec<MountConfig>,
    /// Time between SIGTERM and SIGKILL on a soft kill
    pub kill_grace_ms: u64,
    pub sample_interval_ms: u64,
    pub container_log_interval_ms: u64,
    pub status_interval_ms: u64,
    pub max_wall_time_secs: Option<u64>,
    /// Kill native frames whose RSS exceeds their memory reservation
    pub enforce_memory_limit: bool,
    pub rlimits: RlimitConfig,
    /// Parent environment variables never passed to frames. A leading or
    /// trailing `*` matches a suffix or prefix.
    pub env_secrets: Vec<String>,
    /// Case-insensitive substrings that mark a log line as error-like
    pub error_patterns: Vec<String>,
    pub max_error_lines: usize,
    /// Binary invoked for layers that execute in-process
    pub executor_path: PathBuf,
    pub reboot_command: Vec<String>,
    pub session_retry_backoff_ms: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 50061)),
            hostname: local_hostname(),
            capacity: HostCapacity::default(),
            log_root: std::env::temp_dir().join("framefarm").join("logs"),
            working_dir: std::env::temp_dir(),
            container_mode: false,
            gpu_mode: false,
            docker_binary: "docker".to_string(),
            images: BTreeMap::new(),
            default_image: "ubuntu:latest".to_string(),
            mounts: Vec::new(),
            kill_grace_ms: 10_000,
            sample_interval_ms: 5_000,
            container_log_interval_ms: 1_000,
            status_interval_ms: 60_000,
            max_wall_time_secs: None,
            enforce_memory_limit: true,
            rlimits: RlimitConfig::default(),
            env_secrets: vec![
                "*_SECRET".to_string(),
                "*_TOKEN".to_string(),
                "*_PASSWORD".to_string(),
                "AWS_SECRET_ACCESS_KEY".to_string(),
            ],
            error_patterns: vec![
                "error".to_string(),
                "traceback".to_string(),
                "segmentation fault".to_string(),
                "bad_alloc".to_string(),
            ],
            max_error_lines: 5,
            executor_path: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("framefarm")),
            reboot_command: vec!["/sbin/reboot".to_string()],
            session_retry_backoff_ms: 2_000,
        }
    }
}

impl LauncherConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    /// Load a YAML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            FarmError::Usage(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn with_image(mut self, os: impl Into<String>, image: impl Into<String>) -> Self {
        self.images.insert(os.into(), image.into());
        self
    }

    pub fn with_mount(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.mounts.push(MountConfig {
            source: source.into(),
            target: target.into(),
            read_only: false,
        });
        self
    }

    /// Image for an `os` tag. No tag selects the default image.
    pub fn image_for(&self, os: Option<&str>) -> Result<String> {
        match os {
            None | Some("") => Ok(self.default_image.clone()),
            Some(tag) => self
                .images
                .get(tag)
                .cloned()
                .ok_or_else(|| FarmError::UnknownImage(tag.to_string())),
        }
    }

    pub fn is_secret(&self, name: &str) -> bool {
        self.env_secrets.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix('*') {
                name.ends_with(suffix)
            } else if let Some(prefix) = pattern.strip_suffix('*') {
                name.starts_with(prefix)
            } else {
                name == pattern
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outline_config_expands_placeholders() {
        let cfg = OutlineConfig::default().with_session_root("/jobs/{SHOW}/{SHOT}/sessions");
        assert_eq!(
            cfg.resolve_session_root("testing", "shot01"),
            PathBuf::from("/jobs/testing/shot01/sessions")
        );
    }

    #[test]
    fn hostname_comes_from_the_kernel() {
        let name = local_hostname();
        assert!(!name.is_empty());
        assert!(!name.contains('\0'));
    }

    #[test]
    fn launcher_config_default() {
        let cfg = LauncherConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:50061");
        assert!(!cfg.container_mode);
        assert_eq!(cfg.container_log_interval_ms, 1_000);
        assert!(cfg.max_wall_time_secs.is_none());
        assert!(cfg.capacity.cores >= 1.0);
    }

    #[test]
    fn image_for_uses_default_without_tag() {
        let cfg = LauncherConfig::default().with_image("rocky9", "rockylinux:9");
        assert_eq!(cfg.image_for(None).unwrap(), "ubuntu:latest");
        assert_eq!(cfg.image_for(Some("rocky9")).unwrap(), "rockylinux:9");
        assert!(matches!(
            cfg.image_for(Some("centos7")),
            Err(FarmError::UnknownImage(_))
        ));
    }

    #[test]
    fn secret_patterns_match() {
        let cfg = LauncherConfig::default();
        assert!(cfg.is_secret("GITHUB_TOKEN"));
        assert!(cfg.is_secret("AWS_SECRET_ACCESS_KEY"));
        assert!(!cfg.is_secret("PATH"));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launcher.yaml");
        std::fs::write(&path, "container_mode: true\nimages:\n  rocky9: rockylinux:9\n").unwrap();
        let cfg = LauncherConfig::from_file(&path).unwrap();
        assert!(cfg.container_mode);
        assert_eq!(cfg.images.get("rocky9").map(String::as_str), Some("rockylinux:9"));
        assert_eq!(cfg.kill_grace_ms, 10_000);
    }

    #[test]
    fn mount_renders_docker_arg() {
        let cfg = LauncherConfig::default().with_mount("/shows", "/shows");
        assert_eq!(cfg.mounts[0].to_docker_arg(), "type=bind,source=/shows,target=/shows");
    }
}
