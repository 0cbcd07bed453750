//! Native frame processes.
//!
//! Each frame becomes the leader of its own session so the whole tree it
//! spawns can be signalled through the process group.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{geteuid, setsid, Pid};
use tokio::process::{Child, Command};

use crate::config::RlimitConfig;
use crate::error::{FarmError, Result};

#[derive(Debug, Clone)]
pub struct NativeSpec {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub uid: u32,
    pub gid: Option<u32>,
    pub rlimits: RlimitConfig,
}

/// Best effort: a limit above the inherited hard limit is refused and the
/// inherited one stays in force.
fn set_rlimit(resource: Resource, value: Option<u64>) {
    if let Some(value) = value {
        let _ = setrlimit(resource, value, value);
    }
}

/// Start `spec.command` with piped output.
///
/// When the launcher runs as root the process switches to the frame's uid
/// and gid; otherwise it keeps the launcher's identity.
pub fn spawn(spec: &NativeSpec) -> Result<Child> {
    let (program, args) = spec
        .command
        .split_first()
        .ok_or_else(|| FarmError::FailedLaunch("empty command".to_string()))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .envs(&spec.env)
        .current_dir(&spec.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if geteuid().is_root() && spec.uid != 0 {
        if let Some(gid) = spec.gid {
            cmd.gid(gid);
        }
        cmd.uid(spec.uid);
    }

    let limits = spec.rlimits.clone();
    let address_space = limits.address_space_kb.map(|kb| kb.saturating_mul(1024));
    let (nproc, nofile, cpu) = (limits.max_processes, limits.open_files, limits.cpu_seconds);
    // SAFETY: the hook only makes raw syscalls through nix and does not
    // allocate.
    unsafe {
        cmd.pre_exec(move || {
            setsid().map_err(std::io::Error::from)?;
            set_rlimit(Resource::RLIMIT_AS, address_space);
            set_rlimit(Resource::RLIMIT_NPROC, nproc);
            set_rlimit(Resource::RLIMIT_NOFILE, nofile);
            set_rlimit(Resource::RLIMIT_CPU, cpu);
            Ok(())
        });
    }

    cmd.spawn()
        .map_err(|e| FarmError::FailedLaunch(format!("{}: {}", program, e)))
}

/// Send `signal` to the process group led by `pgid`. Returns false when the
/// group no longer exists.
pub fn signal_group(pgid: u32, signal: Signal) -> bool {
    let Ok(raw) = i32::try_from(pgid) else {
        return false;
    };
    if raw == 0 {
        return false;
    }
    killpg(Pid::from_raw(raw), signal).is_ok()
}
