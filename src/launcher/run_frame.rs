use std::collections::BTreeMap;
use std::path::PathBuf;

use nix::unistd::{getgid, getuid};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resources a frame holds while it runs.
///
/// `cores` is kept as given: a negative value asks for the whole host and
/// zero runs the frame on whatever is free.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub cores: f32,
    pub memory_kb: u64,
    #[serde(default)]
    pub gpu_memory_kb: u64,
}

impl Reservation {
    pub fn new(cores: f32, memory_kb: u64) -> Self {
        Self {
            cores,
            memory_kb,
            gpu_memory_kb: 0,
        }
    }

    pub fn with_gpu_memory(mut self, gpu_memory_kb: u64) -> Self {
        self.gpu_memory_kb = gpu_memory_kb;
        self
    }
}

/// Dispatch record for a single frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFrame {
    pub frame_id: String,
    pub session_path: PathBuf,
    pub layer: String,
    pub frame: i64,
    pub uid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    pub user_name: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub reservation: Reservation,
    /// Selects the container image in container mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
}

impl RunFrame {
    /// A RunFrame for the calling user with a fresh frame id and no
    /// reservation.
    pub fn new(session_path: impl Into<PathBuf>, layer: impl Into<String>, frame: i64) -> Self {
        let (uid, gid) = (getuid().as_raw(), getgid().as_raw());
        Self {
            frame_id: Uuid::new_v4().to_string(),
            session_path: session_path.into(),
            layer: layer.into(),
            frame,
            uid,
            gid: Some(gid),
            user_name: std::env::var("USER").unwrap_or_else(|_| uid.to_string()),
            env: BTreeMap::new(),
            log_dir: None,
            reservation: Reservation::default(),
            os: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_reservation(mut self, reservation: Reservation) -> Self {
        self.reservation = reservation;
        self
    }

    pub fn with_os(mut self, os: impl Into<String>) -> Self {
        self.os = Some(os.into());
        self
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    /// Identity used to reject concurrent runs of the same frame.
    pub fn dispatch_key(&self) -> String {
        format!("{}:{}:{}", self.session_path.display(), self.layer, self.frame)
    }
}
