use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal categories reported to the orchestrator for every frame and
/// every rejected request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitCategory {
    Success,
    Usage,
    InvalidArg,
    RangeSyntax,
    SessionIo,
    DependencyCycle,
    UnknownLayer,
    Skipped,
    FailedLaunch,
    TimedOut,
    Cancelled,
    Oom,
    ChildExitNonzero,
    ChildSignalled,
    Internal,
}

impl ExitCategory {
    /// Categories that count as a finished frame from the orchestrator's view.
    pub fn is_success(&self) -> bool {
        matches!(self, ExitCategory::Success | ExitCategory::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitCategory::Success => "SUCCESS",
            ExitCategory::Usage => "USAGE",
            ExitCategory::InvalidArg => "INVALID_ARG",
            ExitCategory::RangeSyntax => "RANGE_SYNTAX",
            ExitCategory::SessionIo => "SESSION_IO",
            ExitCategory::DependencyCycle => "DEPENDENCY_CYCLE",
            ExitCategory::UnknownLayer => "UNKNOWN_LAYER",
            ExitCategory::Skipped => "SKIPPED",
            ExitCategory::FailedLaunch => "FAILED_LAUNCH",
            ExitCategory::TimedOut => "TIMED_OUT",
            ExitCategory::Cancelled => "CANCELLED",
            ExitCategory::Oom => "OOM",
            ExitCategory::ChildExitNonzero => "CHILD_EXIT_NONZERO",
            ExitCategory::ChildSignalled => "CHILD_SIGNALLED",
            ExitCategory::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ExitCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum FarmError {
    #[error("Invalid frame range '{range}': {reason}")]
    RangeSyntax { range: String, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to create session path {path}: {reason}")]
    SessionPath { path: String, reason: String },

    #[error("Session entry not found: {0}")]
    SessionNotFound(String),

    #[error("Session entry already exists: {0}")]
    SessionConflict(String),

    #[error("Session I/O error: {0}")]
    SessionIo(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),

    #[error("Value cannot be stored in a session: {0}")]
    UnportableValue(String),

    #[error("Dependency cycle detected: {0}")]
    DependencyCycle(String),

    #[error("Unknown layer: {0}")]
    UnknownLayer(String),

    #[error("A layer named {0} already exists")]
    DuplicateLayer(String),

    #[error("Unknown layer module: {0}")]
    UnknownModule(String),

    #[error("Layer error: {0}")]
    Layer(String),

    #[error("Outline error: {0}")]
    Outline(String),

    #[error("Shell command '{command}' failed with exit status {status}")]
    ShellCommand { command: String, status: i32 },

    #[error("Shell command '{command}' was killed by signal {signal}")]
    CommandSignalled { command: String, signal: i32 },

    #[error("No container image mapped for os tag {0}")]
    UnknownImage(String),

    #[error("Frame {0} is already running")]
    DuplicateFrame(String),

    #[error("Frame not found: {0}")]
    FrameNotFound(String),

    #[error("Insufficient host resources: {0}")]
    InsufficientResources(String),

    #[error("Host is locked: {0}")]
    HostLocked(String),

    #[error("Frame belongs to uid {expected}, launch requested uid {actual}")]
    UidMismatch { expected: u32, actual: u32 },

    #[error("Frame {frame} is outside the frame set of layer {layer}")]
    FrameOutOfRange { layer: String, frame: i64 },

    #[error("Failed to launch frame: {0}")]
    FailedLaunch(String),

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FarmError {
    pub fn category(&self) -> ExitCategory {
        match self {
            FarmError::RangeSyntax { .. } => ExitCategory::RangeSyntax,
            FarmError::InvalidArgument(_) | FarmError::UnportableValue(_) => {
                ExitCategory::InvalidArg
            }
            FarmError::SessionPath { .. }
            | FarmError::SessionNotFound(_)
            | FarmError::SessionConflict(_)
            | FarmError::SessionIo(_)
            | FarmError::Serialization(_) => ExitCategory::SessionIo,
            FarmError::DependencyCycle(_) => ExitCategory::DependencyCycle,
            FarmError::UnknownLayer(_) => ExitCategory::UnknownLayer,
            FarmError::FrameOutOfRange { .. } => ExitCategory::Skipped,
            FarmError::ShellCommand { .. } => ExitCategory::ChildExitNonzero,
            FarmError::CommandSignalled { .. } => ExitCategory::ChildSignalled,
            FarmError::UnknownImage(_) | FarmError::FailedLaunch(_) => ExitCategory::FailedLaunch,
            FarmError::DuplicateLayer(_)
            | FarmError::UnknownModule(_)
            | FarmError::Layer(_)
            | FarmError::Outline(_)
            | FarmError::DuplicateFrame(_)
            | FarmError::FrameNotFound(_)
            | FarmError::InsufficientResources(_)
            | FarmError::HostLocked(_)
            | FarmError::UidMismatch { .. }
            | FarmError::Usage(_) => ExitCategory::Usage,
            FarmError::Grpc(_) | FarmError::Transport(_) | FarmError::Internal(_) => {
                ExitCategory::Internal
            }
        }
    }

    /// Session I/O faults are the only ones the launcher retries locally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FarmError::SessionIo(_) | FarmError::SessionNotFound(_) | FarmError::Serialization(_)
        )
    }
}

impl From<FarmError> for tonic::Status {
    fn from(err: FarmError) -> Self {
        match err {
            FarmError::Grpc(status) => status,
            FarmError::FrameNotFound(_) | FarmError::UnknownLayer(_) => {
                tonic::Status::not_found(err.to_string())
            }
            FarmError::DuplicateFrame(_) => tonic::Status::already_exists(err.to_string()),
            FarmError::UidMismatch { .. } => tonic::Status::permission_denied(err.to_string()),
            FarmError::InsufficientResources(_) | FarmError::HostLocked(_) => {
                tonic::Status::failed_precondition(err.to_string())
            }
            FarmError::Usage(_)
            | FarmError::InvalidArgument(_)
            | FarmError::RangeSyntax { .. }
            | FarmError::FrameOutOfRange { .. } => tonic::Status::invalid_argument(err.to_string()),
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, FarmError>;
