//! Worker-side execution of single frames.
//!
//! A [`RunFrame`] goes through these steps:
//! - **Validation**: reload the outline from the session, check the layer,
//!   the frame and the uid
//! - **Environment**: sanitized parent env, worker identity, outline env,
//!   RunFrame overrides, then frame tokens
//! - **Logging**: output is appended to `{log_dir}/{job}/{frame}.rqlog`
//! - **Reservation**: cores and memory are booked against host capacity
//! - **Execution**: a native process group or a container
//! - **Supervision**: sampling, kills, wall-time and memory limits
//! - **Completion**: a [`FrameCompleteReport`] goes to the [`ReportSink`]
//!
//! # Components
//!
//! - [`FrameLauncher`]: owns running frames and the host state
//! - [`ContainerRuntime`]: container client, with [`DockerCli`] as the
//!   default implementation
//! - [`StatusReporter`]: periodic status reports

pub mod container;
pub mod env;
pub mod logging;
pub mod manager;
pub mod native;
pub mod report;
pub mod reservation;
pub mod run_frame;
pub mod running;
pub mod sampler;
pub mod supervisor;

pub use container::{
    ContainerExit, ContainerHandle, ContainerLogs, ContainerRuntime, ContainerSpec, DockerCli,
    LogOffsets,
};
pub use manager::{FrameLauncher, HostState, LaunchOutcome, ShutdownMode};
pub use report::{
    ChannelReportSink, FrameCompleteReport, LogReportSink, Report, ReportSink, StartupReport,
    StatusReport, StatusReporter,
};
pub use reservation::ReservationBook;
pub use run_frame::{Reservation, RunFrame};
pub use running::{FrameStats, KillReason, KillRequest, RunningFrameInfo};
