use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::process::Command;

use crate::error::{FarmError, Result};
use crate::frameset::FrameSet;
use crate::outline::layer::Layer;
use crate::session::Session;
use crate::tokens::FrameContext;

/// Handed to a layer's setup hook.
pub struct SetupContext<'a> {
    session: &'a Session,
    job_name: &'a str,
    frame_range: Option<&'a str>,
    added: Vec<Layer>,
}

impl<'a> SetupContext<'a> {
    pub(crate) fn new(session: &'a Session, job_name: &'a str, frame_range: Option<&'a str>) -> Self {
        Self {
            session,
            job_name,
            frame_range,
            added: Vec::new(),
        }
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    pub fn job_name(&self) -> &str {
        self.job_name
    }

    pub fn outline_frame_range(&self) -> Option<&str> {
        self.frame_range
    }

    /// Queue a layer for the outline. It is set up after the current one.
    pub fn add_layer(&mut self, layer: Layer) {
        self.added.push(layer);
    }

    pub(crate) fn into_added(self) -> Vec<Layer> {
        self.added
    }
}

/// Handed to a module's execute hook for one frame invocation.
pub struct ExecContext<'a> {
    pub session: &'a Session,
    pub frame: FrameContext,
    /// The chunk window this invocation is responsible for
    pub frames: FrameSet,
    /// Variables layered on top of the inherited process environment
    pub env: BTreeMap<String, String>,
}

impl<'a> ExecContext<'a> {
    /// Substitute frame tokens and run `command` to completion.
    pub fn run_command(&self, command: &[String]) -> Result<()> {
        let argv = self.frame.substitute_all(command);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| FarmError::Layer("empty command".to_string()))?;

        tracing::info!(layer = %self.frame.layer, frame = self.frame.frame, command = ?argv, "Running command");

        let status = Command::new(program)
            .args(args)
            .envs(&self.env)
            .status()
            .map_err(|e| FarmError::FailedLaunch(format!("{}: {}", program, e)))?;

        if status.success() {
            return Ok(());
        }
        match (status.code(), status.signal()) {
            (Some(code), _) => Err(FarmError::ShellCommand {
                command: argv.join(" "),
                status: code,
            }),
            (None, Some(signal)) => Err(FarmError::CommandSignalled {
                command: argv.join(" "),
                signal,
            }),
            (None, None) => Err(FarmError::Internal(format!(
                "{} ended without status or signal",
                program
            ))),
        }
    }
}
