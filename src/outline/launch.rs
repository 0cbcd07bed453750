use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::OutlineConfig;
use crate::error::Result;
use crate::modules::ModuleRegistry;
use crate::outline::Outline;

/// A job the orchestrator accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    pub name: String,
}

/// The scheduling service jobs are handed to. Its transport is not ours.
pub trait Orchestrator {
    fn launch(&mut self, session_path: &Path, pause: bool) -> Result<Vec<JobHandle>>;
}

/// Set the outline up and hand its session to `orchestrator`.
///
/// Nothing is launched when setup fails.
pub fn launch(
    outline: &mut Outline,
    registry: &ModuleRegistry,
    config: &OutlineConfig,
    orchestrator: &mut dyn Orchestrator,
    pause: bool,
) -> Result<Vec<JobHandle>> {
    outline.setup(registry, config)?;
    let session = outline.session().ok_or_else(|| {
        crate::error::FarmError::Internal("setup finished without a session".to_string())
    })?;
    tracing::info!(job = %outline.job_name(), session = %session.path().display(), pause, "Launching outline");
    let handles = orchestrator.launch(session.path(), pause)?;
    tracing::info!(job = %outline.job_name(), jobs = handles.len(), "Outline launched");
    Ok(handles)
}
