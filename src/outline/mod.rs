//! Job graph: outlines, layers and their setup lifecycle.
//!
//! An [`Outline`] is built in memory, then [`Outline::setup`] runs once on the
//! submission host. Setup creates a [`Session`], lets every layer expand
//! itself, validates arguments and dependencies, and freezes the result as
//! `outline.yaml`. Workers reload that snapshot with [`load_outline`] and run
//! single frames through [`Outline::execute`].

pub mod context;
pub mod depend;
pub mod io;
pub mod launch;
pub mod layer;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::OutlineConfig;
use crate::error::{ExitCategory, FarmError, Result};
use crate::frameset::FrameSet;
use crate::modules::ModuleRegistry;
use crate::session::{Session, OUTLINE_FILE};
use crate::tokens::FrameContext;
use crate::value::Value;

pub use context::{ExecContext, SetupContext};
pub use depend::{Depend, DependType};
pub use io::{IoPath, OutputRef};
pub use launch::{launch, JobHandle, Orchestrator};
pub use layer::{ArgKind, Layer, LayerRole, LayerType, ARGS_OVERRIDE_DATA, OUTPUTS_DATA};

/// Session root exported to every frame.
pub const ENV_BASE_SESSION_PATH: &str = "OL_BASE_SESSION_PATH";
/// Layer scope exported to every frame.
pub const ENV_LAYER_SESSION_PATH: &str = "OL_LAYER_SESSION_PATH";
/// Resolved layer range exported to every frame.
pub const ENV_LAYER_RANGE: &str = "OL_LAYER_RANGE";

/// Result of running one frame in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Completed,
    /// The frame is outside the layer's resolved frame set
    Skipped,
}

impl ExecOutcome {
    pub fn category(&self) -> ExitCategory {
        match self {
            ExecOutcome::Completed => ExitCategory::Success,
            ExecOutcome::Skipped => ExitCategory::Skipped,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outline {
    name: String,
    show: String,
    shot: String,
    user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    facility: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    frame_range: Option<String>,
    #[serde(default)]
    args: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    env: BTreeMap<String, String>,
    /// UID of the submitting user, recorded at setup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uid: Option<u32>,
    #[serde(default)]
    is_setup: bool,
    #[serde(default)]
    layers: Vec<Layer>,
    #[serde(skip)]
    session: Option<Session>,
}

impl Outline {
    pub fn new(
        name: impl Into<String>,
        show: impl Into<String>,
        shot: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            show: show.into(),
            shot: shot.into(),
            user: user.into(),
            facility: None,
            frame_range: None,
            args: BTreeMap::new(),
            env: BTreeMap::new(),
            uid: None,
            is_setup: false,
            layers: Vec::new(),
            session: None,
        }
    }

    pub fn with_facility(mut self, facility: impl Into<String>) -> Self {
        self.facility = Some(facility.into());
        self
    }

    pub fn with_frame_range(mut self, range: &str) -> Result<Self> {
        self.set_frame_range(range)?;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn show(&self) -> &str {
        &self.show
    }

    pub fn shot(&self) -> &str {
        &self.shot
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn facility(&self) -> Option<&str> {
        self.facility.as_deref()
    }

    pub fn uid(&self) -> Option<u32> {
        self.uid
    }

    /// `show-shot-user_name`
    pub fn job_name(&self) -> String {
        format!("{}-{}-{}_{}", self.show, self.shot, self.user, self.name)
    }

    pub fn frame_range(&self) -> Option<&str> {
        self.frame_range.as_deref()
    }

    pub fn set_frame_range(&mut self, range: &str) -> Result<()> {
        self.ensure_mutable()?;
        FrameSet::parse(range)?;
        self.frame_range = Some(range.to_string());
        Ok(())
    }

    pub fn set_arg(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.ensure_mutable()?;
        self.args.insert(key.to_string(), value.into());
        Ok(())
    }

    pub fn get_arg(&self, key: &str) -> Option<&Value> {
        self.args.get(key)
    }

    /// Export `key` to every frame of the job.
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.ensure_mutable()?;
        self.env.insert(key.into(), value.into());
        Ok(())
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn is_setup(&self) -> bool {
        self.is_setup
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.is_setup {
            return Err(FarmError::Outline(format!(
                "outline {} is already set up and read-only",
                self.name
            )));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Layers
    // ---------------------------------------------------------------------

    pub fn add_layer(&mut self, layer: Layer) -> Result<()> {
        self.ensure_mutable()?;
        self.push_layer(layer)
    }

    fn push_layer(&mut self, layer: Layer) -> Result<()> {
        if self.layers.iter().any(|l| l.name() == layer.name()) {
            return Err(FarmError::DuplicateLayer(layer.name().to_string()));
        }
        tracing::debug!(outline = %self.name, layer = %layer.name(), "Adding layer");
        self.layers.push(layer);
        Ok(())
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn get_layer(&self, name: &str) -> Result<&Layer> {
        self.layers
            .iter()
            .find(|l| l.name() == name)
            .ok_or_else(|| FarmError::UnknownLayer(name.to_string()))
    }

    pub fn get_layer_mut(&mut self, name: &str) -> Result<&mut Layer> {
        self.ensure_mutable()?;
        self.layers
            .iter_mut()
            .find(|l| l.name() == name)
            .ok_or_else(|| FarmError::UnknownLayer(name.to_string()))
    }

    /// Make this outline current: layers created through the returned scope
    /// register themselves with it.
    pub fn scope<'a>(&'a mut self, registry: &'a ModuleRegistry) -> LayerScope<'a> {
        LayerScope {
            outline: self,
            registry,
        }
    }

    /// The resolved frame set of `layer`; empty when the layer is skipped.
    pub fn layer_frame_set(&self, layer: &str) -> Result<FrameSet> {
        self.get_layer(layer)?.frame_set(self)
    }

    // ---------------------------------------------------------------------
    // Setup
    // ---------------------------------------------------------------------

    /// Create the session, expand and validate every layer and freeze the
    /// outline into the session. Runs once; a second call fails with
    /// `SessionConflict`.
    pub fn setup(&mut self, registry: &ModuleRegistry, config: &OutlineConfig) -> Result<()> {
        if self.is_setup || self.session.is_some() {
            return Err(FarmError::SessionConflict(format!(
                "outline {} already has a session",
                self.job_name()
            )));
        }

        let root = config.resolve_session_root(&self.show, &self.shot);
        let session = Session::create(&root, &self.job_name())?;

        tracing::info!(outline = %self.name, session = %session.name(), "Setting up outline");

        // Setup hooks mutate layers and may queue new ones
        let layers = self.layers.clone();
        match self.setup_in(registry, &session) {
            Ok(()) => {
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(outline = %self.name, error = %e, "Outline setup failed, removing session");
                self.layers = layers;
                self.uid = None;
                self.is_setup = false;
                if let Err(rm) = std::fs::remove_dir_all(session.path()) {
                    tracing::warn!(path = %session.path().display(), error = %rm, "Failed to remove session");
                }
                Err(e)
            }
        }
    }

    fn setup_in(&mut self, registry: &ModuleRegistry, session: &Session) -> Result<()> {
        let job_name = self.job_name();
        let frame_range = self.frame_range.clone();

        // Setup hooks may add layers; those are appended and set up in turn.
        let mut idx = 0;
        while idx < self.layers.len() {
            let mut ctx = SetupContext::new(session, &job_name, frame_range.as_deref());
            {
                let layer = &mut self.layers[idx];
                tracing::debug!(layer = %layer.name(), "Setting up layer");
                registry.get(layer.module())?.setup(layer, &mut ctx)?;
                for child in layer.children_mut().iter_mut() {
                    registry.get(child.module())?.setup(child, &mut ctx)?;
                }
                layer.mark_setup();
            }
            for added in ctx.into_added() {
                self.push_layer(added)?;
            }
            idx += 1;
        }

        for layer in &self.layers {
            layer.check_required_args()?;
        }

        self.resolve_dependencies()?;

        for layer in &self.layers {
            session.get_path(Some(layer.name()))?;
        }

        self.uid = Some(nix::unistd::getuid().as_raw());
        self.is_setup = true;

        let text = serde_yaml::to_string(&*self)?;
        session.put_text(OUTLINE_FILE, &text, None, false)?;
        session.save()?;
        Ok(())
    }

    /// Validate targets, chain pre-process dependencies and reject cycles.
    fn resolve_dependencies(&mut self) -> Result<()> {
        for layer in &self.layers {
            for dep in layer.depends() {
                if !self.layers.iter().any(|l| l.name() == dep.on_layer) {
                    return Err(FarmError::UnknownLayer(format!(
                        "{} (dependency of {})",
                        dep.on_layer,
                        layer.name()
                    )));
                }
            }
        }

        self.bind_inputs()?;

        // A pre-process waits for the pre-processes of whatever its creator
        // depends on.
        let preprocess_of: BTreeMap<String, String> = self
            .layers
            .iter()
            .filter_map(|l| match l.role() {
                LayerRole::PreProcess { creator } => Some((creator.clone(), l.name().to_string())),
                _ => None,
            })
            .collect();
        let mut chained: Vec<(String, String)> = Vec::new();
        for layer in &self.layers {
            if let Some(my_pre) = preprocess_of.get(layer.name()) {
                for dep in layer.depends() {
                    if let Some(their_pre) = preprocess_of.get(&dep.on_layer) {
                        chained.push((my_pre.clone(), their_pre.clone()));
                    }
                }
            }
        }
        for (pre, on) in chained {
            if let Some(layer) = self.layers.iter_mut().find(|l| l.name() == pre) {
                layer.depend_all(&on);
            }
        }

        let graph: BTreeMap<String, Vec<String>> = self
            .layers
            .iter()
            .map(|l| {
                (
                    l.name().to_string(),
                    l.depends().iter().map(|d| d.on_layer.clone()).collect(),
                )
            })
            .collect();
        depend::check_acyclic(&graph)
    }

    /// Turn each bound input into a dependency on its upstream layer and
    /// copy statically declared upstream outputs into the input.
    fn bind_inputs(&mut self) -> Result<()> {
        let mut bound: Vec<(usize, String, OutputRef, Option<IoPath>)> = Vec::new();
        for (idx, layer) in self.layers.iter().enumerate() {
            for (input, source) in layer.bound_inputs() {
                if source.layer == layer.name() {
                    return Err(FarmError::InvalidArgument(format!(
                        "layer {} input {} is bound to its own output",
                        layer.name(),
                        input
                    )));
                }
                let upstream = self.get_layer(&source.layer).map_err(|_| {
                    FarmError::UnknownLayer(format!("{} (input {} of {})", source.layer, input, layer.name()))
                })?;
                let declared = upstream.get_output(&source.output).cloned();
                let has_preprocess = self.layers.iter().any(|l| {
                    matches!(l.role(), LayerRole::PreProcess { creator } if *creator == source.layer)
                });
                if declared.is_none() && !has_preprocess {
                    return Err(FarmError::InvalidArgument(format!(
                        "layer {} input {} is bound to output {} of {}, which is not declared",
                        layer.name(),
                        input,
                        source.output,
                        source.layer
                    )));
                }
                bound.push((idx, input.clone(), source.clone(), declared));
            }
        }

        for (idx, input, source, declared) in bound {
            let layer = &mut self.layers[idx];
            layer.depend_all(&source.layer);
            if let Some(path) = declared {
                layer.add_input(input, path);
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Execute
    // ---------------------------------------------------------------------

    /// Worker entry point: run `frame` of `layer_name` in-process.
    pub fn execute(&self, registry: &ModuleRegistry, layer_name: &str, frame: i64) -> Result<ExecOutcome> {
        let session = self.session.as_ref().ok_or_else(|| {
            FarmError::Outline(format!("outline {} has no session", self.name))
        })?;
        let mut layer = self.get_layer(layer_name)?.clone();

        let frames = layer.frame_set(self)?;
        if !frames.contains(frame) {
            tracing::info!(layer = layer_name, frame, "Frame outside of layer frame set, skipping");
            return Ok(ExecOutcome::Skipped);
        }
        let local = frames.local_frame_set(frame, layer.chunk_size())?;

        let ctx = ExecContext {
            session,
            frame: FrameContext::new(&self.job_name(), layer_name, frame, &local, layer.chunk_size()),
            env: self.frame_env(&layer, &frames)?,
            frames: local,
        };
        layer.execute(registry, &ctx)?;
        Ok(ExecOutcome::Completed)
    }

    /// Variables every frame of `layer` sees on top of the worker environment.
    pub fn frame_env(&self, layer: &Layer, frames: &FrameSet) -> Result<BTreeMap<String, String>> {
        let session = self.session.as_ref().ok_or_else(|| {
            FarmError::Outline(format!("outline {} has no session", self.name))
        })?;
        let mut env = self.env.clone();
        env.extend(layer.env().iter().map(|(k, v)| (k.clone(), v.clone())));
        env.insert(
            ENV_BASE_SESSION_PATH.to_string(),
            session.path().display().to_string(),
        );
        env.insert(
            ENV_LAYER_SESSION_PATH.to_string(),
            session.get_path(Some(layer.name()))?.display().to_string(),
        );
        env.insert(ENV_LAYER_RANGE.to_string(), frames.to_string());
        Ok(env)
    }
}

/// Reconstruct the outline frozen in the session at `path`.
pub fn load_outline(path: &Path, registry: &ModuleRegistry) -> Result<Outline> {
    let session = Session::open(path)?;
    let file = session.get_file(OUTLINE_FILE, None, true, false)?;
    let text = std::fs::read_to_string(&file)?;
    let mut outline: Outline = serde_yaml::from_str(&text)?;
    for layer in &mut outline.layers {
        layer.schema_from(registry)?;
    }
    tracing::debug!(outline = %outline.name, session = %session.name(), "Loaded outline");
    outline.session = Some(session);
    Ok(outline)
}

/// Layers created through a scope register with its outline on creation.
pub struct LayerScope<'a> {
    outline: &'a mut Outline,
    registry: &'a ModuleRegistry,
}

impl<'a> LayerScope<'a> {
    /// Create a layer of module `tag` and register it with the outline.
    pub fn layer(&mut self, tag: &str, name: &str) -> Result<&mut Layer> {
        let layer = self.registry.create(tag, name)?;
        self.outline.add_layer(layer)?;
        self.outline.get_layer_mut(name)
    }

    pub fn outline(&mut self) -> &mut Outline {
        self.outline
    }
}
