use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FarmError, Result};
use crate::frameset::{FrameSet, DEFAULT_FRAME_RANGE};
use crate::modules::ModuleRegistry;
use crate::outline::context::ExecContext;
use crate::outline::depend::{Depend, DependType};
use crate::outline::io::{IoPath, OutputRef};
use crate::outline::Outline;
use crate::session::Session;
use crate::value::Value;

/// Session data name holding outputs registered by a pre-process.
pub const OUTPUTS_DATA: &str = "ol:outputs";
/// Session data name holding argument overrides applied before execution.
pub const ARGS_OVERRIDE_DATA: &str = "args_override";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LayerType {
    #[default]
    Render,
    Post,
    Util,
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LayerType::Render => "Render",
            LayerType::Post => "Post",
            LayerType::Util => "Util",
        };
        f.write_str(s)
    }
}

/// How a layer relates to the rest of the outline.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerRole {
    #[default]
    Normal,
    /// Single frame: the first frame of the outline range
    Frame,
    /// Runs once before `creator`; its outputs are handed to every frame of `creator`
    PreProcess { creator: String },
    /// Runs once after `creator`
    PostProcess { creator: String },
    /// Runs once after the whole job, even when it failed
    PostCommand,
}

impl LayerRole {
    pub fn is_normal(&self) -> bool {
        matches!(self, LayerRole::Normal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Any,
    Bool,
    Int,
    Float,
    Str,
    List,
    Map,
}

impl ArgKind {
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ArgKind::Any, _) => true,
            (ArgKind::Bool, Value::Bool(_)) => true,
            (ArgKind::Int, Value::Int(_)) => true,
            (ArgKind::Float, Value::Float(_) | Value::Int(_)) => true,
            (ArgKind::Str, Value::Str(_)) => true,
            (ArgKind::List, Value::List(_)) => true,
            (ArgKind::Map, Value::Map(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSpec {
    pub kind: ArgKind,
    pub required: bool,
}

fn default_chunk_size() -> usize {
    1
}

fn default_cores() -> f32 {
    1.0
}

fn default_service() -> String {
    "default".to_string()
}

/// A unit of work producing frames of a single kind.
///
/// Behaviour comes from the module named by `module`; the layer itself only
/// carries data, so it serializes as a plain tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    name: String,
    module: String,
    #[serde(rename = "type", default)]
    layer_type: LayerType,
    #[serde(default)]
    args: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    frame_range: Option<String>,
    #[serde(default = "default_chunk_size")]
    chunk_size: usize,
    /// Negative means all cores, zero means any
    #[serde(default = "default_cores")]
    cores: f32,
    #[serde(default)]
    threadable: bool,
    #[serde(default = "default_service")]
    service: String,
    #[serde(default)]
    limits: Vec<String>,
    #[serde(default)]
    depends: Vec<Depend>,
    #[serde(default)]
    inputs: BTreeMap<String, IoPath>,
    #[serde(default)]
    outputs: BTreeMap<String, IoPath>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    bound_inputs: BTreeMap<String, OutputRef>,
    #[serde(default)]
    children: Vec<Layer>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "LayerRole::is_normal")]
    role: LayerRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<String>,
    #[serde(default)]
    is_setup: bool,
    #[serde(skip)]
    arg_specs: BTreeMap<String, ArgSpec>,
}

impl Layer {
    /// A bare layer. Use [`ModuleRegistry::create`] to also declare the
    /// module's argument schema.
    pub fn new(name: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            layer_type: LayerType::default(),
            args: BTreeMap::new(),
            frame_range: None,
            chunk_size: default_chunk_size(),
            cores: default_cores(),
            threadable: false,
            service: default_service(),
            limits: Vec::new(),
            depends: Vec::new(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            bound_inputs: BTreeMap::new(),
            children: Vec::new(),
            env: BTreeMap::new(),
            role: LayerRole::Normal,
            parent: None,
            is_setup: false,
            arg_specs: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn layer_type(&self) -> LayerType {
        self.layer_type
    }

    pub fn set_type(&mut self, layer_type: LayerType) {
        self.layer_type = layer_type;
    }

    pub fn role(&self) -> &LayerRole {
        &self.role
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn is_setup(&self) -> bool {
        self.is_setup
    }

    pub(crate) fn mark_setup(&mut self) {
        self.is_setup = true;
        for child in &mut self.children {
            child.mark_setup();
        }
    }

    // ---------------------------------------------------------------------
    // Roles
    // ---------------------------------------------------------------------

    /// Turn this layer into a single-frame layer.
    pub fn into_frame(mut self) -> Self {
        self.role = LayerRole::Frame;
        self
    }

    /// Turn this layer into the pre-process of `creator`, which will wait
    /// for it with a `LAYER_ON_LAYER` dependency.
    pub fn into_preprocess(mut self, creator: &mut Layer) -> Self {
        self.name = format!("{}_preprocess", creator.name);
        self.role = LayerRole::PreProcess {
            creator: creator.name.clone(),
        };
        self.layer_type = LayerType::Util;
        self.service = "preprocess".to_string();
        creator.depend_all(&self.name);
        self
    }

    /// Turn this layer into the post-process of `creator`.
    pub fn into_postprocess(mut self, creator: &Layer) -> Self {
        self.name = format!("{}_postprocess", creator.name);
        self.role = LayerRole::PostProcess {
            creator: creator.name.clone(),
        };
        self.layer_type = LayerType::Util;
        self.depend_all(&creator.name);
        self
    }

    /// Turn this layer into a job-level post command.
    pub fn into_post_command(mut self) -> Self {
        self.role = LayerRole::PostCommand;
        self.layer_type = LayerType::Post;
        self.service = "postprocess".to_string();
        self
    }

    pub fn is_preprocess(&self) -> bool {
        matches!(self.role, LayerRole::PreProcess { .. })
    }

    // ---------------------------------------------------------------------
    // Arguments
    // ---------------------------------------------------------------------

    /// Declare a required argument of the given kind.
    pub fn require_arg(&mut self, name: &str, kind: ArgKind) {
        self.arg_specs.insert(
            name.to_string(),
            ArgSpec {
                kind,
                required: true,
            },
        );
    }

    /// Declare an optional argument. `default` is only applied when the
    /// argument has no value yet.
    pub fn declare_arg(&mut self, name: &str, kind: ArgKind, default: impl Into<Value>) {
        self.arg_specs.insert(
            name.to_string(),
            ArgSpec {
                kind,
                required: false,
            },
        );
        let default = default.into();
        if !default.is_null() {
            self.args.entry(name.to_string()).or_insert(default);
        }
    }

    pub fn arg_spec(&self, name: &str) -> Option<&ArgSpec> {
        self.arg_specs.get(name)
    }

    pub fn set_arg(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        if let Some(spec) = self.arg_specs.get(name) {
            if !spec.kind.accepts(&value) {
                return Err(FarmError::InvalidArgument(format!(
                    "layer {} argument {} expects {:?}, got {:?}",
                    self.name, name, spec.kind, value
                )));
            }
        }
        self.args.insert(name.to_string(), value);
        Ok(())
    }

    /// The argument's value. Fails when it is unset and required.
    pub fn get_arg(&self, name: &str) -> Result<Option<&Value>> {
        match self.args.get(name).filter(|v| !v.is_null()) {
            Some(value) => Ok(Some(value)),
            None if self.arg_specs.get(name).map(|s| s.required).unwrap_or(false) => {
                Err(FarmError::InvalidArgument(format!(
                    "layer {} is missing required argument {}",
                    self.name, name
                )))
            }
            None => Ok(None),
        }
    }

    pub fn get_arg_or(&self, name: &str, default: impl Into<Value>) -> Result<Value> {
        Ok(self.get_arg(name)?.cloned().unwrap_or_else(|| default.into()))
    }

    /// String form of an argument, if set.
    pub fn arg_string(&self, name: &str) -> Result<Option<String>> {
        Ok(self.get_arg(name)?.map(|v| v.to_string()))
    }

    pub fn args(&self) -> &BTreeMap<String, Value> {
        &self.args
    }

    pub fn check_required_args(&self) -> Result<()> {
        for (name, spec) in &self.arg_specs {
            if spec.required {
                self.get_arg(name)?;
            }
        }
        for child in &self.children {
            child.check_required_args()?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Scheduling attributes
    // ---------------------------------------------------------------------

    pub fn frame_range(&self) -> Option<&str> {
        self.frame_range.as_deref()
    }

    pub fn set_frame_range(&mut self, range: &str) -> Result<()> {
        FrameSet::parse(range)?;
        self.frame_range = Some(range.to_string());
        Ok(())
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn set_chunk_size(&mut self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(FarmError::InvalidArgument(format!(
                "layer {} chunk size must be at least 1",
                self.name
            )));
        }
        self.chunk_size = size;
        Ok(())
    }

    pub fn cores(&self) -> f32 {
        self.cores
    }

    pub fn set_cores(&mut self, cores: f32) {
        self.cores = cores;
    }

    pub fn threadable(&self) -> bool {
        self.threadable
    }

    pub fn set_threadable(&mut self, threadable: bool) {
        self.threadable = threadable;
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn set_service(&mut self, service: impl Into<String>) {
        self.service = service.into();
    }

    pub fn limits(&self) -> &[String] {
        &self.limits
    }

    pub fn add_limit(&mut self, limit: impl Into<String>) {
        let limit = limit.into();
        if !self.limits.contains(&limit) {
            self.limits.push(limit);
        }
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    // ---------------------------------------------------------------------
    // Dependencies
    // ---------------------------------------------------------------------

    pub fn depends(&self) -> &[Depend] {
        &self.depends
    }

    /// Frame N of this layer waits for frame N of `other`.
    pub fn depend_on(&mut self, other: &str) {
        self.depend_with(other, DependType::FrameByFrame);
    }

    /// Every frame of this layer waits for all of `other`.
    pub fn depend_all(&mut self, other: &str) {
        self.depend_with(other, DependType::LayerOnLayer);
    }

    /// Add a dependency. Self-dependencies and duplicates are ignored; an
    /// unknown target is reported at setup.
    pub fn depend_with(&mut self, other: &str, kind: DependType) {
        if other == self.name {
            tracing::info!(layer = %self.name, "Skipping dependency on self");
            return;
        }
        if self.depends.iter().any(|d| d.on_layer == other) {
            tracing::info!(layer = %self.name, on_layer = other, "Skipping duplicate dependency");
            return;
        }
        tracing::debug!(layer = %self.name, on_layer = other, kind = %kind, "Adding dependency");
        self.depends.push(Depend::new(kind, other));
    }

    // ---------------------------------------------------------------------
    // Inputs, outputs, children
    // ---------------------------------------------------------------------

    pub fn inputs(&self) -> &BTreeMap<String, IoPath> {
        &self.inputs
    }

    pub fn add_input(&mut self, name: impl Into<String>, path: IoPath) {
        self.inputs.insert(name.into(), path);
    }

    pub fn get_input(&self, name: &str) -> Option<&IoPath> {
        self.inputs.get(name)
    }

    /// Bind input `name` to output `output` of layer `upstream`.
    ///
    /// Setup makes every frame of this layer wait for all of `upstream`. The
    /// input path is filled in at setup when `upstream` declares the output
    /// itself, otherwise from the outputs a pre-process saved to its scope.
    pub fn bind_input(&mut self, name: impl Into<String>, upstream: &str, output: &str) {
        self.bound_inputs.insert(
            name.into(),
            OutputRef {
                layer: upstream.to_string(),
                output: output.to_string(),
            },
        );
    }

    pub fn bound_inputs(&self) -> &BTreeMap<String, OutputRef> {
        &self.bound_inputs
    }

    pub fn outputs(&self) -> &BTreeMap<String, IoPath> {
        &self.outputs
    }

    pub fn add_output(&mut self, name: impl Into<String>, path: IoPath) {
        self.outputs.insert(name.into(), path);
    }

    pub fn get_output(&self, name: &str) -> Option<&IoPath> {
        self.outputs.get(name)
    }

    pub fn children(&self) -> &[Layer] {
        &self.children
    }

    /// Add a child executed inline, in insertion order, after this layer.
    pub fn add_child(&mut self, mut child: Layer) {
        child.parent = Some(self.name.clone());
        self.children.push(child);
    }

    pub(crate) fn children_mut(&mut self) -> &mut Vec<Layer> {
        &mut self.children
    }

    pub(crate) fn schema_from(&mut self, registry: &ModuleRegistry) -> Result<()> {
        registry.get(&self.module)?.declare(self);
        for child in &mut self.children {
            child.schema_from(registry)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Frame range
    // ---------------------------------------------------------------------

    /// Resolve the range this layer runs over within `outline`.
    ///
    /// `None` means the layer range does not intersect the outline range and
    /// the layer is skipped.
    pub fn get_frame_range(&self, outline: &Outline) -> Result<Option<String>> {
        match &self.role {
            LayerRole::Frame | LayerRole::PostProcess { .. } | LayerRole::PostCommand => {
                Ok(Some(first_frame_of(outline.frame_range())?))
            }
            LayerRole::PreProcess { creator } => {
                let creator = outline.get_layer(creator)?;
                match creator.get_frame_range(outline)? {
                    Some(range) => Ok(Some(first_frame_of(Some(&range))?)),
                    None => Ok(None),
                }
            }
            LayerRole::Normal => match (self.frame_range.as_deref(), outline.frame_range()) {
                (Some(own), Some(job)) => {
                    let common = FrameSet::parse(job)?.intersect(&FrameSet::parse(own)?);
                    if common.is_empty() {
                        Ok(None)
                    } else {
                        Ok(Some(common.to_string()))
                    }
                }
                (Some(own), None) => Ok(Some(own.to_string())),
                (None, Some(job)) => Ok(Some(job.to_string())),
                (None, None) => Ok(Some(DEFAULT_FRAME_RANGE.to_string())),
            },
        }
    }

    /// The resolved frame set; empty when the layer is skipped.
    pub fn frame_set(&self, outline: &Outline) -> Result<FrameSet> {
        match self.get_frame_range(outline)? {
            Some(range) => FrameSet::parse(&range),
            None => Ok(FrameSet::empty()),
        }
    }

    // ---------------------------------------------------------------------
    // Session access
    // ---------------------------------------------------------------------

    pub fn put_data<T: Serialize + ?Sized>(
        &self,
        session: &Session,
        name: &str,
        value: &T,
        force: bool,
    ) -> Result<()> {
        session.put_data(name, value, Some(&self.name), force)?;
        Ok(())
    }

    pub fn get_data<T: serde::de::DeserializeOwned>(&self, session: &Session, name: &str) -> Result<T> {
        session.get_data(name, Some(&self.name))
    }

    /// Apply `args_override` and merge `ol:outputs` from the layer scope.
    ///
    /// Returns whether pre-process outputs were found.
    pub fn prepare(&mut self, session: &Session) -> Result<bool> {
        if session.has_data(ARGS_OVERRIDE_DATA, Some(&self.name))? {
            let overrides: BTreeMap<String, Value> = self.get_data(session, ARGS_OVERRIDE_DATA)?;
            for (key, value) in overrides {
                tracing::warn!(layer = %self.name, arg = %key, value = %value, "Replacing arg from args_override");
                self.set_arg(&key, value)?;
            }
        }

        let loaded = if session.has_data(OUTPUTS_DATA, Some(&self.name))? {
            let outputs: BTreeMap<String, IoPath> = self.get_data(session, OUTPUTS_DATA)?;
            tracing::info!(layer = %self.name, count = outputs.len(), "Loaded pre-process outputs");
            self.outputs.extend(outputs);
            true
        } else {
            tracing::debug!(layer = %self.name, "No pre-process outputs in layer scope");
            false
        };

        self.resolve_bound_inputs(session)?;
        Ok(loaded)
    }

    /// Fill bound inputs from the `ol:outputs` of their upstream layers.
    fn resolve_bound_inputs(&mut self, session: &Session) -> Result<()> {
        let mut upstream_outputs: BTreeMap<&str, BTreeMap<String, IoPath>> = BTreeMap::new();
        for (input, source) in &self.bound_inputs {
            if !upstream_outputs.contains_key(source.layer.as_str()) {
                let outputs = if session.has_data(OUTPUTS_DATA, Some(&source.layer))? {
                    session.get_data(OUTPUTS_DATA, Some(&source.layer))?
                } else {
                    BTreeMap::new()
                };
                upstream_outputs.insert(&source.layer, outputs);
            }
            let found = upstream_outputs
                .get(source.layer.as_str())
                .and_then(|outputs| outputs.get(&source.output));
            match (found, self.inputs.contains_key(input)) {
                (Some(path), _) => {
                    tracing::debug!(layer = %self.name, input = %input, upstream = %source.layer, path = %path.path, "Bound input to upstream output");
                    self.inputs.insert(input.clone(), path.clone());
                }
                (None, true) => {}
                (None, false) => {
                    return Err(FarmError::Layer(format!(
                        "layer {} input {} is bound to output {} of {}, which has not been registered",
                        self.name, input, source.output, source.layer
                    )))
                }
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Execution
    // ---------------------------------------------------------------------

    /// Execute the chunk window in `ctx` in-process.
    pub fn execute(&mut self, registry: &ModuleRegistry, ctx: &ExecContext<'_>) -> Result<()> {
        self.prepare(ctx.session)?;

        for (name, output) in &self.outputs {
            if output.wants_mkdir() {
                output.create_dir().map_err(|e| {
                    FarmError::Layer(format!("cannot create output {} ({}): {}", name, output.path, e))
                })?;
            }
        }

        self.check_required_args()?;
        self.check_io(&self.inputs, "input", &ctx.frames)?;

        tracing::info!(layer = %self.name, frames = %ctx.frames, "Executing local frame set");

        let module = registry.get(&self.module)?;
        module.execute(self, ctx)?;

        let mut children = std::mem::take(&mut self.children);
        let result = children.iter_mut().try_for_each(|child| {
            let child_module = registry.get(&child.module)?;
            child_module.execute(child, ctx)
        });
        self.children = children;
        result?;

        self.check_io(&self.outputs, "output", &ctx.frames)?;

        if let LayerRole::PreProcess { creator } = &self.role {
            if !self.outputs.is_empty() {
                tracing::info!(layer = %self.name, creator = %creator, count = self.outputs.len(), "Saving outputs to ol:outputs");
                ctx.session
                    .put_data(OUTPUTS_DATA, &self.outputs, Some(creator), true)?;
            }
        }
        Ok(())
    }

    fn check_io(&self, paths: &BTreeMap<String, IoPath>, what: &str, frames: &FrameSet) -> Result<()> {
        for (name, path) in paths {
            if path.is_checked() && !path.exists(frames) {
                return Err(FarmError::Layer(format!(
                    "layer {} {} {} does not exist: {}",
                    self.name, what, name, path.path
                )));
            }
        }
        Ok(())
    }
}

fn first_frame_of(range: Option<&str>) -> Result<String> {
    match range {
        Some(range) => {
            let set = FrameSet::parse(range)?;
            Ok(set
                .first()
                .map(|f| f.to_string())
                .unwrap_or_else(|| DEFAULT_FRAME_RANGE.to_string()))
        }
        None => Ok(DEFAULT_FRAME_RANGE.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_args_reject_wrong_kind() {
        let mut layer = Layer::new("l", "shell");
        layer.require_arg("count", ArgKind::Int);
        assert!(layer.set_arg("count", "three").is_err());
        layer.set_arg("count", 3i64).unwrap();
        assert_eq!(layer.get_arg("count").unwrap(), Some(&Value::Int(3)));
    }

    #[test]
    fn unset_required_arg_fails_on_read() {
        let mut layer = Layer::new("l", "shell");
        layer.require_arg("command", ArgKind::List);
        assert!(layer.get_arg("command").is_err());
        assert!(layer.check_required_args().is_err());
    }

    #[test]
    fn optional_arg_uses_default() {
        let mut layer = Layer::new("l", "shell");
        layer.declare_arg("camera", ArgKind::Str, "persp");
        assert_eq!(layer.get_arg_or("camera", "x").unwrap(), Value::from("persp"));
        assert_eq!(layer.get_arg_or("missing", 7i64).unwrap(), Value::Int(7));
    }

    #[test]
    fn depend_skips_self_and_duplicates() {
        let mut layer = Layer::new("a", "shell");
        layer.depend_on("a");
        layer.depend_on("b");
        layer.depend_all("b");
        assert_eq!(layer.depends().len(), 1);
        assert_eq!(layer.depends()[0].kind, DependType::FrameByFrame);
    }

    #[test]
    fn chunk_size_must_be_positive() {
        let mut layer = Layer::new("a", "shell");
        assert!(layer.set_chunk_size(0).is_err());
        layer.set_chunk_size(5).unwrap();
        assert_eq!(layer.chunk_size(), 5);
    }

    #[test]
    fn preprocess_names_and_links_creator() {
        let mut render = Layer::new("render", "shell");
        let pre = Layer::new("ignored", "null").into_preprocess(&mut render);
        assert_eq!(pre.name(), "render_preprocess");
        assert_eq!(pre.layer_type(), LayerType::Util);
        assert_eq!(pre.service(), "preprocess");
        assert_eq!(
            render.depends(),
            &[Depend::new(DependType::LayerOnLayer, "render_preprocess")]
        );
    }

    #[test]
    fn postprocess_depends_on_creator() {
        let render = Layer::new("render", "shell");
        let post = Layer::new("x", "null").into_postprocess(&render);
        assert_eq!(post.name(), "render_postprocess");
        assert_eq!(post.depends()[0].on_layer, "render");
    }

    #[test]
    fn post_command_is_post_type() {
        let post = Layer::new("notify", "null").into_post_command();
        assert_eq!(post.layer_type(), LayerType::Post);
        assert_eq!(post.service(), "postprocess");
    }
}
