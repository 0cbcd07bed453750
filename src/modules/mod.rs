//! Concrete layer behaviour, dispatched by the module tag stored on each layer.
//!
//! Workers rebuild layers from `outline.yaml` and look their module up by
//! tag in a [`ModuleRegistry`]; nothing is resolved by type name.

pub mod apps;
pub mod dynamic;
pub mod shell;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{FarmError, Result};
use crate::frameset::FrameSet;
use crate::outline::{ExecContext, Layer, SetupContext};

pub use apps::{BlenderModule, MayaModule, NukeModule};
pub use dynamic::{AppCommand, DynamicModule, FlagSpec};
pub use shell::{NullModule, ShellModule, ShellScriptModule};

/// Behaviour of one family of layers.
pub trait LayerModule: Send + Sync {
    fn tag(&self) -> &str;

    /// Declare the argument schema on a layer of this module.
    fn declare(&self, _layer: &mut Layer) {}

    /// Runs once per layer during outline setup.
    fn setup(&self, _layer: &mut Layer, _ctx: &mut SetupContext<'_>) -> Result<()> {
        Ok(())
    }

    /// The command that renders `frames`, with frame tokens left in place.
    /// `None` means the layer has to run in-process.
    fn build_command(&self, _layer: &Layer, _frames: &FrameSet) -> Result<Option<Vec<String>>> {
        Ok(None)
    }

    /// Run the chunk window in `ctx`.
    fn execute(&self, layer: &mut Layer, ctx: &ExecContext<'_>) -> Result<()> {
        match self.build_command(layer, &ctx.frames)? {
            Some(command) => ctx.run_command(&command),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, Arc<dyn LayerModule>>,
}

impl ModuleRegistry {
    /// A registry with no modules.
    pub fn empty() -> Self {
        Self {
            modules: BTreeMap::new(),
        }
    }

    /// A registry with every built-in module.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(ShellModule));
        registry.register(Arc::new(ShellScriptModule));
        registry.register(Arc::new(NullModule));
        registry.register(Arc::new(DynamicModule::with_defaults()));
        registry.register(Arc::new(BlenderModule));
        registry.register(Arc::new(MayaModule));
        registry.register(Arc::new(NukeModule));
        registry
    }

    /// Register a module, replacing any module with the same tag.
    pub fn register(&mut self, module: Arc<dyn LayerModule>) {
        self.modules.insert(module.tag().to_string(), module);
    }

    pub fn get(&self, tag: &str) -> Result<Arc<dyn LayerModule>> {
        self.modules
            .get(tag)
            .cloned()
            .ok_or_else(|| FarmError::UnknownModule(tag.to_string()))
    }

    pub fn tags(&self) -> Vec<&str> {
        self.modules.keys().map(String::as_str).collect()
    }

    /// Create a layer of module `tag` with its schema declared.
    pub fn create(&self, tag: &str, name: &str) -> Result<Layer> {
        let module = self.get(tag)?;
        let mut layer = Layer::new(name, tag);
        module.declare(&mut layer);
        Ok(layer)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.tags())
            .finish()
    }
}

/// How a frame of a layer is run by the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameCommand {
    /// Spawn this command directly
    Direct(Vec<String>),
    /// Re-enter the crate's `execute` entry point
    InProcess,
}

/// Pick the launch strategy for `layer`. Layers whose behaviour is more than
/// a single command run in-process.
pub fn frame_command(registry: &ModuleRegistry, layer: &Layer, frames: &FrameSet) -> Result<FrameCommand> {
    let needs_process = layer.is_preprocess()
        || !layer.children().is_empty()
        || layer.inputs().values().any(|p| p.is_checked())
        || layer.outputs().values().any(|p| p.is_checked() || p.wants_mkdir());
    if needs_process {
        return Ok(FrameCommand::InProcess);
    }
    match registry.get(layer.module())?.build_command(layer, frames)? {
        Some(command) => Ok(FrameCommand::Direct(command)),
        None => Ok(FrameCommand::InProcess),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = ModuleRegistry::with_builtins();
        for tag in ["shell", "shell_script", "dynamic", "blender", "maya", "nuke", "null"] {
            assert!(registry.get(tag).is_ok(), "{}", tag);
        }
    }

    #[test]
    fn unknown_module_fails() {
        let registry = ModuleRegistry::empty();
        assert!(matches!(
            registry.create("shell", "x"),
            Err(FarmError::UnknownModule(_))
        ));
    }

    #[test]
    fn null_layers_run_in_process() {
        let registry = ModuleRegistry::with_builtins();
        let layer = registry.create("null", "noop").unwrap();
        let frames = FrameSet::parse("1").unwrap();
        assert_eq!(
            frame_command(&registry, &layer, &frames).unwrap(),
            FrameCommand::InProcess
        );
    }
}
