use std::path::Path;

use crate::error::{FarmError, Result};
use crate::frameset::FrameSet;
use crate::outline::{ArgKind, ExecContext, Layer, SetupContext};
use crate::value::Value;

use super::LayerModule;

pub const SHELL: &str = "shell";
pub const SHELL_SCRIPT: &str = "shell_script";
pub const NULL: &str = "null";

/// Runs a command given as a token list.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellModule;

impl ShellModule {
    /// A shell layer running `command`.
    pub fn layer(name: &str, command: &[&str]) -> Result<Layer> {
        let mut layer = Layer::new(name, SHELL);
        ShellModule.declare(&mut layer);
        layer.set_arg("command", command.to_vec())?;
        Ok(layer)
    }

    /// A shell layer handing `line` to `/bin/sh -c`, for pipes and redirects.
    pub fn sh(name: &str, line: &str) -> Result<Layer> {
        Self::layer(name, &["/bin/sh", "-c", line])
    }
}

impl LayerModule for ShellModule {
    fn tag(&self) -> &str {
        SHELL
    }

    fn declare(&self, layer: &mut Layer) {
        layer.require_arg("command", ArgKind::List);
    }

    fn build_command(&self, layer: &Layer, _frames: &FrameSet) -> Result<Option<Vec<String>>> {
        let command = layer
            .get_arg("command")?
            .map(Value::to_tokens)
            .unwrap_or_default();
        if command.is_empty() {
            return Err(FarmError::InvalidArgument(format!(
                "layer {} has an empty command",
                layer.name()
            )));
        }
        Ok(Some(command))
    }
}

/// Runs a script file. Setup copies the script into the layer's session
/// scope so every frame runs the submitted version.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellScriptModule;

impl LayerModule for ShellScriptModule {
    fn tag(&self) -> &str {
        SHELL_SCRIPT
    }

    fn declare(&self, layer: &mut Layer) {
        layer.require_arg("script", ArgKind::Str);
        layer.declare_arg("interpreter", ArgKind::Str, "/bin/sh");
    }

    fn setup(&self, layer: &mut Layer, ctx: &mut SetupContext<'_>) -> Result<()> {
        let script = layer
            .arg_string("script")?
            .ok_or_else(|| FarmError::InvalidArgument(format!("layer {} has no script", layer.name())))?;
        let copied = ctx
            .session()
            .put_file(Path::new(&script), Some(layer.name()), Some("script"))?;
        tracing::info!(layer = %layer.name(), script = %script, copy = %copied.display(), "Copied script into session");
        layer.set_arg("script", copied.display().to_string())
    }

    fn build_command(&self, layer: &Layer, _frames: &FrameSet) -> Result<Option<Vec<String>>> {
        let interpreter = layer.get_arg_or("interpreter", "/bin/sh")?.to_string();
        let script = layer.arg_string("script")?.unwrap_or_default();
        Ok(Some(vec![interpreter, script]))
    }
}

/// Does nothing. Useful for pre-processes that only register outputs and
/// as a placeholder in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullModule;

impl LayerModule for NullModule {
    fn tag(&self) -> &str {
        NULL
    }

    fn execute(&self, layer: &mut Layer, ctx: &ExecContext<'_>) -> Result<()> {
        tracing::debug!(layer = %layer.name(), frames = %ctx.frames, "Null layer executed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_command_is_passed_through() {
        let layer = ShellModule::layer("echo_frame", &["echo", "#IFRAME#"]).unwrap();
        let cmd = ShellModule
            .build_command(&layer, &FrameSet::parse("1").unwrap())
            .unwrap();
        assert_eq!(cmd, Some(vec!["echo".to_string(), "#IFRAME#".to_string()]));
    }

    #[test]
    fn sh_wraps_the_line() {
        let layer = ShellModule::sh("s", "echo hi | wc -c").unwrap();
        let cmd = ShellModule
            .build_command(&layer, &FrameSet::parse("1").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(cmd, vec!["/bin/sh", "-c", "echo hi | wc -c"]);
    }

    #[test]
    fn string_command_is_rejected() {
        let mut layer = Layer::new("s", SHELL);
        ShellModule.declare(&mut layer);
        assert!(matches!(
            layer.set_arg("command", "echo hi"),
            Err(FarmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn missing_command_is_invalid() {
        let mut layer = Layer::new("s", SHELL);
        ShellModule.declare(&mut layer);
        assert!(ShellModule
            .build_command(&layer, &FrameSet::parse("1").unwrap())
            .is_err());
    }
}
