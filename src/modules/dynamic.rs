//! Table-driven command builder.
//!
//! Each application is described by a base binary and an ordered list of
//! flags. A flag ending in `~` takes no value. A value key containing `#` is
//! a literal (usually a frame token), otherwise it names a layer argument.
//! Unset required values become a placeholder so a partially filled layer
//! can still be previewed; the command fails when actually run.

use std::collections::BTreeMap;

use crate::error::{FarmError, Result};
use crate::frameset::FrameSet;
use crate::outline::{ArgKind, Layer};
use crate::value::Value;

use super::LayerModule;

pub const DYNAMIC: &str = "dynamic";

/// Prefix of the placeholder emitted for unset required values.
pub const MISSING_PREFIX: &str = "!!MISSING:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagSpec {
    pub flag: String,
    pub value_key: String,
    pub is_path: bool,
    pub required: bool,
}

impl FlagSpec {
    pub fn new(flag: &str, value_key: &str, is_path: bool, required: bool) -> Self {
        Self {
            flag: flag.to_string(),
            value_key: value_key.to_string(),
            is_path,
            required,
        }
    }

    fn is_solo(&self) -> bool {
        self.flag.ends_with('~')
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCommand {
    pub binary: String,
    pub flags: Vec<FlagSpec>,
}

impl AppCommand {
    pub fn new(binary: &str, flags: Vec<FlagSpec>) -> Self {
        Self {
            binary: binary.to_string(),
            flags,
        }
    }

    /// Walk the table against `args`.
    pub fn build(&self, args: &BTreeMap<String, Value>) -> Vec<String> {
        let mut command = vec![self.binary.clone()];
        for spec in &self.flags {
            if spec.is_solo() {
                let enabled = spec.value_key.is_empty()
                    || args
                        .get(&spec.value_key)
                        .map(is_truthy)
                        .unwrap_or(false);
                if enabled {
                    command.push(spec.flag.trim_end_matches('~').to_string());
                }
                continue;
            }

            let value = if spec.value_key.contains('#') {
                Some(spec.value_key.clone())
            } else {
                match args.get(&spec.value_key).filter(|v| !v.is_null()) {
                    Some(Value::List(items)) => Some(
                        items
                            .iter()
                            .map(|v| v.to_string())
                            .collect::<Vec<_>>()
                            .join(","),
                    ),
                    Some(v) => Some(v.to_string()),
                    None if spec.required => Some(format!("{}{}!!", MISSING_PREFIX, spec.value_key)),
                    None => None,
                }
            };

            if let Some(value) = value {
                if !spec.flag.is_empty() {
                    command.push(spec.flag.clone());
                }
                command.push(if spec.is_path {
                    expand_path(&value)
                } else {
                    value
                });
            }
        }
        command
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Str(s) => !s.is_empty(),
        _ => true,
    }
}

fn expand_path(path: &str) -> String {
    let path = path.trim();
    match path.strip_prefix("~/") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
            Err(_) => path.to_string(),
        },
        None => path.to_string(),
    }
}

/// Command tables for the applications shipped by default.
pub fn default_apps() -> BTreeMap<String, AppCommand> {
    let mut apps = BTreeMap::new();
    apps.insert(
        "blender".to_string(),
        AppCommand::new(
            "blender",
            vec![
                FlagSpec::new("-b~", "", false, false),
                FlagSpec::new("-noaudio~", "", false, false),
                FlagSpec::new("", "blenderFile", true, true),
                FlagSpec::new("-o", "outputPath", true, false),
                FlagSpec::new("-F", "outputFormat", false, false),
                FlagSpec::new("-s", "#FRAME_START#", false, false),
                FlagSpec::new("-e", "#FRAME_END#", false, false),
                FlagSpec::new("-a~", "", false, false),
            ],
        ),
    );
    apps.insert(
        "maya".to_string(),
        AppCommand::new(
            "Render",
            vec![
                FlagSpec::new("-r", "renderer", false, false),
                FlagSpec::new("-s", "#FRAME_START#", false, false),
                FlagSpec::new("-e", "#FRAME_END#", false, false),
                FlagSpec::new("-cam", "camera", false, false),
                FlagSpec::new("-rd", "outputPath", true, false),
                FlagSpec::new("", "mayaFile", true, true),
            ],
        ),
    );
    apps.insert(
        "nuke".to_string(),
        AppCommand::new(
            "nuke",
            vec![
                FlagSpec::new("-F", "#FRAME_START#-#FRAME_END#", false, false),
                FlagSpec::new("-X", "writeNodes", false, false),
                FlagSpec::new("-x~", "", false, false),
                FlagSpec::new("", "nukeFile", true, true),
            ],
        ),
    );
    apps
}

/// Layer whose command comes from a per-application table, selected by the
/// `app` argument.
#[derive(Debug, Clone)]
pub struct DynamicModule {
    apps: BTreeMap<String, AppCommand>,
}

impl DynamicModule {
    /// A module with no application tables.
    pub fn empty() -> Self {
        Self {
            apps: BTreeMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self {
            apps: default_apps(),
        }
    }

    pub fn with_app(mut self, name: &str, command: AppCommand) -> Self {
        self.apps.insert(name.to_string(), command);
        self
    }

    pub fn app(&self, name: &str) -> Option<&AppCommand> {
        self.apps.get(name)
    }

    /// A dynamic layer for `app` with the given arguments.
    pub fn layer(name: &str, app: &str, args: &[(&str, Value)]) -> Result<Layer> {
        let mut layer = Layer::new(name, DYNAMIC);
        layer.require_arg("app", ArgKind::Str);
        layer.set_arg("app", app)?;
        for (key, value) in args {
            layer.set_arg(key, value.clone())?;
        }
        Ok(layer)
    }
}

impl Default for DynamicModule {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl LayerModule for DynamicModule {
    fn tag(&self) -> &str {
        DYNAMIC
    }

    fn declare(&self, layer: &mut Layer) {
        layer.require_arg("app", ArgKind::Str);
    }

    fn build_command(&self, layer: &Layer, _frames: &FrameSet) -> Result<Option<Vec<String>>> {
        let app = layer.arg_string("app")?.unwrap_or_default();
        let table = self.apps.get(&app).ok_or_else(|| {
            FarmError::InvalidArgument(format!(
                "layer {} uses unknown application '{}'",
                layer.name(),
                app
            ))
        })?;
        Ok(Some(table.build(layer.args())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn blender_table_keeps_tokens() {
        let apps = default_apps();
        let cmd = apps["blender"].build(&args(&[
            ("blenderFile", "/a/b.blend"),
            ("outputPath", "/o/"),
            ("outputFormat", "PNG"),
        ]));
        assert_eq!(
            cmd.join(" "),
            "blender -b -noaudio /a/b.blend -o /o/ -F PNG -s #FRAME_START# -e #FRAME_END# -a"
        );
    }

    #[test]
    fn missing_required_value_becomes_placeholder() {
        let apps = default_apps();
        let cmd = apps["maya"].build(&BTreeMap::new());
        assert_eq!(cmd.last().unwrap(), "!!MISSING:mayaFile!!");
    }

    #[test]
    fn optional_flags_are_omitted() {
        let apps = default_apps();
        let cmd = apps["maya"].build(&args(&[("mayaFile", "/s.ma")]));
        assert!(!cmd.contains(&"-cam".to_string()));
        assert_eq!(cmd.join(" "), "Render -s #FRAME_START# -e #FRAME_END# /s.ma");
    }

    #[test]
    fn solo_flag_with_key_follows_argument() {
        let table = AppCommand::new("app", vec![FlagSpec::new("-v~", "verbose", false, false)]);
        let mut a = BTreeMap::new();
        assert_eq!(table.build(&a), vec!["app"]);
        a.insert("verbose".to_string(), Value::Bool(true));
        assert_eq!(table.build(&a), vec!["app", "-v"]);
    }

    #[test]
    fn list_values_join_with_commas() {
        let mut a = args(&[("nukeFile", "/comp.nk")]);
        a.insert("writeNodes".to_string(), Value::from(vec!["Write1", "Write2"]));
        let cmd = default_apps()["nuke"].build(&a);
        assert_eq!(
            cmd.join(" "),
            "nuke -F #FRAME_START#-#FRAME_END# -X Write1,Write2 -x /comp.nk"
        );
    }
}
