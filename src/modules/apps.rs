//! Hand-written command builders for the common render applications.

use crate::error::{FarmError, Result};
use crate::frameset::FrameSet;
use crate::outline::{ArgKind, ExecContext, Layer};
use crate::tokens;
use crate::value::Value;

use super::LayerModule;

pub const BLENDER: &str = "blender";
pub const MAYA: &str = "maya";
pub const NUKE: &str = "nuke";

/// `(start, end, step)` when `frames` ascend with a constant stride.
fn stride(frames: &FrameSet) -> Option<(i64, i64, i64)> {
    match stride_runs(frames).as_slice() {
        [(start, end, step)] if frames.len() > 1 => Some((*start, *end, *step)),
        _ => None,
    }
}

/// Split `frames` into ascending constant-stride runs, in order. A frame
/// that does not ascend from its predecessor starts a new run.
fn stride_runs(frames: &FrameSet) -> Vec<(i64, i64, i64)> {
    let f = frames.frames();
    let mut runs = Vec::new();
    let mut i = 0;
    while i < f.len() {
        let step = f
            .get(i + 1)
            .and_then(|next| next.checked_sub(f[i]))
            .filter(|step| *step > 0);
        let mut j = i;
        match step {
            Some(step) => {
                while j + 1 < f.len() && f[j + 1].checked_sub(f[j]) == Some(step) {
                    j += 1;
                }
                runs.push((f[i], f[j], step));
            }
            None => runs.push((f[i], f[i], 1)),
        }
        i = j + 1;
    }
    runs
}

fn required(layer: &Layer, name: &str) -> Result<String> {
    layer.arg_string(name)?.ok_or_else(|| {
        FarmError::InvalidArgument(format!("layer {} is missing {}", layer.name(), name))
    })
}

fn push_opt(cmd: &mut Vec<String>, layer: &Layer, flag: &str, arg: &str) -> Result<()> {
    if let Some(value) = layer.arg_string(arg)? {
        cmd.push(flag.to_string());
        cmd.push(value);
    }
    Ok(())
}

/// Blender in background mode.
///
/// A multi-frame window renders as an animation (`-s a -e b -a`); a single
/// frame renders with `-f`, which Blender only honours after the scene and
/// output flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlenderModule;

impl BlenderModule {
    pub fn command(layer: &Layer, frames: Option<&FrameSet>) -> Result<Vec<String>> {
        let mut cmd = vec![
            "blender".to_string(),
            "-b".to_string(),
            "-noaudio".to_string(),
            required(layer, "blenderFile")?,
        ];
        push_opt(&mut cmd, layer, "-o", "outputPath")?;
        push_opt(&mut cmd, layer, "-F", "outputFormat")?;

        match frames.and_then(stride) {
            Some((start, end, step)) => {
                cmd.extend(["-s".to_string(), start.to_string(), "-e".to_string(), end.to_string()]);
                if step > 1 {
                    cmd.extend(["-j".to_string(), step.to_string()]);
                }
                cmd.push("-a".to_string());
            }
            None => {
                cmd.push("-f".to_string());
                match frames {
                    Some(set) if set.len() > 1 => {
                        let list: Vec<String> = set.iter().map(|f| f.to_string()).collect();
                        cmd.push(list.join(","));
                    }
                    _ => cmd.push(tokens::IFRAME.to_string()),
                }
            }
        }
        Ok(cmd)
    }
}

impl LayerModule for BlenderModule {
    fn tag(&self) -> &str {
        BLENDER
    }

    fn declare(&self, layer: &mut Layer) {
        layer.require_arg("blenderFile", ArgKind::Str);
        layer.declare_arg("outputPath", ArgKind::Str, Value::Null);
        layer.declare_arg("outputFormat", ArgKind::Str, Value::Null);
    }

    fn build_command(&self, layer: &Layer, frames: &FrameSet) -> Result<Option<Vec<String>>> {
        Ok(Some(BlenderModule::command(layer, Some(frames))?))
    }
}

/// Maya's batch renderer.
#[derive(Debug, Clone, Copy, Default)]
pub struct MayaModule;

impl MayaModule {
    /// One `Render` invocation per stride run of `frames`. Without frames
    /// the chunk bounds are left as tokens.
    pub fn commands(layer: &Layer, frames: Option<&FrameSet>) -> Result<Vec<Vec<String>>> {
        match frames.filter(|set| !set.is_empty()) {
            Some(set) => stride_runs(set)
                .into_iter()
                .map(|(start, end, step)| Self::render(layer, &start.to_string(), &end.to_string(), step))
                .collect(),
            None => Ok(vec![Self::render(layer, tokens::FRAME_START, tokens::FRAME_END, 1)?]),
        }
    }

    /// The invocation covering `frames`, which must form a single run.
    pub fn command(layer: &Layer, frames: Option<&FrameSet>) -> Result<Vec<String>> {
        let mut commands = Self::commands(layer, frames)?;
        match commands.len() {
            1 => Ok(commands.remove(0)),
            n => Err(FarmError::InvalidArgument(format!(
                "layer {} frames need {} Render invocations",
                layer.name(),
                n
            ))),
        }
    }

    fn render(layer: &Layer, start: &str, end: &str, step: i64) -> Result<Vec<String>> {
        let mut cmd = vec!["Render".to_string()];
        push_opt(&mut cmd, layer, "-r", "renderer")?;
        cmd.extend([
            "-s".to_string(),
            start.to_string(),
            "-e".to_string(),
            end.to_string(),
        ]);
        if step > 1 {
            cmd.extend(["-b".to_string(), step.to_string()]);
        }
        push_opt(&mut cmd, layer, "-cam", "camera")?;
        push_opt(&mut cmd, layer, "-rd", "outputPath")?;
        cmd.push(required(layer, "mayaFile")?);
        Ok(cmd)
    }
}

impl LayerModule for MayaModule {
    fn tag(&self) -> &str {
        MAYA
    }

    fn declare(&self, layer: &mut Layer) {
        layer.require_arg("mayaFile", ArgKind::Str);
        layer.declare_arg("camera", ArgKind::Str, Value::Null);
        layer.declare_arg("outputPath", ArgKind::Str, Value::Null);
        layer.declare_arg("renderer", ArgKind::Str, Value::Null);
    }

    /// Windows spanning several runs have no single command and run
    /// in-process.
    fn build_command(&self, layer: &Layer, frames: &FrameSet) -> Result<Option<Vec<String>>> {
        let mut commands = MayaModule::commands(layer, Some(frames))?;
        if commands.len() == 1 {
            Ok(commands.pop())
        } else {
            Ok(None)
        }
    }

    fn execute(&self, layer: &mut Layer, ctx: &ExecContext<'_>) -> Result<()> {
        for command in MayaModule::commands(layer, Some(&ctx.frames))? {
            ctx.run_command(&command)?;
        }
        Ok(())
    }
}

/// Nuke in terminal mode. `-F` selects frames, `-X` the write nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NukeModule;

impl NukeModule {
    pub fn command(layer: &Layer, frames: Option<&FrameSet>) -> Result<Vec<String>> {
        let range = match frames {
            Some(set) if !set.is_empty() => set.to_string(),
            _ => tokens::IFRAME.to_string(),
        };
        let mut cmd = vec!["nuke".to_string(), "-F".to_string(), range];

        match layer.get_arg("writeNodes")? {
            Some(Value::List(nodes)) if !nodes.is_empty() => {
                let names: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
                cmd.push("-X".to_string());
                cmd.push(names.join(","));
            }
            Some(Value::Str(node)) if !node.is_empty() => {
                cmd.push("-X".to_string());
                cmd.push(node.clone());
            }
            _ => {}
        }

        cmd.push("-x".to_string());
        cmd.push(required(layer, "nukeFile")?);
        Ok(cmd)
    }
}

impl LayerModule for NukeModule {
    fn tag(&self) -> &str {
        NUKE
    }

    fn declare(&self, layer: &mut Layer) {
        layer.require_arg("nukeFile", ArgKind::Str);
        layer.declare_arg("writeNodes", ArgKind::Any, Value::Null);
    }

    fn build_command(&self, layer: &Layer, frames: &FrameSet) -> Result<Option<Vec<String>>> {
        Ok(Some(NukeModule::command(layer, Some(frames))?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blender_layer() -> Layer {
        let mut layer = Layer::new("render", BLENDER);
        BlenderModule.declare(&mut layer);
        layer.set_arg("blenderFile", "/a/b.blend").unwrap();
        layer.set_arg("outputPath", "/o/").unwrap();
        layer.set_arg("outputFormat", "PNG").unwrap();
        layer
    }

    #[test]
    fn blender_stepped_window_uses_jump() {
        let frames = FrameSet::parse("1-9x2").unwrap();
        let cmd = BlenderModule::command(&blender_layer(), Some(&frames)).unwrap();
        assert_eq!(
            cmd.join(" "),
            "blender -b -noaudio /a/b.blend -o /o/ -F PNG -s 1 -e 9 -j 2 -a"
        );
    }

    #[test]
    fn blender_irregular_window_lists_frames() {
        let frames = FrameSet::parse("1,4,5").unwrap();
        let cmd = BlenderModule::command(&blender_layer(), Some(&frames)).unwrap();
        assert_eq!(&cmd[cmd.len() - 2..], &["-f".to_string(), "1,4,5".to_string()]);
    }

    #[test]
    fn maya_single_frame_with_camera() {
        let mut layer = Layer::new("maya_layer", MAYA);
        MayaModule.declare(&mut layer);
        layer.set_arg("mayaFile", "/s/scene.ma").unwrap();
        layer.set_arg("camera", "shotCam").unwrap();
        let frames = FrameSet::parse("12").unwrap();
        let cmd = MayaModule::command(&layer, Some(&frames)).unwrap();
        assert_eq!(cmd.join(" "), "Render -s 12 -e 12 -cam shotCam /s/scene.ma");
    }

    #[test]
    fn maya_irregular_window_renders_each_run() {
        let mut layer = Layer::new("maya_layer", MAYA);
        MayaModule.declare(&mut layer);
        layer.set_arg("mayaFile", "/s/scene.ma").unwrap();
        let frames = FrameSet::parse("1,2,3,7,9,11,20").unwrap();
        let commands: Vec<String> = MayaModule::commands(&layer, Some(&frames))
            .unwrap()
            .iter()
            .map(|c| c.join(" "))
            .collect();
        assert_eq!(
            commands,
            vec![
                "Render -s 1 -e 3 /s/scene.ma",
                "Render -s 7 -e 11 -b 2 /s/scene.ma",
                "Render -s 20 -e 20 /s/scene.ma",
            ]
        );
        assert!(MayaModule::command(&layer, Some(&frames)).is_err());
        assert_eq!(
            MayaModule.build_command(&layer, &frames).unwrap(),
            None
        );
    }

    #[test]
    fn stride_runs_survive_extreme_frames() {
        let frames = FrameSet::new(vec![i64::MIN, i64::MAX]);
        assert_eq!(
            stride_runs(&frames),
            vec![(i64::MIN, i64::MIN, 1), (i64::MAX, i64::MAX, 1)]
        );
        assert_eq!(stride(&frames), None);
    }

    #[test]
    fn nuke_selects_write_nodes() {
        let mut layer = Layer::new("comp", NUKE);
        NukeModule.declare(&mut layer);
        layer.set_arg("nukeFile", "/c/comp.nk").unwrap();
        layer.set_arg("writeNodes", vec!["Write1", "Write2"]).unwrap();
        let frames = FrameSet::parse("1-10").unwrap();
        let cmd = NukeModule::command(&layer, Some(&frames)).unwrap();
        assert_eq!(cmd.join(" "), "nuke -F 1-10 -X Write1,Write2 -x /c/comp.nk");
    }

    #[test]
    fn missing_scene_is_an_error() {
        let mut layer = Layer::new("render", BLENDER);
        BlenderModule.declare(&mut layer);
        assert!(BlenderModule::command(&layer, None).is_err());
    }
}
