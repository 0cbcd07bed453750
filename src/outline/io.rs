//! Layer inputs and outputs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::frameset::FrameSet;
use crate::value::Value;

/// Attribute: the path must exist (inputs before, outputs after execution).
pub const CHECKED: &str = "checked";
/// Attribute: create the output directory before execution.
pub const MKDIR: &str = "mkdir";

/// A filesystem path or file-sequence pattern bound to a layer.
///
/// Patterns use `#` for four digits of zero padding and `@` for one, so
/// `beauty.#.exr` at frame 7 is `beauty.0007.exr`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoPath {
    pub path: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

/// Names an output of another layer. An input bound this way takes its
/// path from that output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    pub layer: String,
    pub output: String,
}

impl IoPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn checked(self) -> Self {
        self.with_attribute(CHECKED, true)
    }

    pub fn mkdir(self) -> Self {
        self.with_attribute(MKDIR, true)
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    fn flag(&self, name: &str) -> bool {
        self.attributes
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_checked(&self) -> bool {
        self.flag(CHECKED)
    }

    pub fn wants_mkdir(&self) -> bool {
        self.flag(MKDIR)
    }

    pub fn is_file_spec(&self) -> bool {
        self.path.contains('#') || self.path.contains('@')
    }

    /// Path of a single frame. Plain paths are returned unchanged.
    pub fn frame_path(&self, frame: i64) -> PathBuf {
        if !self.is_file_spec() {
            return PathBuf::from(&self.path);
        }
        let mut out = String::with_capacity(self.path.len() + 8);
        let mut chars = self.path.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '#' && c != '@' {
                out.push(c);
                continue;
            }
            let mut width = if c == '#' { 4 } else { 1 };
            while let Some(&next) = chars.peek() {
                match next {
                    '#' => width += 4,
                    '@' => width += 1,
                    _ => break,
                }
                chars.next();
            }
            if frame < 0 {
                out.push_str(&format!("-{:0width$}", -frame, width = width.max(2) - 1));
            } else {
                out.push_str(&format!("{:0width$}", frame, width = width));
            }
        }
        PathBuf::from(out)
    }

    /// Directory holding the path, or the path itself when it is one.
    pub fn dirname(&self) -> PathBuf {
        let path = Path::new(&self.path);
        if !self.is_file_spec() && path.is_dir() {
            return path.to_path_buf();
        }
        path.parent().map(Path::to_path_buf).unwrap_or_default()
    }

    /// Whether the path exists. File specs require every frame of `frames`
    /// to exist with non-zero size.
    pub fn exists(&self, frames: &FrameSet) -> bool {
        if !self.is_file_spec() {
            return Path::new(&self.path).exists();
        }
        self.missing_frames(frames).is_empty()
    }

    /// Frames of `frames` whose file is absent or empty.
    pub fn missing_frames(&self, frames: &FrameSet) -> Vec<i64> {
        frames
            .iter()
            .filter(|f| {
                !std::fs::metadata(self.frame_path(*f))
                    .map(|m| m.len() > 0)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Create the directory this output is written into.
    pub fn create_dir(&self) -> std::io::Result<()> {
        let dir = if self.is_file_spec() {
            self.dirname()
        } else {
            PathBuf::from(&self.path)
        };
        if dir.as_os_str().is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_path_pads_hashes() {
        let spec = IoPath::new("/out/beauty.#.exr");
        assert_eq!(spec.frame_path(7), PathBuf::from("/out/beauty.0007.exr"));
    }

    #[test]
    fn frame_path_pads_ats() {
        let spec = IoPath::new("/out/beauty.@@@.exr");
        assert_eq!(spec.frame_path(7), PathBuf::from("/out/beauty.007.exr"));
    }

    #[test]
    fn plain_path_ignores_frame() {
        let path = IoPath::new("/out/file.txt");
        assert!(!path.is_file_spec());
        assert_eq!(path.frame_path(3), PathBuf::from("/out/file.txt"));
    }

    #[test]
    fn attributes_default_false() {
        let path = IoPath::new("/x");
        assert!(!path.is_checked());
        assert!(!path.wants_mkdir());
        let path = path.checked().mkdir();
        assert!(path.is_checked());
        assert!(path.wants_mkdir());
    }

    #[test]
    fn exists_checks_each_frame() {
        let dir = tempfile::tempdir().unwrap();
        let spec = IoPath::new(format!("{}/img.#.exr", dir.path().display()));
        std::fs::write(spec.frame_path(1), b"x").unwrap();
        std::fs::write(spec.frame_path(2), b"").unwrap();
        assert!(spec.exists(&FrameSet::parse("1").unwrap()));
        assert!(!spec.exists(&FrameSet::parse("1-2").unwrap()));
    }
}
