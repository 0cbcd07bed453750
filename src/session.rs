//! On-disk session workspace shared by the submission host and every worker.
//!
//! Layout:
//!
//! ```text
//! {session_root}/{job_name}/{uuid}/
//!   session           marker holding the session name
//!   outline.yaml      serialized outline
//!   layers/{layer}/   per-layer scope
//! ```

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{FarmError, Result};
use crate::value::Value;

pub const SESSION_MARKER: &str = "session";
pub const OUTLINE_FILE: &str = "outline.yaml";
pub const LAYERS_DIR: &str = "layers";

/// Many workers running as many UIDs write into the same scopes.
const SHARED_DIR_MODE: u32 = 0o777;

/// Create `path` (and parents) world-writable. Concurrent creators are fine.
pub(crate) fn make_shared_dir(path: &Path) -> std::io::Result<()> {
    match DirBuilder::new()
        .recursive(true)
        .mode(SHARED_DIR_MODE)
        .create(path)
    {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e),
    }
    // The process umask applies to mkdir, so widen explicitly.
    match fs::set_permissions(path, fs::Permissions::from_mode(SHARED_DIR_MODE)) {
        Ok(()) => Ok(()),
        // Directory owned by another user that already widened it.
        Err(e) if e.kind() == ErrorKind::PermissionDenied => Ok(()),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    name: String,
    path: PathBuf,
}

impl Session {
    /// Create a fresh session for `job_name` under `session_root`.
    pub fn create(session_root: &Path, job_name: &str) -> Result<Self> {
        let id = Uuid::new_v4();
        let name = format!("{}/{}", job_name, id);
        let path = session_root.join(job_name).join(id.to_string());

        make_shared_dir(&session_root.join(job_name))
            .and_then(|_| make_shared_dir(&path))
            .map_err(|e| FarmError::SessionPath {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        tracing::info!(session = %name, path = %path.display(), "Created session");
        Ok(Self { name, path })
    }

    /// Open an existing session from its root path.
    pub fn open(path: &Path) -> Result<Self> {
        let marker = path.join(SESSION_MARKER);
        let name = match fs::read_to_string(&marker) {
            Ok(text) => text.trim().to_string(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(FarmError::SessionNotFound(marker.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            name,
            path: path.to_path_buf(),
        })
    }

    /// Load the session at `working_path` if it carries a marker, otherwise
    /// create a new one.
    pub fn attach(working_path: Option<&Path>, session_root: &Path, job_name: &str) -> Result<Self> {
        match working_path {
            Some(path) if Session::is_session_path(path) => Session::open(path),
            _ => Session::create(session_root, job_name),
        }
    }

    pub fn is_session_path(path: &Path) -> bool {
        path.join(SESSION_MARKER).is_file()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Root of the session, or the scope of `layer` (created on demand).
    pub fn get_path(&self, layer: Option<&str>) -> Result<PathBuf> {
        match layer {
            None => Ok(self.path.clone()),
            Some(layer) => {
                if layer.is_empty() || layer.contains('/') || layer == "." || layer == ".." {
                    return Err(FarmError::InvalidArgument(format!(
                        "invalid layer scope name '{}'",
                        layer
                    )));
                }
                let layers = self.path.join(LAYERS_DIR);
                make_shared_dir(&layers)?;
                let path = layers.join(layer);
                make_shared_dir(&path)?;
                Ok(path)
            }
        }
    }

    /// Serialize `value` into `{scope}/{name}`.
    pub fn put_data<T: Serialize + ?Sized>(
        &self,
        name: &str,
        value: &T,
        layer: Option<&str>,
        force: bool,
    ) -> Result<PathBuf> {
        let portable = Value::from_serialize(value)?;
        let text = serde_yaml::to_string(&portable)?;
        let dest = self.get_path(layer)?.join(name);
        write_synced(&dest, text.as_bytes(), force)?;
        tracing::debug!(session = %self.name, name, layer = ?layer, "Stored session data");
        Ok(dest)
    }

    pub fn get_data<T: DeserializeOwned>(&self, name: &str, layer: Option<&str>) -> Result<T> {
        let path = self.get_file(name, layer, true, false)?;
        let text = fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn has_data(&self, name: &str, layer: Option<&str>) -> Result<bool> {
        Ok(self.get_path(layer)?.join(name).exists())
    }

    /// Write raw text into the scope, refusing to overwrite unless `force`.
    pub fn put_text(&self, name: &str, text: &str, layer: Option<&str>, force: bool) -> Result<PathBuf> {
        let dest = self.get_path(layer)?.join(name);
        write_synced(&dest, text.as_bytes(), force)?;
        Ok(dest)
    }

    /// Copy `src` into the scope; returns the destination path.
    pub fn put_file(&self, src: &Path, layer: Option<&str>, rename: Option<&str>) -> Result<PathBuf> {
        let dest = self.destination(src, layer, rename)?;
        fs::copy(src, &dest)?;
        File::open(&dest)?.sync_all()?;
        tracing::debug!(src = %src.display(), dest = %dest.display(), "Copied file into session");
        Ok(dest)
    }

    /// Symlink `src` into the scope, replacing any existing entry.
    pub fn sym_file(&self, src: &Path, layer: Option<&str>, rename: Option<&str>) -> Result<PathBuf> {
        let dest = self.destination(src, layer, rename)?;
        match fs::remove_file(&dest) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::os::unix::fs::symlink(src, &dest)?;
        Ok(dest)
    }

    /// Resolve `name` in the scope. `check` requires it to exist, `new`
    /// requires it to be absent.
    pub fn get_file(&self, name: &str, layer: Option<&str>, check: bool, new: bool) -> Result<PathBuf> {
        let path = self.get_path(layer)?.join(name);
        let exists = path.exists();
        if new && exists {
            return Err(FarmError::SessionConflict(path.display().to_string()));
        }
        if check && !new && !exists {
            return Err(FarmError::SessionNotFound(path.display().to_string()));
        }
        Ok(path)
    }

    /// Write the marker file holding the session name.
    pub fn save(&self) -> Result<()> {
        let marker = self.path.join(SESSION_MARKER);
        write_synced(&marker, self.name.as_bytes(), true)?;
        tracing::info!(session = %self.name, "Saved session");
        Ok(())
    }

    fn destination(&self, src: &Path, layer: Option<&str>, rename: Option<&str>) -> Result<PathBuf> {
        let file_name = match rename {
            Some(name) => name.to_string(),
            None => src
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| FarmError::InvalidArgument(format!("{} has no file name", src.display())))?,
        };
        Ok(self.get_path(layer)?.join(file_name))
    }
}

fn write_synced(dest: &Path, bytes: &[u8], force: bool) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true);
    if force {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    let mut file = match options.open(dest) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(FarmError::SessionConflict(dest.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}
