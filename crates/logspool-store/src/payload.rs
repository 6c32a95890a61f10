// ABOUTME: Directory-per-group file store for log bodies too large to keep inline in the row store.
// ABOUTME: Bodies are staged to a temp file, then renamed to their row id once the row exists.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use ulid::Ulid;

const STAGED_EXTENSION: &str = "tmp";

/// Errors that can occur during large payload file operations.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("large payload storage is not available")]
    Unavailable,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A body written to disk but not yet bound to a row id.
#[derive(Debug)]
pub struct StagedPayload {
    group: String,
    path: PathBuf,
}

impl StagedPayload {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Stores offloaded log bodies under `<root>/<group>/<row_id>.json`.
#[derive(Debug, Clone)]
pub struct PayloadStore {
    root: Option<PathBuf>,
}

impl PayloadStore {
    /// Root the store at the given directory. Nothing is created until the
    /// first write.
    pub fn new(root: PathBuf) -> Self {
        Self { root: Some(root) }
    }

    /// A store with no backing directory; every write fails.
    pub fn unavailable() -> Self {
        Self { root: None }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Directory holding a group's files (not created).
    pub fn group_dir(&self, group: &str) -> Result<PathBuf, PayloadError> {
        let root = self.root.as_ref().ok_or(PayloadError::Unavailable)?;
        Ok(root.join(encode_group(group)))
    }

    /// Path of the file for one row (not created).
    pub fn file_for(&self, group: &str, row_id: i64) -> Result<PathBuf, PayloadError> {
        Ok(self.group_dir(group)?.join(format!("{row_id}.json")))
    }

    /// Write a body to a temp file in the group directory, creating the
    /// directory on demand. Nothing is visible under a row id until
    /// [`commit`](Self::commit).
    pub fn stage(&self, group: &str, content: &str) -> Result<StagedPayload, PayloadError> {
        let dir = self.group_dir(group)?;
        fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{}.{STAGED_EXTENSION}", Ulid::new()));
        let written = File::create(&path).and_then(|mut file| {
            file.write_all(content.as_bytes())?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }

        Ok(StagedPayload {
            group: group.to_string(),
            path,
        })
    }

    /// Bind a staged body to its row id.
    pub fn commit(&self, staged: StagedPayload, row_id: i64) -> Result<PathBuf, PayloadError> {
        let final_path = self.file_for(&staged.group, row_id)?;
        if let Err(e) = fs::rename(&staged.path, &final_path) {
            self.discard(staged);
            return Err(e.into());
        }
        tracing::debug!(group = %staged.group, row_id, "wrote large payload");
        Ok(final_path)
    }

    /// Drop a staged body that will never be committed.
    pub fn discard(&self, staged: StagedPayload) {
        if let Err(e) = fs::remove_file(&staged.path)
            && e.kind() != ErrorKind::NotFound
        {
            tracing::warn!(path = %staged.path.display(), error = %e, "failed to remove staged payload");
        }
        if let Some(dir) = staged.path.parent() {
            prune_dir(dir);
        }
    }

    /// Write a row's body in one step.
    pub fn write(&self, group: &str, row_id: i64, content: &str) -> Result<PathBuf, PayloadError> {
        let staged = self.stage(group, content)?;
        self.commit(staged, row_id)
    }

    /// Read a row's body. A missing file is an error, never an empty body.
    pub fn read(&self, group: &str, row_id: i64) -> Result<String, PayloadError> {
        Ok(fs::read_to_string(self.file_for(group, row_id)?)?)
    }

    /// Remove a row's file. Missing files are ignored.
    pub fn delete(&self, group: &str, row_id: i64) -> Result<(), PayloadError> {
        let path = match self.file_for(group, row_id) {
            Ok(path) => path,
            Err(PayloadError::Unavailable) => return Ok(()),
            Err(e) => return Err(e),
        };
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(group, row_id, "deleted large payload");
                if let Some(dir) = path.parent() {
                    prune_dir(dir);
                }
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a group's directory and every file in it.
    pub fn delete_group(&self, group: &str) -> Result<(), PayloadError> {
        let dir = match self.group_dir(group) {
            Ok(dir) => dir,
            Err(PayloadError::Unavailable) => return Ok(()),
            Err(e) => return Err(e),
        };
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove staged files left by an interrupted write and any group
    /// directory that ends up empty. Returns the number of files removed.
    pub fn sweep(&self) -> Result<usize, PayloadError> {
        let Some(root) = &self.root else {
            return Ok(0);
        };
        let groups = match fs::read_dir(root) {
            Ok(groups) => groups,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in groups {
            let dir = entry?.path();
            if !dir.is_dir() {
                continue;
            }
            for file in fs::read_dir(&dir)? {
                let path = file?.path();
                if path.extension().is_some_and(|ext| ext == STAGED_EXTENSION) {
                    fs::remove_file(&path)?;
                    removed += 1;
                }
            }
            prune_dir(&dir);
        }

        if removed > 0 {
            tracing::info!(removed, "removed interrupted payload writes");
        }
        Ok(removed)
    }
}

/// Remove a directory if it is empty.
fn prune_dir(dir: &Path) {
    if fs::remove_dir(dir).is_ok() {
        tracing::debug!(path = %dir.display(), "removed empty payload directory");
    }
}

/// Map a group name to a single safe path component. Alphanumerics, `-` and
/// `_` pass through; every other byte becomes `%XX`.
fn encode_group(group: &str) -> String {
    let mut out = String::with_capacity(group.len());
    for byte in group.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    if out.is_empty() {
        out.push('%');
    }
    out
}
