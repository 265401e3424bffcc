//! Atomic file persistence primitives for agent state files.
//!
//! Every durable document the agent owns (update status, secrets, staged
//! binaries) is written with the temp-file + flush + fsync + rename
//! protocol: a crash at any point leaves either the old complete file or
//! the new complete file on disk, never a partial write. After the rename
//! the parent directory is fsynced so the directory entry itself is
//! durable.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Errors from atomic filesystem operations.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// The final path has no parent directory to stage the temp file in.
    #[error("path has no parent directory: {}", path.display())]
    NoParentDirectory {
        /// Path with no parent.
        path: std::path::PathBuf,
    },

    /// JSON serialization failed.
    #[error("json serialization failed: {0}")]
    SerializeFailed(#[source] serde_json::Error),

    /// JSON deserialization failed.
    #[error("json deserialization failed: {0}")]
    DeserializeFailed(#[source] serde_json::Error),

    /// An I/O error occurred during the operation.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Description of the operation that failed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Writes `data` to `path` atomically.
///
/// The temp file is created in the same directory as `path` so the final
/// rename stays on one filesystem. `NamedTempFile` creates the temp with
/// mode 0600; callers that need a wider mode set it afterwards with
/// [`set_mode`].
///
/// # Errors
///
/// Returns [`FsError`] if any filesystem operation fails.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FsError> {
    let parent = path.parent().ok_or_else(|| FsError::NoParentDirectory {
        path: path.to_path_buf(),
    })?;

    if !parent.exists() {
        fs::create_dir_all(parent).map_err(|e| FsError::io("create parent directory", e))?;
    }

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| FsError::io("create temp file", e))?;

    tmp.write_all(data)
        .map_err(|e| FsError::io("write to temp file", e))?;
    tmp.flush().map_err(|e| FsError::io("flush temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| FsError::io("fsync temp file", e))?;

    tmp.persist(path)
        .map_err(|e| FsError::io("atomic rename to final path", e.error))?;

    fsync_directory(parent);

    Ok(())
}

/// Serializes `value` to pretty-printed JSON and writes it atomically.
///
/// Serialization happens in memory before any file I/O, so a serialization
/// failure never leaves a partial file on disk.
///
/// # Errors
///
/// Returns [`FsError::SerializeFailed`] or any I/O error from
/// [`atomic_write`].
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), FsError> {
    let json = serde_json::to_string_pretty(value).map_err(FsError::SerializeFailed)?;
    atomic_write(path, json.as_bytes())
}

/// Reads and deserializes a JSON file, returning `None` when it is absent.
///
/// # Errors
///
/// Returns [`FsError`] on read or parse failure; a missing file is not an
/// error.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, FsError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(FsError::io("read state file", e)),
    };

    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(FsError::DeserializeFailed)
}

/// Sets the permission bits on an existing file.
///
/// # Errors
///
/// Returns [`FsError::Io`] if the permissions cannot be changed.
#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<(), FsError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| FsError::io("set file permissions", e))
}

/// Best-effort fsync of a directory to commit a rename.
fn fsync_directory(dir: &Path) {
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
}
