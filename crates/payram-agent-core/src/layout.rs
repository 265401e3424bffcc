//! On-disk release layout and the exclusive update lock.
//!
//! The layout is rooted at the agent home directory:
//!
//! ```text
//! <home>/
//!   releases/<version>/      one directory per deployed release
//!   current                  symlink to the active release directory
//!   previous                 symlink to the prior release (optional)
//!   lock/update.lock         exclusive presence file for apply/rollback
//!   state/                   status and secrets documents
//! ```
//!
//! Every mutation of `current` or `previous` goes through a sibling temp
//! symlink plus rename, so a crash mid-swap leaves the old link intact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::config::AgentConfig;
use crate::status::StatusStore;

/// Canonical name of the chat binary inside a release directory.
pub const CHAT_BINARY: &str = "payram-analytics-chat";

/// Canonical name of the MCP binary inside a release directory.
pub const MCP_BINARY: &str = "payram-analytics-mcp";

/// Version assigned to the bootstrap release fabricated from local binaries.
pub const SEED_VERSION: &str = "0.0.0";

/// Errors from layout and lock operations.
#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    /// Another update or rollback currently holds the lock file.
    #[error("update already in progress")]
    UpdateInProgress,

    /// A compat symlink target is missing from the release directory.
    #[error("compat target missing: {}", path.display())]
    CompatTargetMissing {
        /// The canonical binary path that does not exist.
        path: PathBuf,
    },

    /// Copying a seed binary into the bootstrap release failed.
    #[error("seed {component} copy from {}: {source}", src.display())]
    SeedCopy {
        /// Which child the binary belongs to.
        component: &'static str,
        /// The source path that was being copied.
        src: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

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

impl LayoutError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Path resolvers for the agent home directory.
///
/// The home root is threaded explicitly; nothing re-reads it from the
/// environment after construction.
#[derive(Debug, Clone)]
pub struct AgentPaths {
    home: PathBuf,
}

impl AgentPaths {
    /// Creates resolvers rooted at `home`.
    #[must_use]
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// The home root itself.
    #[must_use]
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// `<home>/releases`.
    #[must_use]
    pub fn releases_dir(&self) -> PathBuf {
        self.home.join("releases")
    }

    /// `<home>/releases/<version>`.
    #[must_use]
    pub fn release_dir(&self, version: &str) -> PathBuf {
        self.releases_dir().join(version)
    }

    /// `<home>/state`.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.home.join("state")
    }

    /// `<home>/lock`.
    #[must_use]
    pub fn lock_dir(&self) -> PathBuf {
        self.home.join("lock")
    }

    /// `<home>/lock/update.lock`.
    #[must_use]
    pub fn lock_file(&self) -> PathBuf {
        self.lock_dir().join("update.lock")
    }

    /// `<home>/current`.
    #[must_use]
    pub fn current_symlink(&self) -> PathBuf {
        self.home.join("current")
    }

    /// `<home>/previous`.
    #[must_use]
    pub fn previous_symlink(&self) -> PathBuf {
        self.home.join("previous")
    }

    /// `<home>/state/update_status.json`.
    #[must_use]
    pub fn status_file(&self) -> PathBuf {
        self.state_dir().join("update_status.json")
    }

    /// `<home>/state/secrets.json`.
    #[must_use]
    pub fn secrets_file(&self) -> PathBuf {
        self.state_dir().join("secrets.json")
    }

    /// Default chat binary path inside the active release.
    #[must_use]
    pub fn default_chat_bin(&self) -> PathBuf {
        self.current_symlink().join(CHAT_BINARY)
    }

    /// Default MCP binary path inside the active release.
    #[must_use]
    pub fn default_mcp_bin(&self) -> PathBuf {
        self.current_symlink().join(MCP_BINARY)
    }

    /// Idempotently creates `releases`, `state`, and `lock` at mode 0755.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError::Io`] if a directory cannot be created.
    pub fn ensure_base_dirs(&self) -> Result<(), LayoutError> {
        for dir in [self.releases_dir(), self.state_dir(), self.lock_dir()] {
            fs::create_dir_all(&dir)
                .map_err(|e| LayoutError::io(format!("create {}", dir.display()), e))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))
                    .map_err(|e| LayoutError::io(format!("chmod {}", dir.display()), e))?;
            }
        }
        Ok(())
    }

    /// Acquires the exclusive update lock.
    ///
    /// The lock file is created with `O_CREAT | O_EXCL`; its body carries
    /// the pid and start timestamp for operator inspection only.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError::UpdateInProgress`] when the file already
    /// exists, or [`LayoutError::Io`] on any other failure.
    pub fn acquire_update_lock(&self) -> Result<UpdateLock, LayoutError> {
        self.ensure_base_dirs()?;

        let path = self.lock_file();
        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(LayoutError::UpdateInProgress);
            }
            Err(e) => return Err(LayoutError::io("create update lock", e)),
        };

        let _ = writeln!(file, "pid={}", std::process::id());
        let _ = writeln!(file, "started={}", Utc::now().to_rfc3339());

        Ok(UpdateLock { path })
    }

    /// Atomically promotes `current` to `previous` and installs
    /// `new_target` as `current`.
    ///
    /// Returns the pre-swap `current` target (empty when there was none)
    /// for rollback bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError::Io`] if a symlink or rename fails; the
    /// pre-call links are left intact on failure.
    pub fn update_symlinks(&self, new_target: &Path) -> Result<String, LayoutError> {
        self.ensure_base_dirs()?;

        let current = self.current_symlink();
        let previous = self.previous_symlink();

        let old_target = fs::read_link(&current)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        if !old_target.is_empty() {
            replace_symlink(Path::new(&old_target), &previous)?;
        }

        replace_symlink(new_target, &current)?;

        Ok(old_target)
    }

    /// Reads the `current` symlink target, if any.
    #[must_use]
    pub fn current_target(&self) -> Option<PathBuf> {
        fs::read_link(self.current_symlink()).ok()
    }

    /// Reads the `previous` symlink target, if any.
    #[must_use]
    pub fn previous_target(&self) -> Option<PathBuf> {
        fs::read_link(self.previous_symlink()).ok()
    }

    /// Creates the `chat` and `mcp` alias links inside a release directory.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError::CompatTargetMissing`] when a canonical binary
    /// is absent, or [`LayoutError::Io`] if a link cannot be created.
    pub fn ensure_compat_symlinks(&self, release_dir: &Path) -> Result<(), LayoutError> {
        for (alias, canonical) in [("chat", CHAT_BINARY), ("mcp", MCP_BINARY)] {
            let target = release_dir.join(canonical);
            if !target.exists() {
                return Err(LayoutError::CompatTargetMissing { path: target });
            }

            let link = release_dir.join(alias);
            let _ = fs::remove_file(&link);
            std::os::unix::fs::symlink(&target, &link)
                .map_err(|e| LayoutError::io(format!("create compat symlink {alias}"), e))?;
        }
        Ok(())
    }

    /// Fabricates the `0.0.0` bootstrap release when no valid `current`
    /// symlink exists.
    ///
    /// Copies the configured seed binaries into `releases/0.0.0`, installs
    /// compat links, swings `current`, and backfills the status document's
    /// `current_version` when it is empty. Idempotent: returns `None` when
    /// a valid `current` link is already in place.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError`] if the release cannot be staged or the
    /// symlinks cannot be swung.
    pub fn ensure_seed_release(
        &self,
        config: &AgentConfig,
    ) -> Result<Option<&'static str>, LayoutError> {
        let current = self.current_symlink();
        if let Ok(meta) = fs::symlink_metadata(&current) {
            if meta.file_type().is_symlink() && fs::read_link(&current).is_ok() {
                return Ok(None);
            }
        }

        let release_dir = self.release_dir(SEED_VERSION);
        fs::create_dir_all(&release_dir)
            .map_err(|e| LayoutError::io("create seed release dir", e))?;

        copy_executable(&config.seed_chat_src, &release_dir.join(CHAT_BINARY)).map_err(|e| {
            LayoutError::SeedCopy {
                component: "chat",
                src: config.seed_chat_src.clone(),
                source: e,
            }
        })?;
        copy_executable(&config.seed_mcp_src, &release_dir.join(MCP_BINARY)).map_err(|e| {
            LayoutError::SeedCopy {
                component: "mcp",
                src: config.seed_mcp_src.clone(),
                source: e,
            }
        })?;

        self.ensure_compat_symlinks(&release_dir)?;
        self.update_symlinks(&release_dir)?;

        let store = StatusStore::new(self);
        if let Ok(mut status) = store.load() {
            if status.current_version.is_empty() {
                status.current_version = SEED_VERSION.to_string();
                let _ = store.save(&status);
            }
        }

        Ok(Some(SEED_VERSION))
    }
}

/// Extracts the version directory name from a symlink target.
#[must_use]
pub fn version_from_target(target: &str) -> String {
    if target.is_empty() {
        return String::new();
    }
    Path::new(target)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Guard for the exclusive update lock; removes the lock file on drop.
///
/// Removal is guaranteed on clean paths only. A crash while the lock is
/// held leaves the file behind for operator cleanup.
#[derive(Debug)]
pub struct UpdateLock {
    path: PathBuf,
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Replaces `link` so it points at `target`, via a sibling temp symlink
/// and rename.
fn replace_symlink(target: &Path, link: &Path) -> Result<(), LayoutError> {
    let tmp = link.with_extension("tmp");
    let _ = fs::remove_file(&tmp);

    std::os::unix::fs::symlink(target, &tmp)
        .map_err(|e| LayoutError::io(format!("create temp symlink for {}", link.display()), e))?;

    if let Err(e) = fs::rename(&tmp, link) {
        let _ = fs::remove_file(&tmp);
        return Err(LayoutError::io(
            format!("rename temp symlink into {}", link.display()),
            e,
        ));
    }

    Ok(())
}

/// Copies a file into place with mode 0755 using temp-and-rename.
fn copy_executable(src: &Path, dst: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut src_file = fs::File::open(src)?;
    let parent = dst
        .parent()
        .ok_or_else(|| std::io::Error::other("destination has no parent directory"))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    std::io::copy(&mut src_file, &mut tmp)?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o755))?;
    tmp.as_file().sync_all()?;
    tmp.persist(dst).map_err(|e| e.error)?;

    Ok(())
}
