//! Persistent update status document.
//!
//! A single JSON record at `state/update_status.json` describing the
//! current and previous versions, the last successful update, the last
//! attempt, the last error, and whether an update is in flight. Writes go
//! through the atomic temp-and-rename path so a crash never tears the
//! document.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fs_atomic::{self, FsError};
use crate::layout::AgentPaths;

/// The persisted update status record.
///
/// Missing fields deserialize to their defaults so older documents stay
/// readable after upgrades.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatus {
    /// Version the `current` symlink points at.
    #[serde(default)]
    pub current_version: String,

    /// Version the `previous` symlink points at.
    #[serde(default)]
    pub previous_version: String,

    /// Version of the last update that completed successfully.
    #[serde(default)]
    pub last_success_version: String,

    /// When the last successful update completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,

    /// Target version of the most recent attempt.
    #[serde(default)]
    pub last_attempt_version: String,

    /// When the most recent attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Stable code of the last failure.
    #[serde(default)]
    pub last_error_code: String,

    /// Human-readable message of the last failure.
    #[serde(default)]
    pub last_error_message: String,

    /// When the last failure was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,

    /// Whether an update or rollback is currently in flight.
    #[serde(default)]
    pub in_progress: bool,

    /// When the in-flight operation started; set whenever `in_progress`
    /// is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress_started_at: Option<DateTime<Utc>>,
}

impl UpdateStatus {
    /// Marks the start of an attempt: sets the in-progress flag, stamps
    /// the attempt time, and clears the target and error fields.
    pub fn mark_attempt(&mut self) {
        let now = Utc::now();
        self.in_progress = true;
        self.in_progress_started_at = Some(now);
        self.last_attempt_version = String::new();
        self.last_attempt_at = Some(now);
        self.last_error_code = String::new();
        self.last_error_message = String::new();
        self.last_error_at = None;
    }

    /// Records a successful switch to `current`, demoting `previous`.
    pub fn mark_success(&mut self, current: &str, previous: &str) {
        self.current_version = current.to_string();
        self.previous_version = previous.to_string();
        self.last_success_version = current.to_string();
        self.last_success_at = Some(Utc::now());
        self.in_progress = false;
    }

    /// Records a failed attempt and clears the in-progress flag.
    pub fn mark_failure(&mut self, code: &str, message: &str) {
        self.last_error_code = code.to_string();
        self.last_error_message = message.to_string();
        self.last_error_at = Some(Utc::now());
        self.in_progress = false;
    }
}

/// Atomic reader/writer for the status document.
#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    /// Creates a store bound to the status file under `paths`.
    #[must_use]
    pub fn new(paths: &AgentPaths) -> Self {
        Self {
            path: paths.status_file(),
        }
    }

    /// Loads the status document, returning the default record when the
    /// file does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`FsError`] on read or parse failure.
    pub fn load(&self) -> Result<UpdateStatus, FsError> {
        Ok(fs_atomic::read_json_opt(&self.path)?.unwrap_or_default())
    }

    /// Persists the status document atomically, world-readable.
    ///
    /// # Errors
    ///
    /// Returns [`FsError`] if the write or rename fails.
    pub fn save(&self, status: &UpdateStatus) -> Result<(), FsError> {
        fs_atomic::atomic_write_json(&self.path, status)?;
        fs_atomic::set_mode(&self.path, 0o644)
    }
}
