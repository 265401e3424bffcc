//! Update controller: the apply and rollback state machines.
//!
//! `apply` runs fetch → verify → compat → stage → promote → switch →
//! restart → health in order, recording every failure on the status
//! document before returning it to the caller. A health failure after the
//! symlink switch triggers an automatic rollback to the pre-switch
//! release.
//!
//! Everything from the symlink switch onward runs on a detached task
//! bound to the process lifetime: an admin caller that disconnects
//! mid-request must not abort the health window or the rollback it may
//! trigger. The update lock guard travels into that section and is
//! released when it completes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::RngCore;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::artifact;
use crate::config::AgentConfig;
use crate::layout::{version_from_target, AgentPaths, LayoutError, UpdateLock, CHAT_BINARY, MCP_BINARY};
use crate::manifest::{verify_manifest, Manifest, ManifestClient, ManifestError};
use crate::status::{StatusStore, UpdateStatus};
use crate::supervisor::RestartChildren;
use crate::version::is_compatible;

/// Poll interval for the post-restart health check.
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Per-probe timeout for one child health request.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Stable failure codes emitted verbatim to operators.
///
/// The set is closed; the admin layer maps each code to an HTTP status
/// and never invents new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Another apply or rollback holds the update lock.
    UpdateInProgress,
    /// The lock file could not be created for a non-contention reason.
    LockFailed,
    /// The status document could not be read.
    StatusLoadFailed,
    /// The status document could not be written.
    StatusSaveFailed,
    /// No manifest base URL is configured.
    UpdateBaseUrlMissing,
    /// No manifest public key is configured.
    UpdatePubkeyMissing,
    /// The manifest or signature could not be fetched.
    UpdateFetchFailed,
    /// The manifest signature did not verify.
    SignatureInvalid,
    /// The manifest carries the revoked flag.
    RevokedRelease,
    /// No upstream core URL is configured.
    CoreUrlMissing,
    /// The upstream core version probe failed.
    CoreUnreachable,
    /// The upstream core version is outside the manifest range.
    IncompatibleCore,
    /// The staging directory could not be created.
    StageCreateFailed,
    /// An artifact download or digest check failed.
    UpdateDownloadFailed,
    /// Promoting the staged release failed.
    FinalizeFailed,
    /// The symlink swap failed.
    SymlinkUpdateFailed,
    /// The supervisor rejected the restart request.
    RestartFailed,
    /// Health validation failed and the release was rolled back.
    UpdateFailedRolledBack,
    /// Rollback preparation failed.
    RollbackFailed,
    /// Health validation failed after a rollback switch.
    RollbackHealthFailed,
    /// There is no previous release to roll back to.
    NoPreviousVersion,
}

impl ErrorCode {
    /// The canonical string form of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UpdateInProgress => "UPDATE_IN_PROGRESS",
            Self::LockFailed => "LOCK_FAILED",
            Self::StatusLoadFailed => "STATUS_LOAD_FAILED",
            Self::StatusSaveFailed => "STATUS_SAVE_FAILED",
            Self::UpdateBaseUrlMissing => "UPDATE_BASE_URL_MISSING",
            Self::UpdatePubkeyMissing => "UPDATE_PUBKEY_MISSING",
            Self::UpdateFetchFailed => "UPDATE_FETCH_FAILED",
            Self::SignatureInvalid => "SIGNATURE_INVALID",
            Self::RevokedRelease => "REVOKED_RELEASE",
            Self::CoreUrlMissing => "CORE_URL_MISSING",
            Self::CoreUnreachable => "CORE_UNREACHABLE",
            Self::IncompatibleCore => "INCOMPATIBLE_CORE",
            Self::StageCreateFailed => "STAGE_CREATE_FAILED",
            Self::UpdateDownloadFailed => "UPDATE_DOWNLOAD_FAILED",
            Self::FinalizeFailed => "FINALIZE_FAILED",
            Self::SymlinkUpdateFailed => "SYMLINK_UPDATE_FAILED",
            Self::RestartFailed => "RESTART_FAILED",
            Self::UpdateFailedRolledBack => "UPDATE_FAILED_ROLLED_BACK",
            Self::RollbackFailed => "ROLLBACK_FAILED",
            Self::RollbackHealthFailed => "ROLLBACK_HEALTH_FAILED",
            Self::NoPreviousVersion => "NO_PREVIOUS_VERSION",
        }
    }

    /// The HTTP status the admin layer responds with for this code.
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::UpdateInProgress => 409,
            Self::RevokedRelease | Self::IncompatibleCore | Self::NoPreviousVersion => 400,
            _ => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A controller failure: a stable code plus a human message.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct UpdateError {
    /// Stable failure code.
    pub code: ErrorCode,
    /// Human-readable detail; never contains secrets or signatures.
    pub message: String,
}

impl UpdateError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Report for `available`: what the channel offers and whether the host
/// may take it.
#[derive(Debug, Clone, Serialize)]
pub struct AvailableReport {
    /// Always true once a manifest was fetched and verified.
    pub available: bool,
    /// Version the manifest declares.
    pub target_version: String,
    /// Operator-facing release notes.
    pub notes: String,
    /// Whether the release has been withdrawn.
    pub revoked: bool,
    /// Upstream core details.
    pub payram_core: CoreReport,
    /// The compatibility verdict.
    pub compat: CompatReport,
}

/// Upstream core block of an [`AvailableReport`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoreReport {
    /// The core version reported by the probe, when reachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    /// Manifest minimum bound.
    pub min: String,
    /// Manifest maximum bound.
    pub max: String,
    /// Failure code when the probe could not run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Failure detail when the probe could not run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Compatibility verdict of an [`AvailableReport`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompatReport {
    /// Whether compatibility failures were bypassed.
    pub ignored: bool,
    /// The effective verdict after any bypass.
    pub compatible: bool,
    /// Human reason; carries the original failure when bypassed.
    pub reason: String,
}

/// Successful apply response.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    /// Version now active.
    pub updated_to: String,
    /// Compatibility bypass notes, when any applied.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Successful rollback response.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    /// Version now active.
    pub rolled_back_to: String,
}

/// Orchestrates the update and rollback state machines.
#[derive(Clone)]
pub struct UpdateController {
    config: AgentConfig,
    paths: AgentPaths,
    status: StatusStore,
    manifest_client: ManifestClient,
    http: reqwest::Client,
    supervisor: Arc<dyn RestartChildren>,
}

impl UpdateController {
    /// Builds a controller over the given configuration and supervisor
    /// capability.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Client`] if the HTTP client cannot be
    /// constructed.
    pub fn new(
        config: AgentConfig,
        supervisor: Arc<dyn RestartChildren>,
    ) -> Result<Self, ManifestError> {
        let paths = AgentPaths::new(&config.home);
        let status = StatusStore::new(&paths);
        Ok(Self {
            config,
            paths,
            status,
            manifest_client: ManifestClient::new()?,
            // Artifact downloads are caller-scoped and carry no default
            // timeout; health probes set a per-request deadline.
            http: reqwest::Client::new(),
            supervisor,
        })
    }

    /// Reports what the channel offers without touching the host.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError`] for configuration, transport, and trust
    /// failures. A reachable core that is merely incompatible is not an
    /// error; the report carries the verdict.
    pub async fn available(
        &self,
        channel: &str,
        ignore_compat: bool,
    ) -> Result<AvailableReport, UpdateError> {
        let base = self.require_base_url()?;
        let pubkey = self.require_pubkey()?;

        let fetched = self
            .manifest_client
            .fetch(&base, channel)
            .await
            .map_err(|e| UpdateError::new(ErrorCode::UpdateFetchFailed, e.to_string()))?;

        verify_manifest(&fetched.raw, &fetched.signature, &pubkey)
            .map_err(|e| UpdateError::new(ErrorCode::SignatureInvalid, e.to_string()))?;

        let manifest = fetched.manifest;
        let range = manifest.compatibility.payram_core.clone();
        let mut core = CoreReport {
            min: range.min.clone(),
            max: range.max.clone(),
            ..CoreReport::default()
        };
        let mut compat = CompatReport {
            ignored: ignore_compat,
            ..CompatReport::default()
        };

        match &self.config.core_url {
            None => {
                if !ignore_compat {
                    return Err(UpdateError::new(
                        ErrorCode::CoreUrlMissing,
                        "payram core URL not configured",
                    ));
                }
                compat.compatible = true;
                compat.reason = "compatibility ignored: PAYRAM_CORE_URL not set".to_string();
                core.error_code = Some(ErrorCode::CoreUrlMissing.to_string());
                core.error_message = Some("payram core URL not configured".to_string());
            }
            Some(core_url) => match self.manifest_client.core_version(core_url).await {
                Err(err) => {
                    if !ignore_compat {
                        return Err(UpdateError::new(
                            ErrorCode::CoreUnreachable,
                            err.to_string(),
                        ));
                    }
                    compat.compatible = true;
                    compat.reason = "compatibility ignored: core unreachable".to_string();
                    core.error_code = Some(ErrorCode::CoreUnreachable.to_string());
                    core.error_message = Some(err.to_string());
                }
                Ok(core_version) => {
                    let (compatible, reason) =
                        is_compatible(&core_version, &range.min, &range.max);
                    core.current = Some(core_version);
                    compat.compatible = compatible;
                    compat.reason = reason;

                    if ignore_compat && !compatible {
                        compat.compatible = true;
                        compat.reason =
                            format!("compatibility ignored: {}", compat.reason);
                    }
                }
            },
        }

        Ok(AvailableReport {
            available: true,
            target_version: manifest.version,
            notes: manifest.notes,
            revoked: manifest.revoked,
            payram_core: core,
            compat,
        })
    }

    /// Runs the full update state machine.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError`] with the failing step's code; every
    /// failure past the attempt mark is also recorded on the status
    /// document.
    pub async fn apply(
        &self,
        channel: &str,
        ignore_compat: bool,
    ) -> Result<ApplyOutcome, UpdateError> {
        let lock = self.acquire_lock()?;

        let mut status = self
            .status
            .load()
            .map_err(|e| UpdateError::new(ErrorCode::StatusLoadFailed, e.to_string()))?;
        status.mark_attempt();
        self.status
            .save(&status)
            .map_err(|e| UpdateError::new(ErrorCode::StatusSaveFailed, e.to_string()))?;

        let base = match self.require_base_url() {
            Ok(base) => base,
            Err(err) => return Err(self.fail(&mut status, err.code, err.message)),
        };
        let pubkey = match self.require_pubkey() {
            Ok(pubkey) => pubkey,
            Err(err) => return Err(self.fail(&mut status, err.code, err.message)),
        };

        let fetched = match self.manifest_client.fetch(&base, channel).await {
            Ok(fetched) => fetched,
            Err(err) => {
                return Err(self.fail(&mut status, ErrorCode::UpdateFetchFailed, err.to_string()))
            }
        };

        if let Err(err) = verify_manifest(&fetched.raw, &fetched.signature, &pubkey) {
            return Err(self.fail(&mut status, ErrorCode::SignatureInvalid, err.to_string()));
        }
        let manifest = fetched.manifest;

        status.last_attempt_version = manifest.version.clone();
        if let Err(err) = self.status.save(&status) {
            return Err(self.fail(&mut status, ErrorCode::StatusSaveFailed, err.to_string()));
        }

        if manifest.revoked {
            return Err(self.fail(&mut status, ErrorCode::RevokedRelease, "release revoked"));
        }

        let warnings = match self.check_compat(&manifest, ignore_compat).await {
            Ok(warnings) => warnings,
            Err(err) => return Err(self.fail(&mut status, err.code, err.message)),
        };

        let release_dir = match self.stage_release(&manifest, &mut status).await {
            Ok(dir) => dir,
            Err(err) => return Err(err),
        };

        // The caller may disconnect at any point; the switch, health
        // window, and a possible rollback must still run to completion.
        let controller = self.clone();
        let task = tokio::spawn(async move {
            controller
                .switch_and_validate(lock, status, manifest, release_dir, warnings)
                .await
        });

        match task.await {
            Ok(result) => result,
            Err(err) => Err(UpdateError::new(
                ErrorCode::FinalizeFailed,
                format!("update task failed: {err}"),
            )),
        }
    }

    /// Swings the symlinks back to the previous release.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError`] with a rollback-specific code; failures
    /// are recorded on the status document.
    pub async fn rollback(&self) -> Result<RollbackOutcome, UpdateError> {
        let lock = self.acquire_lock()?;

        let mut status = self
            .status
            .load()
            .map_err(|e| UpdateError::new(ErrorCode::StatusLoadFailed, e.to_string()))?;
        status.mark_attempt();
        if let Err(err) = self.status.save(&status) {
            warn!(error = %err, "failed to persist rollback attempt");
        }

        // Same detachment as apply: once the switch may happen, the
        // operation no longer belongs to the request.
        let controller = self.clone();
        let task =
            tokio::spawn(async move { controller.rollback_switch(lock, status).await });

        match task.await {
            Ok(result) => result,
            Err(err) => Err(UpdateError::new(
                ErrorCode::RollbackFailed,
                format!("rollback task failed: {err}"),
            )),
        }
    }

    fn acquire_lock(&self) -> Result<UpdateLock, UpdateError> {
        match self.paths.acquire_update_lock() {
            Ok(lock) => Ok(lock),
            Err(LayoutError::UpdateInProgress) => Err(UpdateError::new(
                ErrorCode::UpdateInProgress,
                "update already in progress",
            )),
            Err(err) => Err(UpdateError::new(ErrorCode::LockFailed, err.to_string())),
        }
    }

    fn require_base_url(&self) -> Result<String, UpdateError> {
        self.config.update_base_url.clone().ok_or_else(|| {
            UpdateError::new(
                ErrorCode::UpdateBaseUrlMissing,
                "update base URL not configured",
            )
        })
    }

    fn require_pubkey(&self) -> Result<String, UpdateError> {
        self.config.update_pubkey_b64.clone().ok_or_else(|| {
            UpdateError::new(
                ErrorCode::UpdatePubkeyMissing,
                "update public key not configured",
            )
        })
    }

    /// Records a failure on the status document (best effort) and builds
    /// the error for the caller.
    fn fail(
        &self,
        status: &mut UpdateStatus,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> UpdateError {
        let message = message.into();
        status.mark_failure(code.as_str(), &message);
        if let Err(err) = self.status.save(status) {
            warn!(error = %err, code = %code, "failed to persist failure status");
        }
        UpdateError::new(code, message)
    }

    /// Evaluates compatibility, returning the bypass warnings when
    /// `ignore_compat` swallows a failure.
    async fn check_compat(
        &self,
        manifest: &Manifest,
        ignore_compat: bool,
    ) -> Result<Vec<String>, UpdateError> {
        let mut warnings = Vec::new();

        let Some(core_url) = &self.config.core_url else {
            if ignore_compat {
                warnings.push("compatibility ignored: PAYRAM_CORE_URL not set".to_string());
                return Ok(warnings);
            }
            return Err(UpdateError::new(
                ErrorCode::CoreUrlMissing,
                "payram core URL not configured",
            ));
        };

        let core_version = match self.manifest_client.core_version(core_url).await {
            Ok(version) => version,
            Err(err) => {
                if ignore_compat {
                    warnings
                        .push(format!("compatibility ignored: core unreachable ({err})"));
                    return Ok(warnings);
                }
                return Err(UpdateError::new(ErrorCode::CoreUnreachable, err.to_string()));
            }
        };

        let range = &manifest.compatibility.payram_core;
        let (compatible, reason) = is_compatible(&core_version, &range.min, &range.max);
        if !compatible {
            if ignore_compat {
                warnings.push(format!("compatibility ignored: {reason}"));
            } else {
                let reason = if reason.is_empty() {
                    "incompatible payram-core version".to_string()
                } else {
                    reason
                };
                return Err(UpdateError::new(ErrorCode::IncompatibleCore, reason));
            }
        }

        Ok(warnings)
    }

    /// Stages both artifacts into a temp release directory, verifies
    /// digests, sets execute modes, and promotes it to
    /// `releases/<version>`.
    async fn stage_release(
        &self,
        manifest: &Manifest,
        status: &mut UpdateStatus,
    ) -> Result<PathBuf, UpdateError> {
        let release_dir = self.paths.release_dir(&manifest.version);
        let stage_dir = self
            .paths
            .releases_dir()
            .join(format!("{}.tmp-{}", manifest.version, rand_hex(6)));

        let _ = tokio::fs::remove_dir_all(&stage_dir).await;
        if let Err(err) = tokio::fs::create_dir_all(&stage_dir).await {
            return Err(self.fail(status, ErrorCode::StageCreateFailed, err.to_string()));
        }

        for (artifact_ref, binary) in [
            (&manifest.artifacts.chat, CHAT_BINARY),
            (&manifest.artifacts.mcp, MCP_BINARY),
        ] {
            let dst = stage_dir.join(binary);
            if let Err(err) = self.fetch_artifact(&artifact_ref.url, &dst, &artifact_ref.sha256).await
            {
                let _ = tokio::fs::remove_dir_all(&stage_dir).await;
                return Err(self.fail(status, ErrorCode::UpdateDownloadFailed, err));
            }
        }

        let _ = tokio::fs::remove_dir_all(&release_dir).await;
        if let Err(err) = tokio::fs::rename(&stage_dir, &release_dir).await {
            let _ = tokio::fs::remove_dir_all(&stage_dir).await;
            return Err(self.fail(status, ErrorCode::FinalizeFailed, err.to_string()));
        }

        if let Err(err) = self.paths.ensure_compat_symlinks(&release_dir) {
            return Err(self.fail(status, ErrorCode::FinalizeFailed, err.to_string()));
        }

        Ok(release_dir)
    }

    async fn fetch_artifact(
        &self,
        url: &str,
        dst: &Path,
        sha256: &str,
    ) -> Result<(), String> {
        artifact::download(&self.http, url, dst)
            .await
            .map_err(|e| format!("download: {e}"))?;
        artifact::verify_sha256(dst, sha256)
            .await
            .map_err(|e| format!("sha256: {e}"))?;
        crate::fs_atomic::set_mode(dst, 0o755).map_err(|e| e.to_string())
    }

    /// The detached post-stage section: switch, record, restart, health,
    /// and the automatic rollback on health failure.
    async fn switch_and_validate(
        &self,
        lock: UpdateLock,
        mut status: UpdateStatus,
        manifest: Manifest,
        release_dir: PathBuf,
        warnings: Vec<String>,
    ) -> Result<ApplyOutcome, UpdateError> {
        let _lock = lock;

        let old_target = match self.paths.update_symlinks(&release_dir) {
            Ok(target) => target,
            Err(err) => {
                return Err(self.fail(&mut status, ErrorCode::SymlinkUpdateFailed, err.to_string()))
            }
        };
        let previous_version = version_from_target(&old_target);

        status.current_version = manifest.version.clone();
        status.previous_version = previous_version.clone();
        if let Err(err) = self.status.save(&status) {
            return Err(self.fail(&mut status, ErrorCode::StatusSaveFailed, err.to_string()));
        }

        if let Err(reason) = self.supervisor.restart_all() {
            return Err(self.fail(&mut status, ErrorCode::RestartFailed, reason));
        }

        if let Err(health_err) = self.wait_for_health().await {
            warn!(version = %manifest.version, error = %health_err, "health check failed, rolling back");
            if !old_target.is_empty() {
                if let Err(err) = self.paths.update_symlinks(Path::new(&old_target)) {
                    warn!(error = %err, "failed to restore symlinks during rollback");
                }
            }
            if let Err(reason) = self.supervisor.restart_all() {
                warn!(%reason, "failed to restart children during rollback");
            }

            let mut reloaded = match self.status.load() {
                Ok(reloaded) => reloaded,
                Err(err) => {
                    return Err(UpdateError::new(
                        ErrorCode::StatusLoadFailed,
                        err.to_string(),
                    ))
                }
            };
            reloaded.mark_failure(ErrorCode::UpdateFailedRolledBack.as_str(), &health_err);
            reloaded.current_version = previous_version.clone();
            reloaded.previous_version = manifest.version.clone();
            if reloaded.last_attempt_version.is_empty() {
                reloaded.last_attempt_version = manifest.version.clone();
                reloaded.last_attempt_at = Some(Utc::now());
            }
            if let Err(err) = self.status.save(&reloaded) {
                warn!(error = %err, "failed to persist rollback status");
            }

            return Err(UpdateError::new(
                ErrorCode::UpdateFailedRolledBack,
                health_err,
            ));
        }

        status.mark_success(&manifest.version, &previous_version);
        self.status
            .save(&status)
            .map_err(|e| UpdateError::new(ErrorCode::StatusSaveFailed, e.to_string()))?;

        info!(version = %manifest.version, "update applied");
        Ok(ApplyOutcome {
            updated_to: manifest.version,
            warnings,
        })
    }

    /// The detached rollback section: read `previous`, swing, restart,
    /// validate, record.
    async fn rollback_switch(
        &self,
        lock: UpdateLock,
        mut status: UpdateStatus,
    ) -> Result<RollbackOutcome, UpdateError> {
        let _lock = lock;

        let prev_target = match std::fs::read_link(self.paths.previous_symlink()) {
            Ok(target) => target.to_string_lossy().into_owned(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(self.fail(&mut status, ErrorCode::RollbackFailed, err.to_string()))
            }
        };

        if prev_target.is_empty() {
            return Err(self.fail(
                &mut status,
                ErrorCode::NoPreviousVersion,
                "no previous version to roll back to",
            ));
        }

        let old_current = match self.paths.update_symlinks(Path::new(&prev_target)) {
            Ok(target) => target,
            Err(err) => {
                return Err(self.fail(&mut status, ErrorCode::SymlinkUpdateFailed, err.to_string()))
            }
        };

        if let Err(reason) = self.supervisor.restart_all() {
            return Err(self.fail(&mut status, ErrorCode::RestartFailed, reason));
        }

        if let Err(health_err) = self.wait_for_health().await {
            return Err(self.fail(&mut status, ErrorCode::RollbackHealthFailed, health_err));
        }

        status.current_version = version_from_target(&prev_target);
        status.previous_version = version_from_target(&old_current);
        status.in_progress = false;
        if status.last_attempt_version.is_empty() {
            status.last_attempt_version = status.current_version.clone();
            status.last_attempt_at = Some(Utc::now());
        }
        self.status
            .save(&status)
            .map_err(|e| UpdateError::new(ErrorCode::StatusSaveFailed, e.to_string()))?;

        info!(version = %status.current_version, "rollback complete");
        Ok(RollbackOutcome {
            rolled_back_to: status.current_version,
        })
    }

    /// Polls both children's health endpoints until success or the
    /// configured deadline.
    async fn wait_for_health(&self) -> Result<(), String> {
        let deadline = Instant::now() + self.config.health_timeout;
        let mut last_err;

        loop {
            match self.check_health_once().await {
                Ok(()) => return Ok(()),
                Err(err) => last_err = err,
            }
            if Instant::now() >= deadline {
                return Err(last_err);
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    async fn check_health_once(&self) -> Result<(), String> {
        for (name, port) in [
            ("chat", self.config.chat_port),
            ("mcp", self.config.mcp_port),
        ] {
            let url = format!(
                "http://127.0.0.1:{port}{}",
                self.config.child_health_path
            );
            let response = self
                .http
                .get(&url)
                .timeout(HEALTH_PROBE_TIMEOUT)
                .send()
                .await
                .map_err(|e| format!("{name} health: {e}"))?;

            if !response.status().is_success() {
                return Err(format!(
                    "{name} health: status {}",
                    response.status().as_u16()
                ));
            }
        }
        Ok(())
    }
}

fn rand_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct CountingRestarter {
        restarts: AtomicU32,
    }

    impl CountingRestarter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                restarts: AtomicU32::new(0),
            })
        }
    }

    impl RestartChildren for CountingRestarter {
        fn restart_all(&self) -> Result<(), String> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn controller_for(home: &std::path::Path, config: AgentConfig) -> UpdateController {
        let config = AgentConfig {
            home: home.to_path_buf(),
            ..config
        };
        UpdateController::new(config, CountingRestarter::new()).unwrap()
    }

    #[test]
    fn error_codes_render_and_map_to_http() {
        assert_eq!(ErrorCode::UpdateInProgress.as_str(), "UPDATE_IN_PROGRESS");
        assert_eq!(ErrorCode::UpdateInProgress.http_status(), 409);
        assert_eq!(ErrorCode::RevokedRelease.http_status(), 400);
        assert_eq!(ErrorCode::IncompatibleCore.http_status(), 400);
        assert_eq!(ErrorCode::NoPreviousVersion.http_status(), 400);
        assert_eq!(ErrorCode::SignatureInvalid.http_status(), 500);
        assert_eq!(
            ErrorCode::UpdateFailedRolledBack.as_str(),
            "UPDATE_FAILED_ROLLED_BACK"
        );
    }

    #[tokio::test]
    async fn available_requires_base_url_and_pubkey() {
        let home = tempfile::tempdir().unwrap();
        let controller = controller_for(home.path(), AgentConfig::default());

        let err = controller.available("stable", false).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::UpdateBaseUrlMissing);

        let controller = controller_for(
            home.path(),
            AgentConfig {
                update_base_url: Some("http://127.0.0.1:9".to_string()),
                ..AgentConfig::default()
            },
        );
        let err = controller.available("stable", false).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::UpdatePubkeyMissing);
    }

    #[tokio::test]
    async fn apply_records_fetch_failure_on_status() {
        let home = tempfile::tempdir().unwrap();
        // Port 9 (discard) refuses connections immediately.
        let controller = controller_for(
            home.path(),
            AgentConfig {
                update_base_url: Some("http://127.0.0.1:9".to_string()),
                update_pubkey_b64: Some("AAAA".to_string()),
                ..AgentConfig::default()
            },
        );

        let err = controller.apply("stable", false).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::UpdateFetchFailed);

        let status = controller.status.load().unwrap();
        assert_eq!(status.last_error_code, "UPDATE_FETCH_FAILED");
        assert!(!status.in_progress);
        assert!(!controller.paths.lock_file().exists());
    }

    #[tokio::test]
    async fn apply_contends_on_the_update_lock() {
        let home = tempfile::tempdir().unwrap();
        let controller = controller_for(
            home.path(),
            AgentConfig {
                update_base_url: Some("http://127.0.0.1:9".to_string()),
                update_pubkey_b64: Some("AAAA".to_string()),
                ..AgentConfig::default()
            },
        );

        let paths = AgentPaths::new(home.path());
        let _held = paths.acquire_update_lock().unwrap();

        let err = controller.apply("stable", false).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::UpdateInProgress);

        // Contention must leave no status mutation behind.
        let status = controller.status.load().unwrap();
        assert_eq!(status, UpdateStatus::default());
    }

    #[tokio::test]
    async fn rollback_without_previous_fails_cleanly() {
        let home = tempfile::tempdir().unwrap();
        let controller = controller_for(home.path(), AgentConfig::default());

        let err = controller.rollback().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NoPreviousVersion);

        let status = controller.status.load().unwrap();
        assert_eq!(status.last_error_code, "NO_PREVIOUS_VERSION");
        assert!(!status.in_progress);
        assert!(!controller.paths.lock_file().exists());
    }

    #[test]
    fn rand_hex_has_requested_width() {
        let suffix = rand_hex(6);
        assert_eq!(suffix.len(), 12);
        assert!(suffix.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
