//! Secret store for the LLM API key.
//!
//! The key is persisted at `state/secrets.json` with owner-only
//! permissions. Resolution order for consumers: the `OPENAI_API_KEY`
//! environment variable always wins over the on-disk record. Key material
//! never appears in logs, responses, or error messages; only presence and
//! source are reported.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::fs_atomic::{self, FsError};
use crate::layout::AgentPaths;

/// Environment variable that overrides the stored key.
pub const OPENAI_KEY_ENV: &str = "OPENAI_API_KEY";

/// Persisted secret material.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Secrets {
    /// The LLM API key, empty when unset.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub openai_api_key: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field(
                "openai_api_key",
                &if self.openai_api_key.is_empty() {
                    "<unset>"
                } else {
                    "<redacted>"
                },
            )
            .finish()
    }
}

/// Where a loaded secret came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretSource {
    /// The environment variable.
    Env,
    /// The on-disk record.
    State,
    /// Neither is set.
    Missing,
}

impl std::fmt::Display for SecretSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env => write!(f, "env"),
            Self::State => write!(f, "state"),
            Self::Missing => write!(f, "missing"),
        }
    }
}

/// Errors from secret store operations.
#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    /// An empty key was supplied.
    #[error("openai api key empty")]
    EmptyKey,

    /// A state file operation failed.
    #[error(transparent)]
    Fs(#[from] FsError),

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

/// Reader/writer for the on-disk secrets document.
#[derive(Debug, Clone)]
pub struct SecretStore {
    path: PathBuf,
}

impl SecretStore {
    /// Creates a store bound to the secrets file under `paths`.
    #[must_use]
    pub fn new(paths: &AgentPaths) -> Self {
        Self {
            path: paths.secrets_file(),
        }
    }

    /// Loads the effective secrets and their source.
    ///
    /// The environment variable takes precedence over the on-disk record;
    /// an absent file resolves to [`SecretSource::Missing`].
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError`] on read or parse failure.
    pub fn load(&self) -> Result<(Secrets, SecretSource), SecretsError> {
        let env_key = std::env::var(OPENAI_KEY_ENV).ok().filter(|v| !v.is_empty());
        self.load_with_env(env_key)
    }

    /// Loads the on-disk record only, ignoring the environment.
    ///
    /// Used by the supervisor for env injection, where a key already in
    /// the parent environment is inherited by the child anyway.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError`] on read or parse failure.
    pub fn load_from_state(&self) -> Result<Option<String>, SecretsError> {
        let record: Option<Secrets> = fs_atomic::read_json_opt(&self.path)?;
        Ok(record
            .map(|s| s.openai_api_key)
            .filter(|key| !key.is_empty()))
    }

    /// Env-injectable variant of [`load`](Self::load) for tests.
    pub(crate) fn load_with_env(
        &self,
        env_key: Option<String>,
    ) -> Result<(Secrets, SecretSource), SecretsError> {
        if let Some(key) = env_key {
            return Ok((
                Secrets {
                    openai_api_key: key,
                },
                SecretSource::Env,
            ));
        }

        match self.load_from_state()? {
            Some(key) => Ok((
                Secrets {
                    openai_api_key: key,
                },
                SecretSource::State,
            )),
            None => Ok((Secrets::default(), SecretSource::Missing)),
        }
    }

    /// Persists the key atomically with mode 0600 and a best-effort
    /// directory sync.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::EmptyKey`] for an empty key, or the
    /// underlying filesystem error.
    pub fn put_openai_key(&self, key: &str) -> Result<(), SecretsError> {
        if key.is_empty() {
            return Err(SecretsError::EmptyKey);
        }

        let record = Secrets {
            openai_api_key: key.to_string(),
        };
        fs_atomic::atomic_write_json(&self.path, &record)?;
        fs_atomic::set_mode(&self.path, 0o600)?;
        Ok(())
    }

    /// Removes the stored key; an absent file is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::Io`] on any other removal failure.
    pub fn delete_openai_key(&self) -> Result<(), SecretsError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SecretsError::Io {
                context: "remove secrets file".to_string(),
                source: e,
            }),
        }
    }
}
