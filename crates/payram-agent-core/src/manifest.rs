//! Manifest fetch, Ed25519 verification, and the upstream core probe.
//!
//! Manifests are published per channel at `<base>/<channel>/manifest.json`
//! with a detached signature at the same URL plus `.sig`. The raw manifest
//! bytes are preserved exactly as received so verification runs over what
//! the publisher signed, not over a re-serialization.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH};
use serde::{Deserialize, Serialize};

/// Default channel when none is requested.
pub const DEFAULT_CHANNEL: &str = "stable";

/// Client timeout for manifest and signature fetches.
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Independent deadline for the core-version probe.
const CORE_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from manifest operations.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// Transport-level failure fetching the manifest or signature.
    #[error("fetch {url}: {source}")]
    Fetch {
        /// URL that failed.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-2xx status.
    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus {
        /// URL that failed.
        url: String,
        /// The HTTP status received.
        status: u16,
    },

    /// The manifest body is not valid JSON for the expected shape.
    #[error("manifest decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// The configured public key is not valid base64.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// The decoded public key is not 32 bytes.
    #[error("invalid public key length")]
    InvalidPublicKeyLength,

    /// The signature failed to verify over the raw manifest bytes.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// The core version endpoint returned an empty version.
    #[error("empty version")]
    EmptyVersion,

    /// Building the HTTP client failed.
    #[error("http client: {0}")]
    Client(#[source] reqwest::Error),
}

/// A signed description of a target release.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Release name.
    #[serde(default)]
    pub name: String,

    /// Channel this manifest was published on.
    #[serde(default)]
    pub channel: String,

    /// Target version.
    #[serde(default)]
    pub version: String,

    /// When the release was published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,

    /// Operator-facing release notes.
    #[serde(default)]
    pub notes: String,

    /// Per-child downloadable binaries.
    #[serde(default)]
    pub artifacts: Artifacts,

    /// Compatibility ranges against upstream services.
    #[serde(default)]
    pub compatibility: Compatibility,

    /// Whether the release has been withdrawn.
    #[serde(default)]
    pub revoked: bool,
}

/// Binaries for each supervised child.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Artifacts {
    /// The chat API binary.
    #[serde(default)]
    pub chat: ArtifactRef,

    /// The MCP server binary.
    #[serde(default)]
    pub mcp: ArtifactRef,
}

/// One downloadable binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Download URL.
    #[serde(default)]
    pub url: String,

    /// Hex-encoded SHA-256 of the binary.
    #[serde(default)]
    pub sha256: String,
}

/// Version ranges for upstream dependencies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Compatibility {
    /// Range evaluated against the upstream payram-core version.
    #[serde(default)]
    pub payram_core: CompatRange,
}

/// A `min`/`max` version range; empty bounds are unconstrained.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompatRange {
    /// Inclusive lower bound, always a concrete version.
    #[serde(default)]
    pub min: String,

    /// Inclusive upper bound; may end in `.x` for a minor wildcard.
    #[serde(default)]
    pub max: String,
}

/// A fetched manifest with the exact bytes the publisher signed.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    /// The decoded manifest.
    pub manifest: Manifest,

    /// Raw manifest bytes as served.
    pub raw: Vec<u8>,

    /// Detached Ed25519 signature bytes.
    pub signature: Vec<u8>,
}

/// HTTP client for the manifest host and the upstream core.
#[derive(Debug, Clone)]
pub struct ManifestClient {
    http: reqwest::Client,
}

impl ManifestClient {
    /// Builds a client with the default fetch timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Client`] if the underlying client cannot
    /// be constructed.
    pub fn new() -> Result<Self, ManifestError> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(ManifestError::Client)?;
        Ok(Self { http })
    }

    /// Fetches the manifest and its detached signature for a channel.
    ///
    /// An empty channel defaults to `stable`. The manifest body is kept
    /// byte-exact for signature verification.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] on transport failure, non-2xx status, or
    /// a body that does not decode as a manifest.
    pub async fn fetch(&self, base: &str, channel: &str) -> Result<FetchedManifest, ManifestError> {
        let base = base.trim_end_matches('/');
        let channel = if channel.is_empty() {
            DEFAULT_CHANNEL
        } else {
            channel
        };

        let manifest_url = format!("{base}/{channel}/manifest.json");
        let sig_url = format!("{manifest_url}.sig");

        let raw = self.fetch_bytes(&manifest_url).await?;
        let signature = self.fetch_bytes(&sig_url).await?;

        let manifest: Manifest = serde_json::from_slice(&raw).map_err(ManifestError::Decode)?;

        Ok(FetchedManifest {
            manifest,
            raw,
            signature,
        })
    }

    /// Queries the upstream core for its version with a short deadline.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] on transport failure, non-2xx status, or
    /// an empty version field.
    pub async fn core_version(&self, base: &str) -> Result<String, ManifestError> {
        #[derive(Deserialize)]
        struct VersionBody {
            #[serde(default)]
            version: String,
        }

        let url = format!("{}/internal/version", base.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .timeout(CORE_PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|source| ManifestError::Fetch {
                url: url.clone(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(ManifestError::UnexpectedStatus {
                url,
                status: response.status().as_u16(),
            });
        }

        let body: VersionBody = response.json().await.map_err(|source| ManifestError::Fetch {
            url: url.clone(),
            source,
        })?;

        if body.version.is_empty() {
            return Err(ManifestError::EmptyVersion);
        }
        Ok(body.version)
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, ManifestError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| ManifestError::Fetch {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(ManifestError::UnexpectedStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(|source| ManifestError::Fetch {
            url: url.to_string(),
            source,
        })?;
        Ok(bytes.to_vec())
    }
}

/// Verifies a detached Ed25519 signature over the raw manifest bytes.
///
/// The public key is supplied as standard base64 and must decode to
/// exactly 32 bytes. Failure messages are deliberately generic.
///
/// # Errors
///
/// Returns [`ManifestError`] when the key is malformed or the signature
/// does not verify.
pub fn verify_manifest(raw: &[u8], signature: &[u8], pubkey_b64: &str) -> Result<(), ManifestError> {
    let key_bytes = BASE64
        .decode(pubkey_b64)
        .map_err(|_| ManifestError::InvalidPublicKey)?;

    let key_bytes: [u8; PUBLIC_KEY_LENGTH] = key_bytes
        .try_into()
        .map_err(|_| ManifestError::InvalidPublicKeyLength)?;

    let key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| ManifestError::InvalidPublicKey)?;
    let signature =
        Signature::from_slice(signature).map_err(|_| ManifestError::SignatureInvalid)?;

    key.verify(raw, &signature)
        .map_err(|_| ManifestError::SignatureInvalid)
}
