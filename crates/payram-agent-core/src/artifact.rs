//! Artifact download and digest verification.
//!
//! Binaries are streamed to `<dst>.part` and renamed into place on
//! success; any failure removes the partial file. Digests are computed
//! streaming so a large binary never has to fit in memory.

use std::path::Path;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

/// Errors from artifact operations.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// Transport-level failure during download.
    #[error("download {url}: {source}")]
    Download {
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

    /// The computed digest did not match the manifest.
    #[error("sha256 mismatch: got {got} expected {expected}")]
    DigestMismatch {
        /// Hex digest computed over the file.
        got: String,
        /// Hex digest the manifest declared.
        expected: String,
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

impl ArtifactError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Streams `url` to `dst` with a temp-and-rename discipline.
///
/// Parent directories are created as needed. On any failure the partial
/// `.part` file is removed; `dst` only ever appears complete.
///
/// # Errors
///
/// Returns [`ArtifactError`] on transport, status, or filesystem failure.
pub async fn download(
    client: &reqwest::Client,
    url: &str,
    dst: &Path,
) -> Result<(), ArtifactError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|source| ArtifactError::Download {
            url: url.to_string(),
            source,
        })?;

    if !response.status().is_success() {
        return Err(ArtifactError::UnexpectedStatus {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ArtifactError::io("create artifact directory", e))?;
    }

    let tmp = dst.with_extension("part");
    let result = stream_to_file(response, &tmp, url).await;

    if let Err(err) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err);
    }

    if let Err(e) = tokio::fs::rename(&tmp, dst).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(ArtifactError::io("rename artifact into place", e));
    }

    Ok(())
}

/// Computes a streaming SHA-256 over `path` and compares it to
/// `expected_hex` case-insensitively.
///
/// # Errors
///
/// Returns [`ArtifactError::DigestMismatch`] on mismatch, or an I/O
/// error reading the file.
pub async fn verify_sha256(path: &Path, expected_hex: &str) -> Result<(), ArtifactError> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ArtifactError::io("open artifact for digest", e))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| ArtifactError::io("read artifact for digest", e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let got = hex::encode(hasher.finalize());
    if !got.eq_ignore_ascii_case(expected_hex) {
        return Err(ArtifactError::DigestMismatch {
            got,
            expected: expected_hex.to_string(),
        });
    }
    Ok(())
}

async fn stream_to_file(
    response: reqwest::Response,
    tmp: &Path,
    url: &str,
) -> Result<(), ArtifactError> {
    let mut file = tokio::fs::File::create(tmp)
        .await
        .map_err(|e| ArtifactError::io("create partial artifact", e))?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| ArtifactError::Download {
            url: url.to_string(),
            source,
        })?;
        file.write_all(&chunk)
            .await
            .map_err(|e| ArtifactError::io("write partial artifact", e))?;
    }

    file.flush()
        .await
        .map_err(|e| ArtifactError::io("flush partial artifact", e))?;
    file.sync_all()
        .await
        .map_err(|e| ArtifactError::io("fsync partial artifact", e))?;

    Ok(())
}
