//! Notary trust lookups.
//!
//! The trust server is an external collaborator: given an image reference,
//! it serves the signed target metadata for the repository, from which the
//! published digest of a tag can be read. This client fetches the targets
//! document and extracts the sha256 digest; full TUF role and threshold
//! verification is the server pipeline's concern. Digest comparison against
//! the locally reported image digest happens in the caller and is
//! mandatory.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default trust server, matching the Docker content-trust default.
const DEFAULT_TRUST_SERVER: &str = "https://notary.docker.io";
/// Default local directory for cached trust data.
const DEFAULT_TRUST_DIR: &str = ".trust";
/// Tag assumed when an image reference carries none.
const DEFAULT_TAG: &str = "latest";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Trust lookup failures.
#[derive(Debug, Error)]
pub enum NotaryError {
    /// The HTTP client could not be built or the request failed.
    #[error("trust server request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The targets document is not the expected shape.
    #[error("trust data is malformed: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The tag has no entry in the signed targets.
    #[error("no trust data for {0}")]
    MissingTarget(String),

    /// The target entry carries no sha256 hash.
    #[error("no valid hash, expecting sha256")]
    MissingHash,
}

/// Client for the Notary trust server.
#[derive(Debug)]
pub struct NotaryClient {
    server: String,
    #[allow(dead_code)] // reserved for cached trust data
    trust_dir: PathBuf,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TargetsDocument {
    signed: SignedTargets,
}

#[derive(Debug, Deserialize)]
struct SignedTargets {
    targets: std::collections::HashMap<String, TargetEntry>,
}

#[derive(Debug, Deserialize)]
struct TargetEntry {
    hashes: std::collections::HashMap<String, String>,
}

impl NotaryClient {
    /// Builds a client for `server`, caching trust data under `trust_dir`.
    /// Empty arguments select the Docker defaults.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be built.
    pub fn new(server: &str, trust_dir: &str) -> Result<Self, NotaryError> {
        let server = if server.is_empty() {
            DEFAULT_TRUST_SERVER
        } else {
            server
        };
        let trust_dir = if trust_dir.is_empty() {
            DEFAULT_TRUST_DIR
        } else {
            trust_dir
        };
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            server: server.trim_end_matches('/').to_string(),
            trust_dir: PathBuf::from(trust_dir),
            http,
        })
    }

    /// Returns the signed `sha256:<hex>` digest published for an image
    /// reference (`repo[:tag]`).
    ///
    /// # Errors
    ///
    /// Fails when the trust data cannot be fetched, is malformed, or has
    /// no sha256 entry for the tag.
    pub async fn signed_digest(&self, image: &str) -> Result<String, NotaryError> {
        let (repository, tag) = split_reference(image);

        let body = self
            .http
            .get(format!(
                "{}/v2/{repository}/_trust/tuf/targets.json",
                self.server
            ))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let document: TargetsDocument =
            serde_json::from_slice(&body).map_err(NotaryError::Malformed)?;

        let target = document
            .signed
            .targets
            .get(tag)
            .ok_or_else(|| NotaryError::MissingTarget(format!("{repository}:{tag}")))?;
        let hash = target.hashes.get("sha256").ok_or(NotaryError::MissingHash)?;

        // Notary serves hashes as base64; repo digests use hex.
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;
        let raw = STANDARD.decode(hash).map_err(|_| NotaryError::MissingHash)?;
        let hex: String = raw.iter().map(|byte| format!("{byte:02x}")).collect();
        Ok(format!("sha256:{hex}"))
    }
}

/// Splits `repo[:tag]` on the last colon after the last slash, so
/// registry ports are not mistaken for tags.
fn split_reference(image: &str) -> (&str, &str) {
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(offset) => {
            let split = name_start + offset;
            (&image[..split], &image[split + 1..])
        }
        None => (image, DEFAULT_TAG),
    }
}
