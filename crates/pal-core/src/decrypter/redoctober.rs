//! Red October threshold decrypter.
//!
//! The daemon never holds the key material for `ro:` secrets. It forwards
//! the raw ciphertext to a Red October server, which decrypts only while a
//! quorum of delegated users has pre-authorized the operation.
//!
//! The label list is extracted *locally* from the nested sealed envelope
//! before the service is contacted: the outer envelope's `Data` field holds
//! a second envelope whose header carries `Labels`. Those locally parsed
//! labels are authoritative for authorization; a compromised service cannot
//! widen access by returning labels of its own.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{base64_bytes, DecrypterError, DecrypterSetupError, Secret};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client of the Red October decryption RPC.
pub struct RoDecrypter {
    user: String,
    password: String,
    server: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for RoDecrypter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoDecrypter")
            .field("user", &self.user)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

/// A Red October sealed envelope, reduced to the fields the daemon reads.
/// Both nesting levels share this shape.
#[derive(Debug, Deserialize)]
struct SealedEnvelope {
    #[serde(rename = "Data", default, with = "base64_bytes")]
    data: Vec<u8>,
    #[serde(rename = "Labels", default)]
    labels: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DecryptCall<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Password")]
    password: &'a str,
    #[serde(rename = "Data", with = "base64_bytes")]
    data: &'a [u8],
}

#[derive(Debug, Deserialize)]
struct ServiceReply {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Response", default, with = "base64_bytes")]
    response: Vec<u8>,
}

impl RoDecrypter {
    /// Builds a decrypter for the service at `server`, authenticating as
    /// `user`/`password`. A non-empty `ca_bundle` path supplies PEM roots
    /// trusted for the connection.
    ///
    /// # Errors
    ///
    /// Fails when the CA bundle cannot be loaded or the HTTP client cannot
    /// be built.
    pub fn new(
        user: &str,
        password: &str,
        server: &str,
        ca_bundle: &str,
    ) -> Result<Self, DecrypterSetupError> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);

        if !ca_bundle.is_empty() {
            let pem = std::fs::read(ca_bundle).map_err(|err| DecrypterSetupError::CaBundle {
                path: PathBuf::from(ca_bundle),
                message: err.to_string(),
            })?;
            let certificates = reqwest::Certificate::from_pem_bundle(&pem).map_err(|err| {
                DecrypterSetupError::CaBundle {
                    path: PathBuf::from(ca_bundle),
                    message: err.to_string(),
                }
            })?;
            for certificate in certificates {
                builder = builder.add_root_certificate(certificate);
            }
        }

        let client = builder.build().map_err(DecrypterSetupError::HttpClient)?;

        Ok(Self {
            user: user.to_string(),
            password: password.to_string(),
            server: server.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Decrypts a sealed envelope through the threshold service.
    ///
    /// # Errors
    ///
    /// Fails when the envelope is malformed, the service is unreachable or
    /// refuses the request, or the reply is not a decrypted envelope.
    pub async fn decrypt(&self, ciphertext: &[u8]) -> Result<Secret, DecrypterError> {
        let labels = sealed_labels(ciphertext)?;

        let call = DecryptCall {
            name: &self.user,
            password: &self.password,
            data: ciphertext,
        };
        let reply: ServiceReply = self
            .client
            .post(format!("{}/decrypt", self.server))
            .json(&call)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if reply.status != "ok" {
            return Err(DecrypterError::Refused(reply.status));
        }

        let envelope: SealedEnvelope =
            serde_json::from_slice(&reply.response).map_err(DecrypterError::Envelope)?;

        Ok(Secret {
            labels,
            value: envelope.data,
        })
    }
}

/// Extracts the label list from the inner envelope header without touching
/// the sealed payload.
fn sealed_labels(ciphertext: &[u8]) -> Result<Vec<String>, DecrypterError> {
    let outer: SealedEnvelope =
        serde_json::from_slice(ciphertext).map_err(DecrypterError::Envelope)?;
    let inner: SealedEnvelope =
        serde_json::from_slice(&outer.data).map_err(DecrypterError::Envelope)?;
    Ok(inner.labels)
}
