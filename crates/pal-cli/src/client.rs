//! Client RPC against the pal daemon.
//!
//! The client selects one manifest entry at startup, sends the entry's
//! recognized tagged ciphertexts to the daemon (one fresh connection per
//! batch, all I/O blocking), and overwrites the in-memory manifest values
//! with the returned plaintexts. Decryption must complete before the exec
//! pipeline runs.

use std::collections::HashMap;
use std::convert::Infallible;
use std::ffi::OsString;
use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pal_core::codec;
use pal_core::document::DocumentError;
use pal_core::manifest::{self, ManifestEntry};
use pal_core::wire::{self, DecryptionRequest, DecryptionResponse, ErrorResponse, WireError};
use thiserror::Error;
use tracing::debug;

use crate::exec::{self, ExecError};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Client failures before the exec stage.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The daemon socket could not be dialed.
    #[error("could not dial pal daemon at {path:?}: {source}")]
    Dial {
        /// Socket path that was dialed.
        path: PathBuf,
        /// Underlying connect failure.
        source: io::Error,
    },

    /// The wire exchange failed.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The daemon answered with an error record.
    #[error(transparent)]
    Daemon(#[from] ErrorResponse),

    /// The daemon answer carried neither secrets nor an error.
    #[error("daemon response carries neither secrets nor an error")]
    MissingSecrets,
}

/// A PAL client bound to one manifest entry and one daemon socket.
#[derive(Debug)]
pub struct Client {
    socket_path: PathBuf,
    manifest: ManifestEntry,
}

impl Client {
    /// Selects `environment`'s entry from the manifest text.
    ///
    /// # Errors
    ///
    /// Fails when the manifest is malformed or the environment is absent.
    pub fn new(
        manifest_text: &str,
        socket_path: impl Into<PathBuf>,
        environment: &str,
    ) -> Result<Self, DocumentError> {
        Ok(Self {
            socket_path: socket_path.into(),
            manifest: manifest::load(manifest_text, environment)?,
        })
    }

    /// The in-memory manifest entry, with plaintexts substituted after a
    /// successful [`Client::decrypt`].
    #[allow(dead_code)] // test accessor
    pub fn manifest(&self) -> &ManifestEntry {
        &self.manifest
    }

    /// Requests decryption of every recognized tagged ciphertext in the
    /// entry's env and file maps.
    ///
    /// # Errors
    ///
    /// Fails on transport errors or a daemon error response; the manifest
    /// is left partially substituted in that case and must not be used.
    pub fn decrypt(&mut self) -> Result<(), ClientError> {
        decrypt_map(&self.socket_path, &mut self.manifest.env)?;
        decrypt_map(&self.socket_path, &mut self.manifest.file)?;
        Ok(())
    }

    /// Materializes secrets and replaces the process image with the
    /// workload. Only returns on failure.
    ///
    /// # Errors
    ///
    /// Any composition, lookup, or materialization failure is fatal.
    pub fn exec(&self, argv: Vec<String>, environ: Vec<OsString>) -> Result<Infallible, ExecError> {
        exec::exec(&self.manifest, argv, environ)
    }
}

/// The subset of a value map the daemon should see: entries whose values
/// match the tagged-ciphertext grammar with a recognized scheme.
fn ciphertext_entries(values: &HashMap<String, String>) -> HashMap<String, String> {
    values
        .iter()
        .filter(|(_, value)| codec::is_secret(value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn decrypt_map(
    socket_path: &Path,
    values: &mut HashMap<String, String>,
) -> Result<(), ClientError> {
    let ciphertexts = ciphertext_entries(values);
    if ciphertexts.is_empty() {
        return Ok(());
    }
    debug!(count = ciphertexts.len(), "requesting decryption");

    let secrets = round_trip(socket_path, &DecryptionRequest { ciphertexts })?;
    for (key, plaintext) in secrets {
        values.insert(key, plaintext);
    }
    Ok(())
}

/// One open-write-read-close cycle against the daemon socket.
fn round_trip(
    socket_path: &Path,
    request: &DecryptionRequest,
) -> Result<HashMap<String, String>, ClientError> {
    let mut stream = UnixStream::connect(socket_path).map_err(|err| ClientError::Dial {
        path: socket_path.to_path_buf(),
        source: err,
    })?;
    stream
        .set_read_timeout(Some(RPC_TIMEOUT))
        .map_err(WireError::Io)?;
    stream
        .set_write_timeout(Some(RPC_TIMEOUT))
        .map_err(WireError::Io)?;

    wire::write_value_sync(&mut stream, request)?;
    let response: DecryptionResponse = wire::read_value_sync(&stream)?;

    if let Some(error) = response.error {
        return Err(error.into());
    }
    response.secrets.ok_or(ClientError::MissingSecrets)
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;

    use super::*;

    const MANIFEST_YAML: &str = r#"
production:
  env:
    PLAIN: ro:AAAA
    BINARY: ro+base64:BBBB
    LITERAL: just a value
    WRAPPED: base64:Q0NDQw==
    FOREIGN: vault:DDDD
  file:
    /etc/secret: pgp:RUVFRQ==
"#;

    #[test]
    fn request_contains_only_recognized_ciphertexts() {
        let client = Client::new(MANIFEST_YAML, "/tmp/unused.sock", "production").unwrap();

        let entries = ciphertext_entries(&client.manifest().env);
        let mut keys: Vec<_> = entries.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, ["BINARY", "PLAIN"]);

        let files = ciphertext_entries(&client.manifest().file);
        assert_eq!(files.len(), 1);
        assert_eq!(files["/etc/secret"], "pgp:RUVFRQ==");
    }

    #[test]
    fn missing_environment_fails_construction() {
        let err = Client::new(MANIFEST_YAML, "/tmp/unused.sock", "qa").unwrap_err();
        assert_eq!(err.to_string(), r#"missing config section "qa""#);
    }

    #[test]
    fn decrypt_without_ciphertexts_never_dials() {
        let mut client = Client::new(
            "empty:\n  env:\n    GREETING: hello\n",
            "/nonexistent/never-dialed.sock",
            "empty",
        )
        .unwrap();
        client.decrypt().expect("literal-only manifest needs no daemon");
        assert_eq!(client.manifest().env["GREETING"], "hello");
    }

    #[test]
    fn decrypt_substitutes_returned_plaintexts() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("pald-rpc.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let serve = std::thread::spawn(move || {
            let (mut stream, _addr) = listener.accept().unwrap();
            let request: DecryptionRequest = wire::read_value_sync(&stream).unwrap();
            let secrets = request
                .ciphertexts
                .keys()
                .map(|key| (key.clone(), format!("plaintext-for-{key}")))
                .collect();
            wire::write_value_sync(&mut stream, &DecryptionResponse::success(secrets)).unwrap();
        });

        let mut client = Client::new(MANIFEST_YAML, &socket_path, "production").unwrap();
        // Restrict to the env map so one canned connection is enough.
        client.manifest.file.clear();
        client.decrypt().unwrap();
        serve.join().unwrap();

        assert_eq!(client.manifest().env["PLAIN"], "plaintext-for-PLAIN");
        assert_eq!(client.manifest().env["BINARY"], "plaintext-for-BINARY");
        assert_eq!(client.manifest().env["LITERAL"], "just a value");
        assert_eq!(client.manifest().env["WRAPPED"], "base64:Q0NDQw==");
        assert_eq!(client.manifest().env["FOREIGN"], "vault:DDDD");
    }

    #[test]
    fn daemon_errors_carry_code_and_reason() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("pald-rpc.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let serve = std::thread::spawn(move || {
            let (mut stream, _addr) = listener.accept().unwrap();
            let _request: DecryptionRequest = wire::read_value_sync(&stream).unwrap();
            let response = DecryptionResponse::failure("failed to decrypt secret: nope", "PLAIN");
            wire::write_value_sync(&mut stream, &response).unwrap();
        });

        let mut client = Client::new(MANIFEST_YAML, &socket_path, "production").unwrap();
        client.manifest.file.clear();
        let err = client.decrypt().unwrap_err();
        serve.join().unwrap();

        assert_eq!(
            err.to_string(),
            "code: 101, reason: failed to decrypt secret: nope"
        );
    }
}
