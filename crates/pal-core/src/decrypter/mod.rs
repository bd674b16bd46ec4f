//! Pluggable decrypters.
//!
//! A decrypter turns a ciphertext byte blob into a [`Secret`]: an ordered
//! label list and an opaque value. Labels are bound inside the ciphertext,
//! as part of what the cryptosystem protects, and they alone drive
//! authorization; nothing a caller or remote service claims is trusted.
//!
//! Dispatch is by scheme tag. The set is built once from the daemon
//! configuration and is immutable afterwards; each decrypter carries only
//! the credential material it was constructed with and is safe for
//! concurrent use.

mod pgp;
mod redoctober;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::pgp::{PgpDecrypter, PgpEncoder};
pub use self::redoctober::RoDecrypter;
use crate::config::ServerConfig;

/// Scheme tag of the Red October threshold decrypter.
pub const RO_SCHEME: &str = "ro";
/// Scheme tag of the local OpenPGP decrypter.
pub const PGP_SCHEME: &str = "pgp";

/// A decrypted labeled secret.
///
/// This is also the JSON record sealed inside PGP ciphertexts:
/// `{"labels": [...], "value": "<base64>"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    /// Labels bound to the ciphertext, duplicates preserved.
    #[serde(default)]
    pub labels: Vec<String>,

    /// Opaque plaintext bytes.
    #[serde(default, with = "base64_bytes")]
    pub value: Vec<u8>,
}

/// Decryption failures, surfaced per request entry.
#[derive(Debug, Error)]
pub enum DecrypterError {
    /// The ciphertext is not the expected sealed-envelope shape.
    #[error("ciphertext envelope is malformed: {0}")]
    Envelope(#[source] serde_json::Error),

    /// The threshold-service request could not be completed.
    #[error("threshold service request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The threshold service answered with a non-ok status.
    #[error("threshold service refused the request: {0:?}")]
    Refused(String),

    /// The OpenPGP message could not be read or decrypted.
    #[error("could not read OpenPGP message: {0}")]
    Pgp(#[from] ::pgp::errors::Error),

    /// The decrypted PGP plaintext carried no content.
    #[error("decrypted message carries no content")]
    EmptyMessage,

    /// The decrypted plaintext is not a labeled-secret record.
    #[error("secret record is malformed: {0}")]
    Record(#[source] serde_json::Error),
}

/// Construction failures; always fatal at daemon startup.
#[derive(Debug, Error)]
pub enum DecrypterSetupError {
    /// The configured PGP cipher name is not in the supported table.
    #[error("unknown pgp cipher {0:?}")]
    UnknownCipher(String),

    /// The configured PGP hash name is not in the supported table.
    #[error("unknown pgp hash {0:?}")]
    UnknownHash(String),

    /// The keyring file could not be read.
    #[error("could not read keyring {path:?}: {source}")]
    KeyringIo {
        /// Keyring path from the configuration.
        path: PathBuf,
        /// Underlying I/O failure.
        source: io::Error,
    },

    /// The keyring file is not a parsable OpenPGP key ring.
    #[error("could not parse keyring {path:?}: {source}")]
    KeyringParse {
        /// Keyring path from the configuration.
        path: PathBuf,
        /// Underlying OpenPGP failure.
        source: ::pgp::errors::Error,
    },

    /// A secret key could not be unlocked with the configured passphrase.
    #[error("could not unlock secret key: {0}")]
    Unlock(#[source] ::pgp::errors::Error),

    /// No public key in the ring matches a requested recipient key id.
    #[error("no recipient key matches ids {0:?}")]
    NoRecipients(Vec<String>),

    /// The CA bundle for the threshold service could not be loaded.
    #[error("could not load CA bundle {path:?}: {message}")]
    CaBundle {
        /// Bundle path from the configuration.
        path: PathBuf,
        /// Load or parse failure description.
        message: String,
    },

    /// The threshold-service HTTP client could not be built.
    #[error("could not build threshold service client: {0}")]
    HttpClient(#[source] reqwest::Error),

    /// The configuration enables no decrypter at all.
    #[error("not found any valid decrypter configuration")]
    Empty,
}

/// A configured decrypter, dispatched by scheme tag.
#[derive(Debug)]
pub enum Decrypter {
    /// Remote threshold decryption via the Red October service.
    RedOctober(RoDecrypter),
    /// Local keyring decryption.
    Pgp(PgpDecrypter),
}

impl Decrypter {
    /// Decrypts one ciphertext blob into a labeled secret.
    ///
    /// # Errors
    ///
    /// Returns a [`DecrypterError`] describing the first failing step.
    pub async fn decrypt(&self, ciphertext: &[u8]) -> Result<Secret, DecrypterError> {
        match self {
            Self::RedOctober(decrypter) => decrypter.decrypt(ciphertext).await,
            Self::Pgp(decrypter) => decrypter.decrypt(ciphertext),
        }
    }
}

/// Builds the scheme-keyed decrypter set from the daemon configuration.
///
/// # Errors
///
/// Fails when a configured decrypter cannot be constructed, or when the
/// configuration enables none.
pub fn from_config(config: &ServerConfig) -> Result<HashMap<String, Decrypter>, DecrypterSetupError> {
    let mut decrypters = HashMap::new();

    if !config.roserver.is_empty() {
        let decrypter = RoDecrypter::new(
            &config.user,
            &config.password,
            &config.roserver,
            &config.ca_bundle,
        )?;
        decrypters.insert(RO_SCHEME.to_string(), Decrypter::RedOctober(decrypter));
    }

    if !config.pgp_keyring_path.is_empty() {
        let decrypter = PgpDecrypter::new(
            &config.pgp_cipher,
            &config.pgp_hash,
            &config.pgp_keyring_path,
            &config.pgp_passphrase,
        )?;
        decrypters.insert(PGP_SCHEME.to_string(), Decrypter::Pgp(decrypter));
    }

    if decrypters.is_empty() {
        return Err(DecrypterSetupError::Empty);
    }
    Ok(decrypters)
}

pub(crate) mod base64_bytes {
    //! Serde adapter: byte slices as standard-base64 JSON strings.

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}
