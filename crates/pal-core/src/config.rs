//! Daemon configuration.
//!
//! The daemon configuration is an environment-keyed YAML document with the
//! same selection rules as the client manifest. The field names (including
//! the historical `pgp_cypher` spelling) are part of the on-disk format.

use serde::Deserialize;

use crate::document::{self, DocumentError};

/// One environment's daemon configuration section.
///
/// Empty strings mean "not configured". At least one of the Red October and
/// PGP decrypter groups must be configured for the daemon to start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// Red October threshold-service address, e.g. `https://ro.internal:8080`.
    #[serde(default)]
    pub roserver: String,

    /// Path to a PEM CA bundle for the threshold-service connection.
    #[serde(default, rename = "ca")]
    pub ca_bundle: String,

    /// Threshold-service user the daemon authenticates as.
    #[serde(default, rename = "ro_user")]
    pub user: String,

    /// Threshold-service password.
    #[serde(default, rename = "ro_password")]
    pub password: String,

    /// Path to the OpenPGP secret keyring.
    #[serde(default)]
    pub pgp_keyring_path: String,

    /// PGP cipher name (`3des`, `cast5`, `aes128`, `aes192`, `aes256`).
    #[serde(default, rename = "pgp_cypher")]
    pub pgp_cipher: String,

    /// Passphrase unlocking every key in the ring; empty skips unlocking.
    #[serde(default)]
    pub pgp_passphrase: String,

    /// PGP hash name (`sha256`, `sha384`, `sha512`).
    #[serde(default)]
    pub pgp_hash: String,

    /// Whether to authorize secrets against caller-attested labels.
    #[serde(default)]
    pub labels_enabled: bool,

    /// Label retriever name: `docker` or `mocker` (tests inject their own).
    #[serde(default)]
    pub labels_retriever: String,

    /// Notary trust server URL; empty selects the Docker default.
    #[serde(default)]
    pub notary_trust_server: String,

    /// Local directory for cached trust data; empty selects `.trust`.
    #[serde(default)]
    pub notary_trust_dir: String,
}

/// Loads the daemon configuration for `environment` from YAML text.
///
/// # Errors
///
/// Fails when the document is malformed or the environment has no section.
pub fn load(text: &str, environment: &str) -> Result<ServerConfig, DocumentError> {
    document::environment_section(text, environment)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG_YAML: &str = r#"
production:
  roserver: https://ro.example.net:8080
  ca: /etc/pald/ro-ca.pem
  ro_user: pal-daemon
  ro_password: hunter2
  labels_enabled: true
  labels_retriever: docker
  notary_trust_server: https://notary.example.net
  notary_trust_dir: /var/lib/pald/trust

staging:
  pgp_keyring_path: /etc/pald/secring.gpg
  pgp_cypher: aes256
  pgp_hash: sha256
  pgp_passphrase: open sesame
"#;

    #[test]
    fn parses_threshold_section() {
        let config = load(CONFIG_YAML, "production").unwrap();
        assert_eq!(config.roserver, "https://ro.example.net:8080");
        assert_eq!(config.ca_bundle, "/etc/pald/ro-ca.pem");
        assert_eq!(config.user, "pal-daemon");
        assert_eq!(config.password, "hunter2");
        assert!(config.labels_enabled);
        assert_eq!(config.labels_retriever, "docker");
        assert!(config.pgp_keyring_path.is_empty());
    }

    #[test]
    fn parses_pgp_section() {
        let config = load(CONFIG_YAML, "staging").unwrap();
        assert_eq!(config.pgp_keyring_path, "/etc/pald/secring.gpg");
        assert_eq!(config.pgp_cipher, "aes256");
        assert_eq!(config.pgp_hash, "sha256");
        assert_eq!(config.pgp_passphrase, "open sesame");
        assert!(!config.labels_enabled);
    }

    #[test]
    fn missing_environment_is_fatal() {
        let err = load(CONFIG_YAML, "qa").unwrap_err();
        assert_eq!(err.to_string(), r#"missing config section "qa""#);
    }
}
