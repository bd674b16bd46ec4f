//! Client-side secrets manifest.
//!
//! The manifest is an environment-keyed YAML document handed to the client
//! through the `PAL_SECRETS_YAML` environment variable. One entry is
//! selected at startup and is read-only from then on; decryption replaces
//! tagged ciphertexts in the in-memory copy only.

use std::collections::HashMap;

use serde::Deserialize;

use crate::document::{self, DocumentError};

/// One environment's entry in the secrets manifest.
///
/// `env` maps environment-variable names to value-specs, `file` maps
/// absolute filesystem paths to value-specs. A value-spec is either a
/// literal string or a tagged ciphertext (see [`crate::codec`]). Empty
/// `entrypoint`/`command` strings mean unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ManifestEntry {
    /// Environment variables to set before handing off to the workload.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Files to create before handing off to the workload.
    #[serde(default)]
    pub file: HashMap<String, String>,

    /// Entrypoint string, tokenized with POSIX shell word-splitting rules
    /// and prepended to the workload argv.
    #[serde(default)]
    pub entrypoint: String,

    /// Command string, wrapped in `/bin/sh -c` together with the workload
    /// argv.
    #[serde(default)]
    pub command: String,
}

/// Loads the manifest entry for `environment` from YAML text.
///
/// # Errors
///
/// Fails when the document is malformed or the environment has no section.
pub fn load(text: &str, environment: &str) -> Result<ManifestEntry, DocumentError> {
    document::environment_section(text, environment)
}
