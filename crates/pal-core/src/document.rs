//! Environment-keyed YAML documents.
//!
//! Both the client manifest and the daemon configuration are YAML mappings
//! from environment name to a typed section. Exactly one section is selected
//! at startup; a missing section is fatal. Anchors expand natively in the
//! parser and merge keys (`<<`) are applied before typed deserialization.

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors from loading an environment-keyed document.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The document is not valid YAML, or a section has the wrong shape.
    #[error("malformed YAML document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The selected environment has no section in the document.
    #[error("missing config section {0:?}")]
    MissingSection(String),
}

/// Selects and deserializes one environment's section from a YAML document.
///
/// # Errors
///
/// Returns [`DocumentError::Yaml`] on parse or shape failures and
/// [`DocumentError::MissingSection`] when `environment` is absent.
pub fn environment_section<T>(text: &str, environment: &str) -> Result<T, DocumentError>
where
    T: DeserializeOwned,
{
    let mut value: serde_yaml::Value = serde_yaml::from_str(text)?;
    value.apply_merge()?;

    let mut sections: std::collections::HashMap<String, serde_yaml::Value> =
        serde_yaml::from_value(value)?;
    let section = sections
        .remove(environment)
        .ok_or_else(|| DocumentError::MissingSection(environment.to_string()))?;

    Ok(serde_yaml::from_value(section)?)
}
