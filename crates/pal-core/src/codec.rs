//! Tagged-ciphertext string codec.
//!
//! A secret travels through manifests and over the wire as a string of the
//! form `scheme[+base64]:payload`. The scheme selects a decrypter, the
//! optional `+base64` infix marks a binary plaintext that must stay
//! base64-wrapped on its way back through the text protocol, and the payload
//! is opaque to everything but the decrypter. Strings that do not match the
//! grammar are literals and never leave the client.

use std::sync::LazyLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use regex::Regex;

/// Scheme tags the client recognizes as decryptable.
pub const RECOGNIZED_SCHEMES: &[&str] = &["ro", "pgp"];

/// Prefix marking a plaintext that is base64-wrapped for text transport.
pub const BASE64_PREFIX: &str = "base64:";

const BASE64_INFIX: &str = "base64";

static VALUE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^([A-Za-z0-9_]+)(?:\+([A-Za-z0-9_]*))?:(.+)$").expect("value regex is valid")
});

/// A parsed `scheme[+base64]:payload` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedCiphertext<'a> {
    /// Decrypter tag, e.g. `ro` or `pgp`.
    pub scheme: &'a str,
    /// Whether the plaintext is binary and must be returned with a
    /// [`BASE64_PREFIX`].
    pub binary: bool,
    /// Opaque decrypter-specific payload, typically base64 text.
    pub payload: &'a str,
}

/// Parses a value-spec string.
///
/// Returns `None` when the string does not match the tagged-ciphertext
/// grammar, meaning it is literal plaintext.
#[must_use]
pub fn split_value(value: &str) -> Option<TaggedCiphertext<'_>> {
    let caps = VALUE_REGEX.captures(value)?;
    Some(TaggedCiphertext {
        scheme: caps.get(1).map(|m| m.as_str())?,
        binary: caps.get(2).is_some_and(|m| m.as_str() == BASE64_INFIX),
        payload: caps.get(3).map(|m| m.as_str())?,
    })
}

/// Encodes a plaintext for the wire, prepending [`BASE64_PREFIX`] when the
/// originating request carried the `+base64` infix.
#[must_use]
pub fn join_value(binary: bool, plaintext: &str) -> String {
    if binary {
        format!("{BASE64_PREFIX}{plaintext}")
    } else {
        plaintext.to_string()
    }
}

/// Whether a manifest value is a ciphertext the daemon can decrypt.
///
/// Only values matching the grammar with a scheme from
/// [`RECOGNIZED_SCHEMES`] are sent in decryption requests; everything else
/// stays in the manifest untouched.
#[must_use]
pub fn is_secret(value: &str) -> bool {
    split_value(value).is_some_and(|tag| RECOGNIZED_SCHEMES.contains(&tag.scheme))
}

/// Decodes a materialization-ready value: strips [`BASE64_PREFIX`] and
/// base64-decodes the remainder, or passes the bytes through untouched.
///
/// # Errors
///
/// Returns an error when a prefixed value is not valid standard base64.
pub fn decode_value(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    match value.strip_prefix(BASE64_PREFIX) {
        Some(rest) => STANDARD.decode(rest),
        None => Ok(value.as_bytes().to_vec()),
    }
}
