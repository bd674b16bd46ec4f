//! Local OpenPGP decrypter and the matching offline encoder.
//!
//! Ciphertexts under the `pgp` scheme are OpenPGP messages whose plaintext
//! is the JSON labeled-secret record ([`Secret`]). The daemon side unwraps
//! them with a secret keyring; `palpgpenc` is the producer, encrypting a
//! record to one or more recipient keys from a public ring.

use std::io::Cursor;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use pgp::composed::{Deserializable, Message, SignedPublicKey, SignedSecretKey};
use pgp::crypto::hash::HashAlgorithm;
use pgp::crypto::sym::SymmetricKeyAlgorithm;
use pgp::ser::Serialize as _;
use pgp::types::{PublicKeyTrait, SecretKeyTrait};

use super::{DecrypterError, DecrypterSetupError, Secret};

/// Maps a configured cipher name to an RFC 4880 symmetric algorithm.
///
/// # Errors
///
/// Unknown names are a construction-time failure.
pub(crate) fn cipher_from_name(name: &str) -> Result<SymmetricKeyAlgorithm, DecrypterSetupError> {
    match name.to_ascii_lowercase().as_str() {
        "3des" => Ok(SymmetricKeyAlgorithm::TripleDES),
        "cast5" => Ok(SymmetricKeyAlgorithm::CAST5),
        "aes128" => Ok(SymmetricKeyAlgorithm::AES128),
        "aes192" => Ok(SymmetricKeyAlgorithm::AES192),
        "aes256" => Ok(SymmetricKeyAlgorithm::AES256),
        _ => Err(DecrypterSetupError::UnknownCipher(name.to_string())),
    }
}

/// Maps a configured hash name to an RFC 4880 hash algorithm. Limited to
/// the hashes still considered secure.
///
/// # Errors
///
/// Unknown names are a construction-time failure.
pub(crate) fn hash_from_name(name: &str) -> Result<HashAlgorithm, DecrypterSetupError> {
    match name.to_ascii_lowercase().as_str() {
        "sha256" => Ok(HashAlgorithm::SHA2_256),
        "sha384" => Ok(HashAlgorithm::SHA2_384),
        "sha512" => Ok(HashAlgorithm::SHA2_512),
        _ => Err(DecrypterSetupError::UnknownHash(name.to_string())),
    }
}

/// Decrypts `pgp:` ciphertexts with a secret keyring.
pub struct PgpDecrypter {
    keys: Vec<SignedSecretKey>,
    passphrase: String,
}

impl std::fmt::Debug for PgpDecrypter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgpDecrypter")
            .field("keys", &self.keys.len())
            .finish_non_exhaustive()
    }
}

impl PgpDecrypter {
    /// Loads the keyring at `keyring_path` and verifies that every primary
    /// and subkey secret key unlocks with `passphrase` (empty skips the
    /// check). Unknown cipher and hash names are rejected here; decryption
    /// itself derives its parameters from the message.
    ///
    /// # Errors
    ///
    /// Fails on unknown algorithm names, unreadable or unparsable
    /// keyrings, and passphrase mismatches.
    pub fn new(
        cipher: &str,
        hash: &str,
        keyring_path: &str,
        passphrase: &str,
    ) -> Result<Self, DecrypterSetupError> {
        cipher_from_name(cipher)?;
        hash_from_name(hash)?;

        let ring = std::fs::read(keyring_path).map_err(|err| DecrypterSetupError::KeyringIo {
            path: PathBuf::from(keyring_path),
            source: err,
        })?;
        let keys: Vec<SignedSecretKey> = SignedSecretKey::from_bytes_many(Cursor::new(ring))
            .collect::<Result<_, _>>()
            .map_err(|err| DecrypterSetupError::KeyringParse {
                path: PathBuf::from(keyring_path),
                source: err,
            })?;

        if !passphrase.is_empty() {
            for key in &keys {
                key.unlock(|| passphrase.to_string(), |_| Ok(()))
                    .map_err(DecrypterSetupError::Unlock)?;
                for subkey in &key.secret_subkeys {
                    subkey
                        .unlock(|| passphrase.to_string(), |_| Ok(()))
                        .map_err(DecrypterSetupError::Unlock)?;
                }
            }
        }

        Ok(Self {
            keys,
            passphrase: passphrase.to_string(),
        })
    }

    /// Reads one OpenPGP message and decodes its plaintext as a
    /// labeled-secret record.
    ///
    /// # Errors
    ///
    /// Fails when no key in the ring can decrypt the message or the
    /// plaintext is not a labeled-secret record.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Secret, DecrypterError> {
        let message = Message::from_bytes(ciphertext)?;
        let key_refs: Vec<&SignedSecretKey> = self.keys.iter().collect();
        let (decrypted, _key_ids) = message.decrypt(|| self.passphrase.clone(), &key_refs)?;
        let content = decrypted.get_content()?.ok_or(DecrypterError::EmptyMessage)?;
        serde_json::from_slice(&content).map_err(DecrypterError::Record)
    }
}

/// Encrypts labeled-secret records to a set of recipient public keys.
#[derive(Debug)]
pub struct PgpEncoder {
    cipher: SymmetricKeyAlgorithm,
    recipients: Vec<SignedPublicKey>,
}

impl PgpEncoder {
    /// Loads the public ring at `pubring_path` and selects every key whose
    /// primary or subkey id matches one of `key_ids` (16-hex-digit long
    /// ids, case-insensitive).
    ///
    /// # Errors
    ///
    /// Fails on unknown algorithm names, unreadable or unparsable rings,
    /// and when no key matches any requested id.
    pub fn new(
        cipher: &str,
        hash: &str,
        pubring_path: &str,
        key_ids: &[String],
    ) -> Result<Self, DecrypterSetupError> {
        let cipher = cipher_from_name(cipher)?;
        hash_from_name(hash)?;

        let ring = std::fs::read(pubring_path).map_err(|err| DecrypterSetupError::KeyringIo {
            path: PathBuf::from(pubring_path),
            source: err,
        })?;
        let keys: Vec<SignedPublicKey> = SignedPublicKey::from_bytes_many(Cursor::new(ring))
            .collect::<Result<_, _>>()
            .map_err(|err| DecrypterSetupError::KeyringParse {
                path: PathBuf::from(pubring_path),
                source: err,
            })?;

        let wanted: Vec<String> = key_ids.iter().map(|id| id.to_ascii_uppercase()).collect();
        let recipients: Vec<SignedPublicKey> = keys
            .into_iter()
            .filter(|key| {
                let mut ids = vec![key_id_hex(key)];
                ids.extend(key.public_subkeys.iter().map(key_id_hex));
                ids.iter().any(|id| wanted.contains(id))
            })
            .collect();

        if recipients.is_empty() {
            return Err(DecrypterSetupError::NoRecipients(wanted));
        }

        Ok(Self { cipher, recipients })
    }

    /// Encrypts a labeled-secret record to every selected recipient and
    /// returns the message as standard base64.
    ///
    /// # Errors
    ///
    /// Fails when the record cannot be serialized or encryption fails.
    pub fn encode(&self, labels: Vec<String>, plaintext: Vec<u8>) -> Result<String, DecrypterError> {
        let record = Secret {
            labels,
            value: plaintext,
        };
        let body = serde_json::to_vec(&record).map_err(DecrypterError::Record)?;

        let recipient_refs: Vec<&SignedPublicKey> = self.recipients.iter().collect();
        let mut rng = rand::rngs::OsRng;
        let encrypted = Message::new_literal_bytes("", &body).encrypt_to_keys_seipdv1(
            &mut rng,
            self.cipher,
            &recipient_refs,
        )?;

        Ok(STANDARD.encode(encrypted.to_bytes()?))
    }
}

/// Long key id as 16 uppercase hex digits, matching `gpg --keyid-format
/// long` output.
fn key_id_hex(key: &impl PublicKeyTrait) -> String {
    key.key_id()
        .as_ref()
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect()
}
