//! # pal-core
//!
//! Core library for PAL, a two-process secret-delivery system for
//! containerized workloads.
//!
//! A host-resident daemon (`pald`) holds the credentials able to unwrap
//! encrypted secrets; an in-container helper (`pal`) reads a per-environment
//! manifest, asks the daemon to decrypt the tagged ciphertexts it finds
//! there, materializes the plaintexts, and replaces itself with the
//! workload's real entrypoint.
//!
//! This crate carries everything both processes agree on:
//!
//! - **Codec**: the `scheme[+base64]:payload` tagged-ciphertext string form
//! - **Wire**: the one-request/one-response JSON protocol on the local socket
//! - **Manifest**: the environment-keyed client document
//! - **Config**: the environment-keyed daemon configuration
//! - **Decrypters**: the Red October threshold client and the OpenPGP
//!   keyring decrypter, plus the offline encoder that produces PGP blobs

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod config;
pub mod decrypter;
pub mod document;
pub mod manifest;
pub mod wire;

pub use codec::TaggedCiphertext;
pub use decrypter::{Decrypter, Secret};
pub use manifest::ManifestEntry;
pub use wire::{DecryptionRequest, DecryptionResponse, ErrorResponse};
