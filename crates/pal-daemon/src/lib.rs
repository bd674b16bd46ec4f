//! pal-daemon - the PAL secret-delivery daemon library.
//!
//! The daemon accepts connections on a local stream socket, authenticates
//! each caller by its kernel-reported peer credentials, optionally resolves
//! the caller's container image to a set of attested labels, decrypts the
//! tagged ciphertexts in the request through the configured decrypter set,
//! and releases each plaintext only when the labels bound inside the
//! ciphertext are covered by the caller's attested set.
//!
//! One connection carries exactly one request and one response; per-request
//! state lives on the connection task and dies with it. The only shared
//! mutable state is the per-label decryption counter.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod credentials;
pub mod labels;
pub mod metrics;
pub mod server;

pub use credentials::PeerCredentials;
pub use server::{ListenAddress, Listener, Server};
