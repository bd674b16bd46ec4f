//! palpgpenc - offline PGP encoder for PAL secrets.
//!
//! Reads a plaintext from standard input, wraps it in a labeled-secret
//! record, encrypts the record to the selected recipient keys, and writes
//! standard base64 to standard output. The result is the payload of a
//! `pgp:` (or `pgp+base64:`) manifest value.

use std::io::{Read as _, Write as _};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use pal_core::decrypter::PgpEncoder;

/// palpgpenc - encrypt a PAL secret to PGP recipients
#[derive(Parser, Debug)]
#[command(name = "palpgpenc")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "Example:\n  echo -n my-secret-pgp-password | palpgpenc --labels=testpal --keyids=6C7EE1B8621CC013"
)]
struct Args {
    /// Comma-separated labels to bind into the secret
    #[arg(long, default_value = "")]
    labels: String,

    /// Comma-separated full key ids (e.g. "6C7EE1B8621CC013") that can
    /// decrypt the message
    #[arg(long, default_value = "")]
    keyids: String,

    /// PGP cipher
    #[arg(long, default_value = "aes256")]
    cipher: String,

    /// PGP hash
    #[arg(long, default_value = "sha256")]
    hash: String,

    /// PGP pubring location (default ~/.gnupg/pubring.gpg)
    #[arg(long)]
    pubring: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let labels = split_list(&args.labels);
    if labels.is_empty() {
        bail!("label list is required; pass --labels=<label>[,<label>...]");
    }
    let key_ids = split_list(&args.keyids);
    if key_ids.is_empty() {
        bail!("key ids are required; pass --keyids=<keyid>[,<keyid>...]");
    }

    let pubring = match args.pubring {
        Some(path) => path,
        None => {
            let home = std::env::var_os("HOME").context("HOME is not set; pass --pubring")?;
            PathBuf::from(home).join(".gnupg").join("pubring.gpg")
        }
    };

    let encoder = PgpEncoder::new(
        &args.cipher,
        &args.hash,
        &pubring.to_string_lossy(),
        &key_ids,
    )
    .context("failed to prepare the encoder")?;

    let mut plaintext = Vec::new();
    std::io::stdin()
        .read_to_end(&mut plaintext)
        .context("failed to read plaintext from stdin")?;

    let ciphertext = encoder
        .encode(labels, plaintext)
        .context("failed to encrypt secret")?;

    let mut stdout = std::io::stdout();
    stdout.write_all(ciphertext.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .map(str::to_string)
        .collect()
}
