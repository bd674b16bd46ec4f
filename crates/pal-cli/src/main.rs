//! pal - in-container entrypoint shim.
//!
//! Reads the secrets manifest from `PAL_SECRETS_YAML`, asks the pal daemon
//! to decrypt the tagged ciphertexts for the selected environment, then
//! materializes the plaintexts and replaces itself with the workload named
//! after `--`. Exits non-zero on any failure before the replacement.

mod client;
mod exec;

use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::client::Client;

/// pal - PAL secret-delivery client
#[derive(Parser, Debug)]
#[command(name = "pal")]
#[command(version, about, long_about = None)]
struct Args {
    /// Environment name for the manifest section
    #[arg(long, env = "APP_ENV")]
    env: Option<String>,

    /// Socket file for pald
    #[arg(long, default_value = "/run/pald/pald-rpc.sock")]
    socket: PathBuf,

    /// Wire protocol to speak; only "rpc" is supported
    #[arg(long = "socket-type", default_value = "rpc")]
    socket_type: String,

    /// Workload command and arguments
    #[arg(last = true)]
    argv: Vec<String>,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    if args.socket_type != "rpc" {
        bail!(
            "unsupported socket type {:?}: the legacy http protocol is not served",
            args.socket_type
        );
    }

    let environment = match args.env {
        Some(env) if !env.is_empty() => env,
        _ => bail!("missing --env flag or APP_ENV environment variable"),
    };
    let manifest_text =
        std::env::var("PAL_SECRETS_YAML").context("missing PAL_SECRETS_YAML environment variable")?;

    let mut client = Client::new(&manifest_text, args.socket, &environment)
        .context("could not load secrets manifest")?;
    client.decrypt().context("failed to decrypt secrets")?;

    let environ: Vec<OsString> = std::env::vars_os()
        .map(|(key, value)| {
            let mut entry = key;
            entry.push("=");
            entry.push(value);
            entry
        })
        .collect();

    // Does not return on success: the process image is replaced.
    match client.exec(args.argv, environ) {
        Ok(never) => match never {},
        Err(err) => Err(err).context("failed to execute workload"),
    }
}
