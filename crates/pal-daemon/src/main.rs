//! pald - the PAL secret-delivery daemon.
//!
//! Loads one environment's section from the YAML configuration, builds the
//! decrypter set and (optionally) the label retriever, and serves the
//! decryption RPC on a local stream socket until SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use pal_daemon::server::{ListenAddress, Listener, Server};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// pald - PAL secret-delivery daemon
#[derive(Parser, Debug)]
#[command(name = "pald")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration YAML file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Environment name for the config section
    #[arg(long, env = "APP_ENV")]
    env: Option<String>,

    /// RPC socket to serve on: unix://<path> or fd://<number>
    #[arg(long = "addr-rpc", default_value = "unix:///run/pald/pald-rpc.sock")]
    addr_rpc: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let environment = match args.env {
        Some(env) if !env.is_empty() => env,
        _ => bail!("missing --env flag or APP_ENV environment variable"),
    };

    let text = std::fs::read_to_string(&args.config)
        .with_context(|| format!("could not open server configuration file {:?}", args.config))?;
    let config = pal_core::config::load(&text, &environment)
        .context("could not parse server configuration")?;

    let server =
        Arc::new(Server::from_config(&config).context("failed to initialize PAL server")?);

    let address: ListenAddress = args
        .addr_rpc
        .parse()
        .context("invalid --addr-rpc address")?;
    let listener = Listener::bind(&address)
        .with_context(|| format!("failed to listen on {address}"))?;
    info!("listening on {address}");

    server
        .serve(listener, shutdown_signal())
        .await
        .context("server terminated abnormally")?;

    if let ListenAddress::Unix(path) = &address {
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
    }

    Ok(())
}

/// Resolves on the first SIGINT or SIGTERM.
async fn shutdown_signal() {
    let mut interrupt = signal(SignalKind::interrupt()).expect("SIGINT handler installs");
    let mut terminate = signal(SignalKind::terminate()).expect("SIGTERM handler installs");

    tokio::select! {
        _ = interrupt.recv() => info!("received SIGINT"),
        _ = terminate.recv() => info!("received SIGTERM"),
    }
}
