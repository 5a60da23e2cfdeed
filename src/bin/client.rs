//! Burrow client: a local SOCKS5 proxy that carries every connection
//! to the backend over plain HTTP(S) POST polling.

use anyhow::{Context, Result};
use clap::Parser;

use burrow::client::{self, ClientConfig};

/// Local SOCKS5 front-end of the burrow tunnel.
#[derive(Parser, Debug)]
#[command(name = "burrow-client")]
#[command(about = "SOCKS5 proxy tunneled over HTTP(S) POST polling")]
#[command(version)]
struct Args {
    /// Listen address (overrides the WWFListen environment value)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    let mut cfg = ClientConfig::load().context("configuration error")?;
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }

    client::run(cfg).await
}
