//! Burrow server: the HTTP(S) backend that opens egress sockets on
//! behalf of tunnel clients.

use anyhow::{Context, Result};
use clap::Parser;

use burrow::server::{self, ServerConfig};

/// Backend egress server of the burrow tunnel.
#[derive(Parser, Debug)]
#[command(name = "burrow-server")]
#[command(about = "HTTP(S) backend for the burrow tunnel")]
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

    let mut cfg = ServerConfig::load().context("configuration error")?;
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }

    // The Logging switch silences per-request logs; errors still show.
    let filter = if cfg.logging {
        args.log_level.clone()
    } else {
        "error".to_string()
    };
    tracing_subscriber::fmt().with_env_filter(filter.as_str()).init();

    server::run(cfg).await
}
