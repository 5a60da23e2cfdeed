//! The client end of the tunnel: local SOCKS5 front-end plus the HTTP
//! batcher that carries logical connections to the backend.

mod config;
mod conn;
mod requester;
mod socks5;
mod udp;

pub use config::ClientConfig;
pub use conn::TunnelConn;
pub use requester::Requester;

use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::crypto::NonceCache;
use crate::pool::Pool;
use crate::session::{Retrievers, SessionError};
use crate::MAX_REQUEST_PAYLOAD_SIZE;

/// Replay cache entries kept per key epoch.
const NONCE_STORE_SIZE: usize = 512;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no supported socks5 auth method")]
    NoAuthMethod,

    #[error("socks5 auth failed")]
    AuthFailed,

    #[error("bad socks5 address type {0}")]
    BadAddressType(u8),

    #[error("unsupported socks5 command {0}")]
    UnsupportedCommand(u8),

    #[error("socks5 handshake timed out")]
    HandshakeTimeout,

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Run the local SOCKS5 front-end until the listener dies.
pub async fn run(cfg: ClientConfig) -> anyhow::Result<()> {
    info!(version = crate::VERSION, backend = %cfg.backend, "starting local socks5 front-end");

    let pool = Arc::new(Pool::new(
        MAX_REQUEST_PAYLOAD_SIZE,
        cfg.max_client_connections,
    ));
    let retrievers = Retrievers::new(cfg.max_client_connections);
    let nonces = Arc::new(NonceCache::new(NONCE_STORE_SIZE));
    let requester = Requester::start(&cfg, pool.clone(), retrievers.clone(), nonces)
        .map_err(|e| anyhow::anyhow!("requester setup failed: {e}"))?;

    let auth = if cfg.username.is_empty() && cfg.password.is_empty() {
        info!("socks5 auth disabled");
        None
    } else {
        info!(username = %cfg.username, "socks5 auth enabled");
        Some((cfg.username.clone(), cfg.password.clone()))
    };
    let auth = Arc::new(auth);

    let listener = TcpListener::bind(crate::config::bind_address(&cfg.listen)).await?;
    info!(listen = %cfg.listen, "socks5 listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        debug!(%peer, "accepted");
        let _ = stream.set_nodelay(true);
        let requester = requester.clone();
        let pool = pool.clone();
        let auth = auth.clone();
        let handshake_timeout = cfg.request_timeout;
        let max_retrieve_len = cfg.max_retrieve_length;
        tokio::spawn(async move {
            let served = socks5::serve(
                stream,
                auth.as_ref().as_ref(),
                handshake_timeout,
                requester,
                pool,
                max_retrieve_len,
            )
            .await;
            match served {
                Ok(()) => debug!(%peer, "request finished"),
                Err(e) => debug!(%peer, error = %e, "request failed"),
            }
        });
    }
}
