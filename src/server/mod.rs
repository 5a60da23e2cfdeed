//! The backend server: accepts HTTP(S) POST turns, opens egress
//! sockets on behalf of clients and streams encrypted sub-responses
//! back.

mod config;
mod handler;

pub use config::ServerConfig;

use std::sync::Arc;

use anyhow::Context;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::crypto::{KeySchedule, NonceCache};
use crate::dispatch::Responder;
use crate::pool::Pool;
use crate::relay;
use crate::session::Sessions;
use crate::{MAX_REQUEST_BODY_SIZE, MAX_RESPOND_DATA_SIZE};

use handler::Handler;

/// Replay cache entries kept per key epoch.
const NONCE_STORE_SIZE: usize = 512;

fn tls_acceptor(cfg: &ServerConfig) -> anyhow::Result<Option<TlsAcceptor>> {
    if cfg.tls_public_key_block.is_empty() || cfg.tls_private_key_block.is_empty() {
        return Ok(None);
    }
    let certs: Vec<_> = rustls_pemfile::certs(&mut cfg.tls_public_key_block.as_slice())
        .collect::<Result<_, _>>()
        .context("failed to parse TLS certificate block")?;
    if certs.is_empty() {
        anyhow::bail!("no certificates in the TLS certificate block");
    }
    let key = rustls_pemfile::private_key(&mut cfg.tls_private_key_block.as_slice())
        .context("failed to parse TLS private key block")?
        .context("no private key in the TLS private key block")?;
    let tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to build TLS server config")?;
    Ok(Some(TlsAcceptor::from(Arc::new(tls))))
}

/// Run the backend until the listener dies.
pub async fn run(cfg: ServerConfig) -> anyhow::Result<()> {
    info!(version = crate::VERSION, "starting backend server");

    let pool = Arc::new(Pool::new(
        MAX_REQUEST_BODY_SIZE,
        cfg.max_outgoing_connections * 2,
    ));
    let sessions = Sessions::new(
        cfg.max_outgoing_connections,
        cfg.idle_timeout,
        relay::Config {
            dial_timeout: cfg.dial_timeout,
            retrieve_timeout: cfg.retrieve_timeout,
        },
        pool.clone(),
    );

    // Idle sessions are reaped at twice the timeout granularity.
    let recycler_sessions = sessions.clone();
    let recycle_every = cfg.idle_timeout / 2;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(recycle_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            recycler_sessions.recycle().await;
        }
    });

    let handler = Arc::new(Handler {
        responder: Arc::new(Responder::new(sessions.clone(), MAX_RESPOND_DATA_SIZE)),
        pool,
        keys: KeySchedule::new(cfg.key.clone()),
        nonces: Arc::new(NonceCache::new(NONCE_STORE_SIZE)),
    });

    let acceptor = tls_acceptor(&cfg)?;
    if acceptor.is_some() {
        info!("TLS enabled");
    }

    let listener = TcpListener::bind(crate::config::bind_address(&cfg.listen))
        .await
        .context("failed to bind listen address")?;
    info!(listen = %cfg.listen, "http listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let handler = handler.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls) => serve_connection(tls, peer, handler).await,
                    Err(e) => debug!(%peer, error = %e, "tls accept failed"),
                },
                None => serve_connection(stream, peer, handler).await,
            }
        });
    }
}

async fn serve_connection<S>(io: S, peer: std::net::SocketAddr, handler: Arc<Handler>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let handler = handler.clone();
        async move { Ok::<_, std::convert::Infallible>(handler.serve(peer, req).await) }
    });
    if let Err(e) = http1::Builder::new()
        .keep_alive(true)
        .serve_connection(TokioIo::new(io), service)
        .await
    {
        debug!(%peer, error = %e, "connection ended");
    }
}
