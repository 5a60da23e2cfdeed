//! Egress relay: async read/write/close over the outbound socket.
//!
//! The session layer never touches sockets directly; it drives a
//! [`Relay`] and interprets timeouts as the long-poll signal.

mod tcp;
mod udp;

pub use tcp::TcpRelay;
pub use udp::UdpRelay;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::AddressType;
use crate::session::Endpoint;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("operation timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("relay is not connected")]
    NotConnected,

    #[error("relay closed")]
    Closed,
}

impl RelayError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RelayError::Timeout)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub dial_timeout: Duration,
    pub retrieve_timeout: Duration,
}

#[async_trait]
pub trait Relay: Send + Sync {
    /// Open the outbound socket, bounded by the dial timeout.
    async fn connect(&self, cfg: &Config) -> Result<(), RelayError>;

    /// One read into `buf`. A zero `timeout` falls back to the
    /// configured retrieve timeout; an elapsed timer surfaces as
    /// [`RelayError::Timeout`].
    async fn retrieve(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, RelayError>;

    /// Write `data`, reporting the bytes accepted.
    async fn send(&self, data: &[u8]) -> Result<usize, RelayError>;

    /// Tear the socket down, waking any pending read.
    async fn close(&self);
}

/// The address type selects the egress transport.
pub fn build_relay(atyp: AddressType, endpoint: Endpoint) -> Arc<dyn Relay> {
    if atyp.is_tcp() {
        Arc::new(TcpRelay::new(endpoint))
    } else {
        Arc::new(UdpRelay::new(endpoint))
    }
}
