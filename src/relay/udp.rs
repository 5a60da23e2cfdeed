//! UDP egress relay. The socket is connected so sends need no
//! per-datagram address and reads only accept the chosen peer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

use super::{Config, Relay, RelayError};
use crate::session::Endpoint;

pub struct UdpRelay {
    endpoint: Endpoint,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    retrieve_timeout: Mutex<Duration>,
    closed: AtomicBool,
    close_signal: Notify,
}

impl UdpRelay {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            socket: Mutex::new(None),
            retrieve_timeout: Mutex::new(Duration::ZERO),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, RelayError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RelayError::Closed);
        }
        self.socket.lock().clone().ok_or(RelayError::NotConnected)
    }

    async fn resolve(&self) -> Result<SocketAddr, RelayError> {
        match &self.endpoint {
            Endpoint::Socket(sa) => Ok(*sa),
            Endpoint::Host(host, port) => tokio::net::lookup_host((host.as_str(), *port))
                .await?
                .next()
                .ok_or(RelayError::NotConnected),
        }
    }
}

#[async_trait]
impl Relay for UdpRelay {
    async fn connect(&self, cfg: &Config) -> Result<(), RelayError> {
        let connecting = async {
            let target = self.resolve().await?;
            let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = UdpSocket::bind(bind_addr).await?;
            socket.connect(target).await?;
            Ok::<_, RelayError>(socket)
        };
        let socket = tokio::time::timeout(cfg.dial_timeout, connecting)
            .await
            .map_err(|_| RelayError::Timeout)??;
        *self.socket.lock() = Some(Arc::new(socket));
        *self.retrieve_timeout.lock() = cfg.retrieve_timeout;
        Ok(())
    }

    async fn retrieve(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, RelayError> {
        let socket = self.socket()?;
        let timeout = if timeout.is_zero() {
            *self.retrieve_timeout.lock()
        } else {
            timeout
        };
        tokio::select! {
            read = tokio::time::timeout(timeout, socket.recv(buf)) => match read {
                Err(_) => Err(RelayError::Timeout),
                Ok(Ok(n)) => Ok(n),
                Ok(Err(e)) => Err(e.into()),
            },
            _ = self.close_signal.notified() => Err(RelayError::Closed),
        }
    }

    async fn send(&self, data: &[u8]) -> Result<usize, RelayError> {
        let socket = self.socket()?;
        Ok(socket.send(data).await?)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_signal.notify_waiters();
        self.socket.lock().take();
    }
}
