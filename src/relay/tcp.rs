//! TCP egress relay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};

use super::{Config, Relay, RelayError};
use crate::session::Endpoint;

pub struct TcpRelay {
    endpoint: Endpoint,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    retrieve_timeout: Mutex<Duration>,
    closed: AtomicBool,
    close_signal: Notify,
}

impl TcpRelay {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            retrieve_timeout: Mutex::new(Duration::ZERO),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Relay for TcpRelay {
    async fn connect(&self, cfg: &Config) -> Result<(), RelayError> {
        let connecting = async {
            match &self.endpoint {
                Endpoint::Socket(sa) => TcpStream::connect(*sa).await,
                Endpoint::Host(host, port) => TcpStream::connect((host.as_str(), *port)).await,
            }
        };
        let stream = tokio::time::timeout(cfg.dial_timeout, connecting)
            .await
            .map_err(|_| RelayError::Timeout)??;
        let _ = stream.set_nodelay(true);
        let (r, w) = stream.into_split();
        *self.reader.lock().await = Some(r);
        *self.writer.lock().await = Some(w);
        *self.retrieve_timeout.lock().await = cfg.retrieve_timeout;
        Ok(())
    }

    async fn retrieve(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        let timeout = if timeout.is_zero() {
            *self.retrieve_timeout.lock().await
        } else {
            timeout
        };
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(RelayError::NotConnected)?;
        tokio::select! {
            read = tokio::time::timeout(timeout, reader.read(buf)) => match read {
                Err(_) => Err(RelayError::Timeout),
                Ok(Ok(0)) => Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into()),
                Ok(Ok(n)) => Ok(n),
                Ok(Err(e)) => Err(e.into()),
            },
            _ = self.close_signal.notified() => Err(RelayError::Closed),
        }
    }

    async fn send(&self, data: &[u8]) -> Result<usize, RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(RelayError::NotConnected)?;
        writer.write_all(data).await?;
        Ok(data.len())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_signal.notify_waiters();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn config() -> Config {
        Config {
            dial_timeout: Duration::from_secs(1),
            retrieve_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn connect_send_retrieve() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });

        let relay = TcpRelay::new(Endpoint::Socket(addr));
        relay.connect(&config()).await.unwrap();
        assert_eq!(relay.send(b"ping").await.unwrap(), 4);

        let mut buf = [0u8; 16];
        let n = relay
            .retrieve(&mut buf, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"ping");
        relay.close().await;
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn retrieve_times_out_when_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let (_s, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let relay = TcpRelay::new(Endpoint::Socket(addr));
        relay.connect(&config()).await.unwrap();
        let mut buf = [0u8; 16];
        let err = relay
            .retrieve(&mut buf, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        relay.close().await;
        hold.abort();
    }

    #[tokio::test]
    async fn connect_refused_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let relay = TcpRelay::new(Endpoint::Socket(addr));
        assert!(relay.connect(&config()).await.is_err());
    }
}
