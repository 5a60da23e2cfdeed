//! The client side of one tunneled TCP connection: a hosted SOCKS5
//! socket wired to the requester through the retriever table.
//!
//! Each established connection runs two tasks: the outbound pump
//! (`serve`) reading the hosted socket and sending through the tunnel,
//! and the retrieve loop polling the tunnel and writing into the
//! hosted socket.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::debug;

use super::requester::Requester;
use crate::pool::Pool;
use crate::protocol::{Id, SEND_HEADER_OVERHEAD};
use crate::session::{SessionError, Sink};

struct ConnInner {
    id: Id,
    max_send_len: u16,
    requester: Arc<Requester>,
    pool: Arc<Pool>,
    reader: AsyncMutex<Option<OwnedReadHalf>>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    closing: watch::Sender<bool>,
}

impl ConnInner {
    /// Close the hosted socket: wake the pump, finish any in-flight
    /// delivery (the writer lock serializes with `retrieved`) and send
    /// the FIN.
    async fn shutdown(&self) {
        let _ = self.closing.send(true);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();
    }
}

#[derive(Clone)]
pub struct TunnelConn {
    inner: Arc<ConnInner>,
}

impl TunnelConn {
    pub fn new(
        id: Id,
        max_send_len: u16,
        requester: Arc<Requester>,
        pool: Arc<Pool>,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
    ) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConnInner {
                id,
                max_send_len,
                requester,
                pool,
                reader: AsyncMutex::new(Some(reader)),
                writer: AsyncMutex::new(Some(writer)),
                closing,
            }),
        }
    }

    /// The outbound pump: read the hosted socket, send through the
    /// tunnel until everything is written, close the logical
    /// connection on the way out.
    pub async fn serve(&self) -> Result<(), SessionError> {
        let result = self.pump().await;
        if let Err(e) = self.inner.requester.close(self.inner.id).await {
            debug!(id = %self.inner.id, error = %e, "close failed");
        }
        result
    }

    async fn pump(&self) -> Result<(), SessionError> {
        let Some(mut reader) = self.inner.reader.lock().await.take() else {
            return Ok(());
        };
        let mut buf = self.inner.pool.get();
        let max = (buf.len() - SEND_HEADER_OVERHEAD).min(usize::from(self.inner.max_send_len));
        let result = Self::pump_loop(&self.inner, &mut reader, &mut buf[..max]).await;
        self.inner.pool.put(buf);
        result
    }

    async fn pump_loop(
        inner: &ConnInner,
        reader: &mut OwnedReadHalf,
        buf: &mut [u8],
    ) -> Result<(), SessionError> {
        let mut closing = inner.closing.subscribe();
        loop {
            if *closing.borrow() {
                return Ok(());
            }
            let n = tokio::select! {
                read = reader.read(buf) => match read {
                    Ok(0) | Err(_) => return Ok(()),
                    Ok(n) => n,
                },
                _ = closing.changed() => return Ok(()),
            };
            let mut written = 0;
            while written < n {
                written += inner.requester.send(inner.id, &buf[written..n]).await?;
            }
        }
    }
}

#[async_trait]
impl Sink for TunnelConn {
    async fn dialed(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = inner.requester.retrieve(inner.id).await {
                    debug!(id = %inner.id, error = %e, "retrieve loop ended");
                    break;
                }
            }
            inner.shutdown().await;
        });
    }

    async fn retrieved(&self, data: &[u8]) {
        let mut guard = self.inner.writer.lock().await;
        let failed = match guard.as_mut() {
            Some(writer) => writer.write_all(data).await.is_err(),
            None => return,
        };
        if failed {
            // The hosted peer is gone; tear the socket down so the
            // pump notices.
            if let Some(mut writer) = guard.take() {
                let _ = writer.shutdown().await;
            }
            drop(guard);
            let _ = self.inner.closing.send(true);
        }
    }

    async fn close(&self) {
        self.inner.shutdown().await;
    }
}
