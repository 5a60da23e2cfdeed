//! HTTP batcher / requester pool.
//!
//! N read-workers plus one write-worker coalesce outbound fragments
//! into encrypted POST turns. A fragment is flushed either when the
//! turn buffer would overflow or when the flush timer fires; the timer
//! runs short while requests arrive in a burst.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::Url;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::config::ClientConfig;
use crate::buf::Pusher;
use crate::crypto::{self, KeySchedule, NonceCache, SegmentDecoder};
use crate::dispatch::RequestDispatcher;
use crate::pool::Pool;
use crate::protocol::{self, AddressType, DialRequest, Id};
use crate::session::{Cancel, Cancels, PendingOp, Retrievers, SessionError, Sink};
use crate::{MAX_REQUEST_BODY_SIZE, MAX_REQUEST_PAYLOAD_SIZE};

/// Normal flush delay for a freshly armed turn.
const SEND_DELAY: Duration = Duration::from_millis(128);
/// Flush delay while requests arrive back to back.
const SEND_SHORT_DELAY: Duration = Duration::from_millis(8);
/// Two submissions closer than this count as a burst.
const SEND_SWITCH_THRESHOLD: Duration = Duration::from_millis(128);

struct Request {
    id: Id,
    body: Bytes,
    cancel: Cancel,
}

enum WorkerRx {
    Shared(Arc<AsyncMutex<mpsc::Receiver<Request>>>),
    Owned(mpsc::Receiver<Request>),
}

impl WorkerRx {
    async fn recv(&mut self) -> Option<Request> {
        match self {
            WorkerRx::Shared(rx) => rx.lock().await.recv().await,
            WorkerRx::Owned(rx) => rx.recv().await,
        }
    }
}

pub struct Requester {
    pool: Arc<Pool>,
    keys: KeySchedule,
    nonces: Arc<NonceCache>,
    http: reqwest::Client,
    url: Url,
    retrievers: Arc<Retrievers>,
    dispatcher: RequestDispatcher,
    requests_tx: mpsc::Sender<Request>,
    wrequests_tx: mpsc::Sender<Request>,
    max_retries: usize,
    max_retry_delay: Duration,
}

fn retry_delay(max: Duration, attempt: usize, total: usize) -> Duration {
    let d = max / (total - attempt) as u32;
    d.min(max)
}

impl Requester {
    /// Build the pool and spawn its workers.
    pub fn start(
        cfg: &ClientConfig,
        pool: Arc<Pool>,
        retrievers: Arc<Retrievers>,
        nonces: Arc<NonceCache>,
    ) -> Result<Arc<Self>, SessionError> {
        let url = Url::parse(&cfg.backend).map_err(|_| SessionError::BuildFailed)?;
        let mut builder = reqwest::Client::builder()
            .http1_only()
            .cookie_store(true)
            .connect_timeout(cfg.request_timeout)
            .timeout(cfg.idle_timeout)
            .pool_idle_timeout(cfg.idle_timeout);
        if let (Some(enforced), Some(host)) = (cfg.backend_host_enforce, url.host_str()) {
            builder = builder.resolve(host, enforced);
        }
        let http = builder.build().map_err(|_| SessionError::BuildFailed)?;

        let (requests_tx, requests_rx) = mpsc::channel(1);
        let (wrequests_tx, wrequests_rx) = mpsc::channel(1);
        let requester = Arc::new(Self {
            pool,
            keys: KeySchedule::new(cfg.key.clone()),
            nonces,
            http,
            url,
            dispatcher: RequestDispatcher::new(retrievers.clone()),
            retrievers,
            requests_tx,
            wrequests_tx,
            max_retries: cfg.max_retries,
            max_retry_delay: cfg.request_timeout,
        });

        tokio::spawn(requester.clone().worker(0, WorkerRx::Owned(wrequests_rx)));
        let shared = Arc::new(AsyncMutex::new(requests_rx));
        for i in 0..cfg.max_backend_connections {
            tokio::spawn(
                requester
                    .clone()
                    .worker(i + 1, WorkerRx::Shared(shared.clone())),
            );
        }
        Ok(requester)
    }

    /// Open a logical connection: install a retriever, emit the dial
    /// and wait for the response. The sink is built once under the
    /// fresh id; on failure the retriever is torn down again.
    pub async fn dial(
        self: &Arc<Self>,
        atyp: AddressType,
        addr: Bytes,
        port: u16,
        max_retrieve_len: u16,
        initial: Bytes,
        build: impl FnOnce(Id) -> Arc<dyn Sink>,
    ) -> Result<(Id, Arc<dyn Sink>), SessionError> {
        let (id, sink) = self.retrievers.reserve(build)?;
        let req = DialRequest {
            id,
            atyp,
            addr,
            port,
            max_retrieve_len,
            request: initial,
        };

        let mut buf = self.pool.get();
        let mut last = SessionError::Unresponded;
        for attempt in 0..self.max_retries {
            let mut p = Pusher::new(&mut buf);
            let op = match self.retrievers.register(id, &req, &mut p) {
                Ok(op) => op,
                Err(e) => {
                    last = e;
                    break;
                }
            };
            let body = Bytes::copy_from_slice(p.data());
            match self.run_attempt(id, body, op, false, attempt).await {
                Ok(()) => {
                    self.pool.put(buf);
                    return Ok((id, sink));
                }
                Err(RetryVerdict::Final(e)) => {
                    last = e;
                    break;
                }
                Err(RetryVerdict::Retry(e)) => last = e,
            }
        }
        self.pool.put(buf);
        if let Some(sink) = self.retrievers.release(id) {
            sink.close().await;
        }
        Err(last)
    }

    /// One read turn for a logical connection; the retriever decides
    /// between Retrieve and Resume from its own progress.
    pub async fn retrieve(&self, id: Id) -> Result<(), SessionError> {
        let mut buf = [0u8; protocol::RETRIEVE_REQUEST_OVERHEAD];
        let mut last = SessionError::Unresponded;
        for attempt in 0..self.max_retries {
            let mut p = Pusher::new(&mut buf);
            let op = self.retrievers.retrieve(id, &mut p)?;
            let body = Bytes::copy_from_slice(p.data());
            match self.run_attempt(id, body, op, false, attempt).await {
                Ok(()) => return Ok(()),
                Err(RetryVerdict::Final(e)) => return Err(e),
                Err(RetryVerdict::Retry(e)) => last = e,
            }
        }
        Err(last)
    }

    /// Write `payload`; returns the bytes the egress accepted.
    pub async fn send(&self, id: Id, payload: &[u8]) -> Result<usize, SessionError> {
        let mut buf = self.pool.get();
        let mut last = SessionError::Unresponded;
        let mut written = Err(last);
        for attempt in 0..self.max_retries {
            let mut p = Pusher::new(&mut buf);
            let op = match self.retrievers.send(id, payload.len() as u16, &mut p) {
                Ok(op) => op,
                Err(e) => {
                    written = Err(e);
                    break;
                }
            };
            if p.push(payload).is_err() {
                op.cancel.settle(SessionError::BuildFailed);
                written = Err(SessionError::BuildFailed);
                break;
            }
            let body = Bytes::copy_from_slice(p.data());
            match self.run_sized_attempt(id, body, op, attempt).await {
                Ok(n) => {
                    written = Ok(usize::from(n));
                    break;
                }
                Err(RetryVerdict::Final(e)) => {
                    written = Err(e);
                    break;
                }
                Err(RetryVerdict::Retry(e)) => {
                    last = e;
                    written = Err(last);
                }
            }
        }
        self.pool.put(buf);
        written
    }

    /// Tear down a logical connection. An id unknown locally still
    /// emits the request so the peer releases its state.
    pub async fn close(&self, id: Id) -> Result<(), SessionError> {
        let mut buf = [0u8; protocol::HEADER_SIZE + protocol::ID_SIZE];
        let mut last = SessionError::Unresponded;
        for attempt in 0..self.max_retries {
            let mut p = Pusher::new(&mut buf);
            let op = self.retrievers.close(id, &mut p)?;
            let body = Bytes::copy_from_slice(p.data());
            match self.run_attempt(id, body, op, true, attempt).await {
                Ok(()) => return Ok(()),
                Err(RetryVerdict::Final(e)) => return Err(e),
                Err(RetryVerdict::Retry(e)) => last = e,
            }
        }
        Err(last)
    }

    async fn run_attempt(
        &self,
        id: Id,
        body: Bytes,
        op: PendingOp<()>,
        write_side: bool,
        attempt: usize,
    ) -> Result<(), RetryVerdict> {
        let cancel = op.cancel.clone();
        self.submit(Request { id, body, cancel }, write_side)
            .await
            .map_err(RetryVerdict::Final)?;
        match op.wait().await {
            Ok(()) => Ok(()),
            Err(e) if e.try_again() => {
                tokio::time::sleep(retry_delay(self.max_retry_delay, attempt, self.max_retries))
                    .await;
                Err(RetryVerdict::Retry(e))
            }
            Err(e) => Err(RetryVerdict::Final(e)),
        }
    }

    async fn run_sized_attempt(
        &self,
        id: Id,
        body: Bytes,
        op: PendingOp<u16>,
        attempt: usize,
    ) -> Result<u16, RetryVerdict> {
        let cancel = op.cancel.clone();
        self.submit(Request { id, body, cancel }, true)
            .await
            .map_err(RetryVerdict::Final)?;
        match op.wait().await {
            Ok(n) => Ok(n),
            Err(e) if e.try_again() => {
                tokio::time::sleep(retry_delay(self.max_retry_delay, attempt, self.max_retries))
                    .await;
                Err(RetryVerdict::Retry(e))
            }
            Err(e) => Err(RetryVerdict::Final(e)),
        }
    }

    /// Hand a fragment to the worker pool. Write-path fragments offer
    /// themselves to both channels so some worker always drains them,
    /// even with every read-worker stuck in an HTTP call.
    async fn submit(&self, req: Request, write_side: bool) -> Result<(), SessionError> {
        if !write_side {
            return self
                .requests_tx
                .send(req)
                .await
                .map_err(|_| SessionError::Closed);
        }
        tokio::select! {
            permit = self.requests_tx.reserve() => match permit {
                Ok(p) => {
                    p.send(req);
                    Ok(())
                }
                Err(_) => Err(SessionError::Closed),
            },
            permit = self.wrequests_tx.reserve() => match permit {
                Ok(p) => {
                    p.send(req);
                    Ok(())
                }
                Err(_) => Err(SessionError::Closed),
            },
        }
    }

    async fn worker(self: Arc<Self>, index: usize, mut rx: WorkerRx) {
        let mut turn = vec![0u8; MAX_REQUEST_BODY_SIZE];
        let mut fill = crypto::HEADER_SIZE;
        let mut cancels = Cancels::new();
        let mut deadline: Option<Instant> = None;
        let mut last_submit = Instant::now();

        loop {
            let event = match deadline {
                Some(d) => tokio::select! {
                    req = rx.recv() => Some(req),
                    _ = tokio::time::sleep_until(d) => None,
                },
                None => Some(rx.recv().await),
            };
            match event {
                Some(None) => {
                    if fill > crypto::HEADER_SIZE {
                        self.flush(index, &mut turn, &mut fill, &mut cancels).await;
                    }
                    cancels.settle_all(SessionError::Closed);
                    return;
                }
                Some(Some(req)) => {
                    if fill - crypto::HEADER_SIZE + req.body.len() > MAX_REQUEST_PAYLOAD_SIZE {
                        debug!(worker = index, pending = cancels.len(), "flushing full turn");
                        self.flush(index, &mut turn, &mut fill, &mut cancels).await;
                    }
                    if fill - crypto::HEADER_SIZE + req.body.len() > MAX_REQUEST_PAYLOAD_SIZE {
                        req.cancel.settle(SessionError::RequestBodyTooLarge);
                        continue;
                    }
                    turn[fill..fill + req.body.len()].copy_from_slice(&req.body);
                    fill += req.body.len();
                    cancels.insert(req.id, req.cancel);

                    let now = Instant::now();
                    let delay = if now.duration_since(last_submit) < SEND_SWITCH_THRESHOLD {
                        SEND_SHORT_DELAY
                    } else {
                        SEND_DELAY
                    };
                    deadline = Some(now + delay);
                    last_submit = now;
                }
                None => {
                    deadline = None;
                    if fill > crypto::HEADER_SIZE {
                        debug!(worker = index, pending = cancels.len(), "flushing on timer");
                        self.flush(index, &mut turn, &mut fill, &mut cancels).await;
                    }
                }
            }
        }
    }

    async fn flush(&self, index: usize, turn: &mut [u8], fill: &mut usize, cancels: &mut Cancels) {
        let started = Instant::now();
        match self.send_turn(turn, *fill, cancels).await {
            Ok(()) => debug!(
                worker = index,
                elapsed = ?started.elapsed(),
                "turn completed"
            ),
            Err(e) => warn!(
                worker = index,
                elapsed = ?started.elapsed(),
                error = %e,
                "turn failed, fragments will retry"
            ),
        }
        cancels.settle_all(SessionError::Unresponded);
        *fill = crypto::HEADER_SIZE;
    }

    /// Seal the turn, POST it and dispatch the streamed response
    /// segment by segment.
    async fn send_turn(
        &self,
        turn: &mut [u8],
        fill: usize,
        cancels: &mut Cancels,
    ) -> Result<(), SessionError> {
        let (key, epoch) = self.keys.current();
        let cipher = crypto::session_cipher(&key).map_err(|_| SessionError::CipherFailed)?;
        let nonce = crypto::random_nonce().map_err(|_| SessionError::CipherFailed)?;
        let total = fill + crypto::TAG_SIZE;
        crypto::seal(&cipher, nonce, &mut turn[..total])
            .map_err(|_| SessionError::CipherFailed)?;

        let mut rsp = self
            .http
            .post(self.url.clone())
            .header(reqwest::header::CONNECTION, "keep-alive")
            .body(Bytes::copy_from_slice(&turn[..total]))
            .send()
            .await
            .map_err(|e| {
                debug!(error = %e, "http request failed");
                SessionError::Unresponded
            })?;
        debug!(status = %rsp.status(), "http request responded");

        let mut decoder = SegmentDecoder::new(&key, epoch, |n, t| self.nonces.verify(n, t))
            .map_err(|_| SessionError::CipherFailed)?;
        let mut saw_segment = false;
        while let Some(chunk) = rsp
            .chunk()
            .await
            .map_err(|_| SessionError::NoRespondBody)?
        {
            decoder.push(&chunk);
            loop {
                match decoder.next() {
                    Ok(Some(seg)) => {
                        saw_segment = true;
                        self.dispatcher.dispatch(&seg, cancels).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "respond segment rejected");
                        return Err(SessionError::CipherFailed);
                    }
                }
            }
        }
        decoder
            .finish()
            .map_err(|_| SessionError::CipherFailed)?;
        if !saw_segment {
            return Err(SessionError::NoRespondBody);
        }
        Ok(())
    }
}

enum RetryVerdict {
    Retry(SessionError),
    Final(SessionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_shrinks_toward_the_cap() {
        let max = Duration::from_secs(6);
        // Earlier attempts wait a fraction of the cap; the last one
        // waits the whole cap.
        assert_eq!(retry_delay(max, 0, 6), Duration::from_secs(1));
        assert_eq!(retry_delay(max, 3, 6), Duration::from_secs(2));
        assert_eq!(retry_delay(max, 5, 6), Duration::from_secs(6));
    }
}
