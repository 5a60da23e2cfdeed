//! HTTP handler: decrypt the POST body, drive the responder and stream
//! each encrypted sub-response back as it settles.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use ring::aead::LessSafeKey;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::buf::Pusher;
use crate::crypto::{self, KeySchedule, NonceCache, SegmentDecoder};
use crate::dispatch::{DispatchError, Responder, SubResponseSink};
use crate::pool::Pool;
use crate::protocol::ProtocolError;
use crate::MAX_REQUEST_BODY_SIZE;

type ResponseBody = BoxBody<Bytes, Infallible>;
type FrameTx = mpsc::Sender<Result<Frame<Bytes>, Infallible>>;

pub(crate) struct Handler {
    pub responder: Arc<Responder>,
    pub pool: Arc<Pool>,
    pub keys: KeySchedule,
    pub nonces: Arc<NonceCache>,
}

/// Seals each serialized sub-response into its own segment and flushes
/// it through the streamed response body.
struct SealingSink {
    cipher: LessSafeKey,
    pool: Arc<Pool>,
    tx: FrameTx,
}

impl SubResponseSink for SealingSink {
    fn write<'a>(
        &'a self,
        build: &'a (dyn Fn(&mut Pusher<'_>) -> Result<(), ProtocolError> + Send + Sync),
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
        Box::pin(async move {
            let mut buf = self.pool.get();
            let mut p = Pusher::new(&mut buf);
            p.truncate(crypto::HEADER_SIZE);
            let built = build(&mut p);
            let total = p.len() + crypto::TAG_SIZE;
            let result = match built {
                Err(e) => Err(DispatchError::Protocol(e)),
                Ok(()) => crypto::random_nonce()
                    .and_then(|nonce| crypto::seal(&self.cipher, nonce, &mut buf[..total]))
                    .map_err(|_| DispatchError::SinkFailed),
            };
            let segment = result.map(|()| Bytes::copy_from_slice(&buf[..total]));
            self.pool.put(buf);
            self.tx
                .send(Ok(Frame::data(segment?)))
                .await
                .map_err(|_| DispatchError::SinkFailed)
        })
    }
}

fn empty_response(status: StatusCode) -> Response<ResponseBody> {
    let mut rsp = Response::new(Empty::new().boxed());
    *rsp.status_mut() = status;
    rsp
}

impl Handler {
    /// Serve one POST turn.
    pub async fn serve(
        self: Arc<Self>,
        peer: SocketAddr,
        req: Request<Incoming>,
    ) -> Response<ResponseBody> {
        let content_length = req
            .headers()
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(-1);
        if content_length <= 0 || content_length > MAX_REQUEST_BODY_SIZE as i64 {
            debug!(%peer, content_length, "invalid request size");
            return empty_response(StatusCode::OK);
        }

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(%peer, error = %e, "invalid request body");
                return empty_response(StatusCode::BAD_REQUEST);
            }
        };
        if body.len() > MAX_REQUEST_BODY_SIZE {
            debug!(%peer, len = body.len(), "request body over size");
            return empty_response(StatusCode::BAD_REQUEST);
        }

        let (key, epoch) = self.keys.current();
        let cipher = match crypto::session_cipher(&key) {
            Ok(c) => c,
            Err(e) => {
                debug!(%peer, error = %e, "unable to build cipher");
                return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        debug!(%peer, len = body.len(), "turn arrived");
        let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, Infallible>>(16);
        let handler = self.clone();
        tokio::spawn(async move {
            let sink: Arc<dyn SubResponseSink> = Arc::new(SealingSink {
                cipher,
                pool: handler.pool.clone(),
                tx,
            });
            let nonces = handler.nonces.clone();
            let mut decoder = match SegmentDecoder::new(&key, epoch, move |n, t| {
                nonces.verify(n, t)
            }) {
                Ok(d) => d,
                Err(e) => {
                    debug!(%peer, error = %e, "decoder setup failed");
                    return;
                }
            };
            decoder.push(&body);
            loop {
                match decoder.next() {
                    Ok(Some(seg)) => {
                        if let Err(e) = handler.responder.dispatch(&seg, &sink).await {
                            debug!(%peer, error = %e, "turn aborted");
                            return;
                        }
                    }
                    Ok(None) => {
                        if decoder.finish().is_err() {
                            debug!(%peer, "trailing bytes after the last segment");
                        }
                        debug!(%peer, "turn finished");
                        return;
                    }
                    Err(e) => {
                        debug!(%peer, error = %e, "undecipherable turn");
                        return;
                    }
                }
            }
        });

        let mut rsp = Response::new(StreamBody::new(ReceiverStream::new(rx)).boxed());
        rsp.headers_mut().insert(
            CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("application/octet-stream"),
        );
        rsp.headers_mut().insert(
            CACHE_CONTROL,
            hyper::header::HeaderValue::from_static("no-store"),
        );
        rsp
    }
}
