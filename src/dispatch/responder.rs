//! Server-side dispatcher: routes requests to sessions and serializes
//! each sub-response through the caller's sink as it becomes
//! available.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::debug;

use super::DispatchError;
use crate::buf::{Fetcher, Pusher};
use crate::protocol::{
    unpack_type, AddressType, CloseRequest, DialRequest, Kind, ProtocolError, ResumeRequest,
    RetrieveRequest, SendRequest,
};
use crate::session::Sessions;

/// Where serialized sub-responses go. The server's sink seals each one
/// into its own encrypted segment and flushes it to the HTTP response;
/// tests collect plaintext.
pub trait SubResponseSink: Send + Sync {
    fn write<'a>(
        &'a self,
        build: &'a (dyn Fn(&mut Pusher<'_>) -> Result<(), ProtocolError> + Send + Sync),
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>>;
}

pub struct Responder {
    sessions: Arc<Sessions>,
    max_retrieve_len: usize,
}

impl Responder {
    pub fn new(sessions: Arc<Sessions>, max_retrieve_len: usize) -> Self {
        Self {
            sessions,
            max_retrieve_len,
        }
    }

    /// Run one decrypted segment of requests. Long-poll operations
    /// (dial, retrieve, resume) proceed concurrently and flush their
    /// sub-responses as they settle; the call returns once every
    /// response has been written.
    pub async fn dispatch(
        &self,
        seg: &[u8],
        sink: &Arc<dyn SubResponseSink>,
    ) -> Result<(), DispatchError> {
        let mut pending = JoinSet::new();
        let result = self.run_segment(seg, sink, &mut pending).await;
        while pending.join_next().await.is_some() {}
        result
    }

    async fn run_segment(
        &self,
        seg: &[u8],
        sink: &Arc<dyn SubResponseSink>,
        pending: &mut JoinSet<()>,
    ) -> Result<(), DispatchError> {
        let mut f = Fetcher::new(seg);
        loop {
            let header = match f.fetch(1) {
                Ok(b) => b[0],
                Err(_) => return Ok(()),
            };
            let (kind, data) = unpack_type(header);
            let kind = Kind::try_from(kind)?;
            match kind {
                Kind::Dial => {
                    let atyp = AddressType::try_from(data)?;
                    let req = DialRequest::parse(atyp, &mut f)?;
                    debug!(id = %req.id, endpoint_type = ?atyp, "dial request");
                    let sessions = self.sessions.clone();
                    let sink = sink.clone();
                    let maxlen = self.max_retrieve_len;
                    pending.spawn(async move {
                        let (c, rsp) = sessions.register(&req, maxlen).await;
                        if let Err(e) = sink.write(&|p: &mut Pusher<'_>| rsp.build(c, p)).await {
                            debug!(id = %req.id, error = %e, "dial respond dropped");
                        } else {
                            debug!(id = %req.id, code = c, "dial responded");
                        }
                    });
                }
                Kind::Retrieve => {
                    let req = RetrieveRequest::parse(&mut f)?;
                    debug!(id = %req.id, "retrieve request");
                    let sessions = self.sessions.clone();
                    let sink = sink.clone();
                    let maxlen = self.max_retrieve_len;
                    pending.spawn(async move {
                        let (c, rsp) = sessions.retrieve(req, maxlen).await;
                        if let Err(e) = sink.write(&|p: &mut Pusher<'_>| rsp.build(c, p)).await {
                            debug!(id = %req.id, error = %e, "retrieve respond dropped");
                        } else {
                            debug!(id = %req.id, code = c, "retrieve responded");
                        }
                    });
                }
                Kind::Resume => {
                    let req = ResumeRequest::parse(&mut f)?;
                    debug!(id = %req.id, "resume request");
                    let sessions = self.sessions.clone();
                    let sink = sink.clone();
                    let maxlen = self.max_retrieve_len;
                    pending.spawn(async move {
                        let (c, rsp) = sessions.resume(req, maxlen).await;
                        if let Err(e) = sink.write(&|p: &mut Pusher<'_>| rsp.build(c, p)).await {
                            debug!(id = %req.id, error = %e, "resume respond dropped");
                        } else {
                            debug!(id = %req.id, code = c, "resume responded");
                        }
                    });
                }
                Kind::Send => {
                    let req = SendRequest::parse(&mut f)?;
                    debug!(id = %req.id, len = req.payload.len(), "send request");
                    let (c, rsp) = self.sessions.send(&req).await;
                    if let Err(e) = sink.write(&|p: &mut Pusher<'_>| rsp.build(c, p)).await {
                        debug!(id = %req.id, error = %e, "send respond dropped");
                    } else {
                        debug!(id = %req.id, code = c, "send responded");
                    }
                }
                Kind::Close => {
                    let req = CloseRequest::parse(&mut f)?;
                    debug!(id = %req.id, "close request");
                    let (c, rsp) = self.sessions.close(&req).await;
                    sink.write(&|p: &mut Pusher<'_>| rsp.build(c, p)).await?;
                    debug!(id = %req.id, code = c, "close responded");
                }
            }
        }
    }
}
