//! Server-side session table: registration, retrieval arbitration,
//! idle expiry and teardown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::session::Session;
use super::{build_endpoint, resource_code_recoverable};
use crate::pool::Pool;
use crate::protocol::{
    code, dial_code, CloseRequest, CloseRespond, DialRequest, DialRespond, Id, ResumeRequest,
    ResumeRespond, RetrieveRequest, RetrieveRespond, SendRequest, SendRespond,
};
use crate::relay::{self, Relay};

/// How long the dial-carried first read waits before returning an
/// empty respond and letting the client poll.
const INITIAL_CONNECT_WAIT: Duration = Duration::from_millis(300);

pub struct Sessions {
    capacity: usize,
    idle_timeout: Duration,
    relay_config: relay::Config,
    pool: Arc<Pool>,
    inner: Mutex<HashMap<Id, Arc<Session>>>,
}

enum Registration {
    Rejected(u8),
    Redial(Arc<Session>),
    Fresh(Arc<Session>, Arc<dyn Relay>),
}

impl Sessions {
    pub fn new(
        capacity: usize,
        idle_timeout: Duration,
        relay_config: relay::Config,
        pool: Arc<Pool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            idle_timeout,
            relay_config,
            pool,
            inner: Mutex::new(HashMap::with_capacity(capacity)),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open an egress socket for a dial request and serve its first
    /// read. A repeated dial for an id whose first read never settled
    /// is answered by retrieving again; a settled one is AlreadyDialed.
    pub async fn register(&self, req: &DialRequest, max_resp_len: usize) -> (u8, DialRespond) {
        let registration = {
            let mut inner = self.inner.lock();
            if let Some(existing) = inner.get(&req.id) {
                if existing.rid() == 0 {
                    Registration::Redial(existing.clone())
                } else {
                    let rid = existing.rid();
                    return (
                        dial_code::ALREADY_DIALED,
                        req.respond(rid, 0, Bytes::new()),
                    );
                }
            } else if inner.len() >= self.capacity {
                Registration::Rejected(dial_code::OVER_CAPACITY)
            } else {
                match build_endpoint(req.atyp, &req.addr, req.port) {
                    Err(_) => Registration::Rejected(dial_code::INVALID_REQUEST),
                    Ok(endpoint) => {
                        let relay = relay::build_relay(req.atyp, endpoint);
                        let session = Arc::new(Session::new(
                            relay.clone(),
                            self.pool.clone(),
                            req.max_retrieve_len,
                            Instant::now() + self.idle_timeout,
                        ));
                        inner.insert(req.id, session.clone());
                        Registration::Fresh(session, relay)
                    }
                }
            }
        };

        match registration {
            Registration::Rejected(c) => (c, req.respond(0, 0, Bytes::new())),
            Registration::Redial(session) => {
                let (_, rsp) = self
                    .do_retrieve(&session, req.retrieve_request(), max_resp_len)
                    .await;
                (dial_code::SUCCESS, req.respond_from(rsp))
            }
            Registration::Fresh(session, relay) => {
                if let Err(e) = relay.connect(&self.relay_config).await {
                    debug!(id = %req.id, error = %e, "egress connect failed");
                    self.force_remove(req.id).await;
                    return (dial_code::UNREACHABLE, req.respond(0, 0, Bytes::new()));
                }
                if !req.request.is_empty() {
                    // The piggy-backed first payload goes out before the
                    // first read.
                    let _ = relay.send(&req.request).await;
                }
                let (_, rsp) = session
                    .retrieve(
                        req.retrieve_request(),
                        |_| code::SUCCESS,
                        INITIAL_CONNECT_WAIT,
                        max_resp_len,
                    )
                    .await;
                (dial_code::SUCCESS, req.respond_from(rsp))
            }
        }
    }

    async fn do_retrieve(
        &self,
        session: &Arc<Session>,
        req: RetrieveRequest,
        maxlen: usize,
    ) -> (u8, RetrieveRespond) {
        let (c, rsp) = session
            .retrieve(req, |_| code::SUCCESS, Duration::ZERO, maxlen)
            .await;
        if c != code::SUCCESS && !resource_code_recoverable(c) {
            self.force_remove(req.id).await;
        }
        (c, rsp)
    }

    fn lookup(&self, id: &Id) -> Option<Arc<Session>> {
        self.inner.lock().get(id).cloned()
    }

    pub async fn retrieve(&self, req: RetrieveRequest, maxlen: usize) -> (u8, RetrieveRespond) {
        let Some(session) = self.lookup(&req.id) else {
            return (code::NOT_FOUND, req.respond(0, 0, 0, Bytes::new()));
        };
        session.touch(self.idle_timeout);
        self.do_retrieve(&session, req, maxlen).await
    }

    pub async fn resume(&self, req: ResumeRequest, maxlen: usize) -> (u8, ResumeRespond) {
        let Some(session) = self.lookup(&req.id) else {
            let rsp = ResumeRespond {
                id: req.id,
                new_rid: 0,
                total: 0,
                payload: Bytes::new(),
            };
            return (code::NOT_FOUND, rsp);
        };
        session.touch(self.idle_timeout);
        let rid = req.rid;
        let (c, rsp) = session
            .retrieve(
                req.retrieve_request(),
                move |st| {
                    if rid != st.rid {
                        return code::EXPIRED;
                    }
                    if !st.rpaused {
                        return code::NOT_READY;
                    }
                    st.rid += 1;
                    st.rpaused = false;
                    code::SUCCESS
                },
                Duration::ZERO,
                maxlen,
            )
            .await;
        if c != code::SUCCESS && !resource_code_recoverable(c) {
            self.force_remove(req.id).await;
        }
        (c, req.respond_from(rsp))
    }

    pub async fn send(&self, req: &SendRequest) -> (u8, SendRespond) {
        let Some(session) = self.lookup(&req.id) else {
            return (code::NOT_FOUND, req.respond(0, 0));
        };
        session.send(req).await
    }

    /// Tear down a logical connection; idempotent at this end, and an
    /// unknown id still gets its response.
    pub async fn close(&self, req: &CloseRequest) -> (u8, CloseRespond) {
        let removed = self.inner.lock().remove(&req.id);
        match removed {
            None => (code::NOT_FOUND, req.respond()),
            Some(session) => {
                session.kill().await;
                (code::SUCCESS, req.respond())
            }
        }
    }

    async fn force_remove(&self, id: Id) {
        let removed = self.inner.lock().remove(&id);
        if let Some(session) = removed {
            session.kill().await;
        }
    }

    /// Reap sessions idle past their expiry. Run periodically.
    pub async fn recycle(&self) {
        let now = Instant::now();
        let expired: Vec<Arc<Session>> = {
            let mut inner = self.inner.lock();
            let ids: Vec<Id> = inner
                .iter()
                .filter(|(_, s)| s.expired(now))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| inner.remove(&id)).collect()
        };
        for session in expired {
            session.kill().await;
        }
    }

    pub async fn close_all(&self) {
        let all: Vec<Arc<Session>> = {
            let mut inner = self.inner.lock();
            inner.drain().map(|(_, s)| s).collect()
        };
        for session in all {
            session.kill().await;
        }
    }
}
