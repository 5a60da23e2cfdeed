//! One server-side session: a live outbound socket plus the read/write
//! epoch state machine that serves paused retrieval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::pool::Pool;
use crate::protocol::{code, RetrieveRequest, RetrieveRespond, SendRequest, SendRespond};
use crate::relay::Relay;

pub(in crate::session) struct State {
    pub expiry: Instant,
    pub rid: u64,
    pub rbusy: bool,
    pub read: Option<Vec<u8>>,
    pub read_len: u16,
    pub rpaused: bool,
    pub wid: u64,
    pub wbusy: bool,
    pub wlen: u16,
    pub closed: bool,
}

pub(in crate::session) struct Session {
    relay: Arc<dyn Relay>,
    pool: Arc<Pool>,
    max_retrieve_len: u16,
    pub(in crate::session) state: Mutex<State>,
}

impl Session {
    pub fn new(
        relay: Arc<dyn Relay>,
        pool: Arc<Pool>,
        max_retrieve_len: u16,
        expiry: Instant,
    ) -> Self {
        Self {
            relay,
            pool,
            max_retrieve_len,
            state: Mutex::new(State {
                expiry,
                rid: 0,
                rbusy: false,
                read: None,
                read_len: 0,
                rpaused: false,
                wid: 0,
                wbusy: false,
                wlen: 0,
                closed: false,
            }),
        }
    }

    pub fn rid(&self) -> u64 {
        self.state.lock().rid
    }

    pub fn touch(&self, idle: Duration) {
        self.state.lock().expiry = Instant::now() + idle;
    }

    pub fn expired(&self, now: Instant) -> bool {
        now > self.state.lock().expiry
    }

    /// Serve one retrieve turn. `precheck` runs under the state lock
    /// after the closed/busy/expired gates and may reject the turn or
    /// advance the epoch (the resume path does both).
    pub async fn retrieve(
        &self,
        req: RetrieveRequest,
        precheck: impl FnOnce(&mut State) -> u8,
        timeout: Duration,
        maxlen: usize,
    ) -> (u8, RetrieveRespond) {
        {
            let mut st = self.state.lock();
            if st.closed {
                let rsp = req.respond(st.rid, st.read_len, 0, Bytes::new());
                return (code::NOT_FOUND, rsp);
            }
            if st.rbusy {
                let rsp = req.respond(st.rid, st.read_len, 0, Bytes::new());
                return (code::NOT_READY, rsp);
            }
            if req.rid < st.rid {
                let rsp = req.respond(st.rid, st.read_len, 0, Bytes::new());
                return (code::EXPIRED, rsp);
            }
            let c = precheck(&mut st);
            if c != code::SUCCESS {
                let rsp = req.respond(st.rid, st.read_len, 0, Bytes::new());
                return (c, rsp);
            }
            if st.rpaused {
                let (total, offset, data) = self.slice_read(&st, req.offset, maxlen);
                let rsp = req.respond(st.rid, total, offset, data);
                return (code::SUCCESS, rsp);
            }
            st.rpaused = true;
            st.rbusy = true;
        }

        let mut buf = self.pool.get();
        let result = self.relay.retrieve(&mut buf, timeout).await;

        let mut st = self.state.lock();
        st.rbusy = false;
        match result {
            Ok(n) => {
                if let Some(old) = st.read.take() {
                    self.pool.put(old);
                }
                st.read_len = n as u16;
                st.read = Some(buf);
                let (total, offset, data) = self.slice_read(&st, req.offset, maxlen);
                let rsp = req.respond(st.rid, total, offset, data);
                (code::SUCCESS, rsp)
            }
            Err(e) => {
                self.pool.put(buf);
                if let Some(old) = st.read.take() {
                    self.pool.put(old);
                }
                st.read_len = 0;
                let rsp = req.respond(st.rid, 0, 0, Bytes::new());
                if e.is_timeout() {
                    // Nothing arrived in time; the client polls again.
                    (code::SUCCESS, rsp)
                } else {
                    (code::BROKEN, rsp)
                }
            }
        }
    }

    fn slice_read(&self, st: &State, offset: u16, maxlen: usize) -> (u16, u16, Bytes) {
        let start = offset.min(st.read_len);
        let take = usize::from(st.read_len - start)
            .min(usize::from(self.max_retrieve_len))
            .min(maxlen);
        let data = match &st.read {
            Some(read) => {
                Bytes::copy_from_slice(&read[usize::from(start)..usize::from(start) + take])
            }
            None => Bytes::new(),
        };
        (st.read_len, start, data)
    }

    /// Serve one send turn: write the payload to the relay and advance
    /// the write epoch on success.
    pub async fn send(&self, req: &SendRequest) -> (u8, SendRespond) {
        {
            let mut st = self.state.lock();
            if st.closed {
                return (code::NOT_FOUND, req.respond(st.wid, st.wlen));
            }
            if req.wid < st.wid {
                return (code::EXPIRED, req.respond(st.wid, st.wlen));
            }
            if st.wbusy {
                return (code::NOT_READY, req.respond(st.wid, st.wlen));
            }
            st.wbusy = true;
        }

        let result = self.relay.send(&req.payload).await;

        let mut st = self.state.lock();
        st.wbusy = false;
        match result {
            Err(_) => (code::SEND_FAILURE, req.respond(st.wid, st.wlen)),
            Ok(n) => {
                st.wid += 1;
                st.wlen = n as u16;
                (code::SUCCESS, req.respond(st.wid, st.wlen))
            }
        }
    }

    /// Mark closed and tear the relay down; later turns answer
    /// NotFound. Safe to call more than once.
    pub async fn kill(&self) {
        let already = {
            let mut st = self.state.lock();
            if st.closed {
                true
            } else {
                st.closed = true;
                if let Some(old) = st.read.take() {
                    self.pool.put(old);
                }
                st.read_len = 0;
                false
            }
        };
        if !already {
            self.relay.close().await;
        }
    }
}
