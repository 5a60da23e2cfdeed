//! Client-side retriever table: one entry per logical connection,
//! tracking read/write epochs and at most one pending operation per
//! phase (dial, read, write, close).

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::SessionError;
use crate::buf::Pusher;
use crate::crypto;
use crate::protocol::{
    code, CloseRequest, CloseRespond, DialRequest, DialRespond, Id, ResumeRequest, ResumeRespond,
    RetrieveRequest, RetrieveRespond, SendHeader, SendRespond,
};

/// The hosted socket behind a logical connection, as seen by the table.
/// The sink keeps the logical id, never a pointer back into the table.
#[async_trait]
pub trait Sink: Send + Sync {
    /// The logical connection reached the established state.
    async fn dialed(&self);

    /// Deliver bytes retrieved from the peer.
    async fn retrieved(&self, data: &[u8]);

    /// Tear down the hosted socket. Must be idempotent.
    async fn close(&self);
}

impl std::fmt::Debug for dyn Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Sink")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Dial,
    Read,
    Write,
    Close,
}

type UnitTx = oneshot::Sender<Result<(), SessionError>>;
type SentTx = oneshot::Sender<Result<u16, SessionError>>;

struct Entry {
    sink: Arc<dyn Sink>,
    dial: Option<UnitTx>,
    read: Option<UnitTx>,
    write: Option<SentTx>,
    close: Option<UnitTx>,
    rid: u64,
    roffset: u16,
    rtotal: u16,
    wid: u64,
}

impl Entry {
    fn new(sink: Arc<dyn Sink>) -> Self {
        Self {
            sink,
            dial: None,
            read: None,
            write: None,
            close: None,
            rid: 0,
            roffset: 0,
            rtotal: 0,
            wid: 0,
        }
    }

    fn settle(&mut self, phase: Phase, e: SessionError) -> bool {
        match phase {
            Phase::Dial => self.dial.take().map(|tx| drop(tx.send(Err(e)))).is_some(),
            Phase::Read => self.read.take().map(|tx| drop(tx.send(Err(e)))).is_some(),
            Phase::Write => self.write.take().map(|tx| drop(tx.send(Err(e)))).is_some(),
            Phase::Close => self.close.take().map(|tx| drop(tx.send(Err(e)))).is_some(),
        }
    }

    /// Fail every pending phase and hand the sink back for closing.
    fn release(mut self) -> Arc<dyn Sink> {
        self.settle(Phase::Dial, SessionError::Closed);
        self.settle(Phase::Read, SessionError::Closed);
        self.settle(Phase::Write, SessionError::Closed);
        self.settle(Phase::Close, SessionError::Closed);
        self.sink
    }
}

/// Idempotent cancellation handle for one pending fragment. Settling
/// after the real response already resolved the slot is a no-op.
#[derive(Clone)]
#[derive(Debug)]
pub struct Cancel {
    table: Weak<Retrievers>,
    id: Id,
    phase: Phase,
}

impl Cancel {
    pub fn settle(&self, e: SessionError) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut inner = table.inner.lock();
        if let Some(entry) = inner.get_mut(&self.id) {
            entry.settle(self.phase, e);
        }
    }
}

/// The cancels a batch worker holds for its currently buffered turn,
/// keyed by logical id. Emptied when the turn resolves.
#[derive(Default)]
pub struct Cancels {
    map: HashMap<Id, Cancel>,
}

impl Cancels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: Id, c: Cancel) {
        self.map.insert(id, c);
    }

    pub fn remove(&mut self, id: &Id) {
        self.map.remove(id);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Settle every fragment that did not get a response in this turn.
    pub fn settle_all(&mut self, e: SessionError) {
        for (_, c) in self.map.drain() {
            c.settle(e);
        }
    }
}

/// One pending operation: the completion receiver stays with the
/// caller, the cancel travels with the serialized fragment.
#[derive(Debug)]
pub struct PendingOp<T> {
    pub rx: oneshot::Receiver<Result<T, SessionError>>,
    pub cancel: Cancel,
}

impl<T> PendingOp<T> {
    /// Await the matching response (or a cancel settling the slot).
    pub async fn wait(self) -> Result<T, SessionError> {
        match self.rx.await {
            Ok(r) => r,
            Err(_) => Err(SessionError::Closed),
        }
    }
}

/// The retriever table. Completion paths run with the table lock
/// released; non-recoverable errors tear the entry down immediately.
pub struct Retrievers {
    capacity: usize,
    inner: Mutex<HashMap<Id, Entry>>,
}

impl Retrievers {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            inner: Mutex::new(HashMap::with_capacity(capacity)),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fresh_id(inner: &HashMap<Id, Entry>) -> Result<Id, SessionError> {
        const RETRIES: usize = 1000;
        for _ in 0..RETRIES {
            let mut id = [0u8; crate::protocol::ID_SIZE];
            crypto::random_bytes(&mut id).map_err(|_| SessionError::IdExhausted)?;
            let id = Id(id);
            if !inner.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(SessionError::IdExhausted)
    }

    fn remove_release(inner: &mut HashMap<Id, Entry>, id: Id) -> Option<Arc<dyn Sink>> {
        inner.remove(&id).map(Entry::release)
    }

    fn cancel_for(self: &Arc<Self>, id: Id, phase: Phase) -> Cancel {
        Cancel {
            table: Arc::downgrade(self),
            id,
            phase,
        }
    }

    /// Mint a fresh id and install a retriever under the capacity cap.
    pub fn reserve(
        &self,
        build: impl FnOnce(Id) -> Arc<dyn Sink>,
    ) -> Result<(Id, Arc<dyn Sink>), SessionError> {
        let mut inner = self.inner.lock();
        if inner.len() >= self.capacity {
            return Err(SessionError::RetrieversFull);
        }
        let id = Self::fresh_id(&inner)?;
        let sink = build(id);
        inner.insert(id, Entry::new(sink.clone()));
        Ok((id, sink))
    }

    /// Serialize a dial request into the turn buffer and arm the dial
    /// slot.
    pub fn register(
        self: &Arc<Self>,
        id: Id,
        req: &DialRequest,
        p: &mut Pusher<'_>,
    ) -> Result<PendingOp<()>, SessionError> {
        let mut inner = self.inner.lock();
        let entry = inner.get_mut(&id).ok_or(SessionError::Undefined)?;
        if entry.dial.is_some() {
            return Err(SessionError::Busy);
        }
        req.build(p).map_err(|_| SessionError::BuildFailed)?;
        let (tx, rx) = oneshot::channel();
        entry.dial = Some(tx);
        let cancel = self.cancel_for(id, Phase::Dial);
        Ok(PendingOp { rx, cancel })
    }

    /// Dispatch path for a dial respond.
    pub async fn registered(
        &self,
        errcode: u8,
        rsp: DialRespond,
        cancels: &mut Cancels,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.get_mut(&rsp.id) else {
            return Err(SessionError::Undefined);
        };
        let tx = match entry.dial.take() {
            Some(tx) => tx,
            None => {
                // A respond with no pending dial is a protocol breach;
                // the retriever cannot recover.
                let sink = Self::remove_release(&mut inner, rsp.id);
                drop(inner);
                if let Some(sink) = sink {
                    sink.close().await;
                }
                return Err(SessionError::NotReady);
            }
        };
        cancels.remove(&rsp.id);
        if errcode != 0 {
            let err = SessionError::from_dial_code(errcode);
            let sink = if err.try_again() {
                None
            } else {
                Self::remove_release(&mut inner, rsp.id)
            };
            drop(inner);
            let _ = tx.send(Err(err));
            if let Some(sink) = sink {
                sink.close().await;
            }
            return Err(err);
        }
        entry.rid = rsp.rid;
        entry.roffset = rsp.respond.len() as u16;
        entry.rtotal = rsp.total;
        let sink = entry.sink.clone();
        drop(inner);
        let _ = tx.send(Ok(()));
        sink.dialed().await;
        if !rsp.respond.is_empty() {
            sink.retrieved(&rsp.respond).await;
        }
        Ok(())
    }

    /// Serialize the next read request. The retriever's own epoch and
    /// offset decide between Retrieve and Resume: once the whole
    /// buffered read has been consumed, the next turn resumes.
    pub fn retrieve(
        self: &Arc<Self>,
        id: Id,
        p: &mut Pusher<'_>,
    ) -> Result<PendingOp<()>, SessionError> {
        let mut inner = self.inner.lock();
        let entry = inner.get_mut(&id).ok_or(SessionError::Undefined)?;
        if entry.read.is_some() {
            return Err(SessionError::Busy);
        }
        let built = if entry.roffset >= entry.rtotal {
            ResumeRequest { id, rid: entry.rid }.build(p)
        } else {
            RetrieveRequest {
                id,
                rid: entry.rid,
                offset: entry.roffset,
            }
            .build(p)
        };
        built.map_err(|_| SessionError::BuildFailed)?;
        let (tx, rx) = oneshot::channel();
        entry.read = Some(tx);
        let cancel = self.cancel_for(id, Phase::Read);
        Ok(PendingOp { rx, cancel })
    }

    /// Dispatch path for a retrieve respond.
    pub async fn retrieved(
        &self,
        errcode: u8,
        rsp: RetrieveRespond,
        cancels: &mut Cancels,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.get_mut(&rsp.id) else {
            return Err(SessionError::Undefined);
        };
        let tx = match entry.read.take() {
            Some(tx) => tx,
            None => {
                let sink = Self::remove_release(&mut inner, rsp.id);
                drop(inner);
                if let Some(sink) = sink {
                    sink.close().await;
                }
                return Err(SessionError::NotReady);
            }
        };
        cancels.remove(&rsp.id);
        if errcode != 0 {
            let err = SessionError::from_resource_code(errcode);
            let sink = if err.try_again() {
                None
            } else {
                Self::remove_release(&mut inner, rsp.id)
            };
            drop(inner);
            let _ = tx.send(Err(err));
            if let Some(sink) = sink {
                sink.close().await;
            }
            return Err(err);
        }
        if entry.rid > rsp.rid || rsp.offset < entry.roffset {
            // A stale retry from another worker; state stays intact.
            drop(inner);
            let _ = tx.send(Err(SessionError::RetrieveRespondRetry));
            return Err(SessionError::RetrieveRespondRetry);
        }
        entry.roffset = rsp.offset + rsp.payload.len() as u16;
        entry.rtotal = rsp.total;
        let sink = entry.sink.clone();
        drop(inner);
        let _ = tx.send(Ok(()));
        if !rsp.payload.is_empty() {
            sink.retrieved(&rsp.payload).await;
        }
        Ok(())
    }

    /// Dispatch path for a resume respond.
    pub async fn resumed(
        &self,
        errcode: u8,
        rsp: ResumeRespond,
        cancels: &mut Cancels,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.get_mut(&rsp.id) else {
            return Err(SessionError::Undefined);
        };
        let tx = match entry.read.take() {
            Some(tx) => tx,
            None => {
                let sink = Self::remove_release(&mut inner, rsp.id);
                drop(inner);
                if let Some(sink) = sink {
                    sink.close().await;
                }
                return Err(SessionError::NotReady);
            }
        };
        cancels.remove(&rsp.id);
        // An Expired respond that still advanced the epoch means the
        // resume took effect on a retried turn; treat it as delivered.
        if errcode != 0 && !(errcode == code::EXPIRED && rsp.new_rid == entry.rid + 1) {
            let err = SessionError::from_resource_code(errcode);
            let sink = if err.try_again() {
                None
            } else {
                Self::remove_release(&mut inner, rsp.id)
            };
            drop(inner);
            let _ = tx.send(Err(err));
            if let Some(sink) = sink {
                sink.close().await;
            }
            return Err(err);
        }
        if entry.rid >= rsp.new_rid {
            drop(inner);
            let _ = tx.send(Err(SessionError::ResumeRespondRetry));
            return Err(SessionError::ResumeRespondRetry);
        }
        entry.rid = rsp.new_rid;
        entry.roffset = rsp.payload.len() as u16;
        entry.rtotal = rsp.total;
        let sink = entry.sink.clone();
        drop(inner);
        let _ = tx.send(Ok(()));
        if !rsp.payload.is_empty() {
            sink.retrieved(&rsp.payload).await;
        }
        Ok(())
    }

    /// Serialize a send header into the turn buffer; the payload bytes
    /// are appended by the requester so it can measure capacity without
    /// copying them through here.
    pub fn send(
        self: &Arc<Self>,
        id: Id,
        payload_len: u16,
        p: &mut Pusher<'_>,
    ) -> Result<PendingOp<u16>, SessionError> {
        let mut inner = self.inner.lock();
        let entry = inner.get_mut(&id).ok_or(SessionError::Undefined)?;
        if entry.write.is_some() {
            return Err(SessionError::Busy);
        }
        SendHeader {
            id,
            wid: entry.wid,
            payload_len,
        }
        .build(p)
        .map_err(|_| SessionError::BuildFailed)?;
        let (tx, rx) = oneshot::channel();
        entry.write = Some(tx);
        let cancel = self.cancel_for(id, Phase::Write);
        Ok(PendingOp { rx, cancel })
    }

    /// Dispatch path for a send respond.
    pub async fn sent(
        &self,
        errcode: u8,
        rsp: SendRespond,
        cancels: &mut Cancels,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.get_mut(&rsp.id) else {
            return Err(SessionError::Undefined);
        };
        let tx = match entry.write.take() {
            Some(tx) => tx,
            None => {
                let sink = Self::remove_release(&mut inner, rsp.id);
                drop(inner);
                if let Some(sink) = sink {
                    sink.close().await;
                }
                return Err(SessionError::NotReady);
            }
        };
        cancels.remove(&rsp.id);
        if errcode == code::EXPIRED && rsp.new_wid == entry.wid + 1 {
            // The write epoch advanced on a turn we thought was lost;
            // adopt the bump and let the caller retry the payload.
            entry.wid = rsp.new_wid;
            drop(inner);
            let _ = tx.send(Err(SessionError::Expired));
            return Ok(());
        }
        if errcode != 0 {
            let err = SessionError::from_resource_code(errcode);
            let sink = if err.try_again() {
                None
            } else {
                Self::remove_release(&mut inner, rsp.id)
            };
            drop(inner);
            let _ = tx.send(Err(err));
            if let Some(sink) = sink {
                sink.close().await;
            }
            return Err(err);
        }
        if entry.wid >= rsp.new_wid {
            drop(inner);
            let _ = tx.send(Err(SessionError::SendRespondRetry));
            return Err(SessionError::SendRespondRetry);
        }
        entry.wid = rsp.new_wid;
        drop(inner);
        let _ = tx.send(Ok(rsp.sent));
        Ok(())
    }

    /// Serialize a close request. An unknown id still emits the
    /// request so the peer can release its state, but the pending op
    /// resolves immediately with `Undefined`.
    pub fn close(
        self: &Arc<Self>,
        id: Id,
        p: &mut Pusher<'_>,
    ) -> Result<PendingOp<()>, SessionError> {
        let mut inner = self.inner.lock();
        match inner.get_mut(&id) {
            None => {
                CloseRequest { id }
                    .build(p)
                    .map_err(|_| SessionError::BuildFailed)?;
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Err(SessionError::Undefined));
                let cancel = self.cancel_for(id, Phase::Close);
                Ok(PendingOp { rx, cancel })
            }
            Some(entry) => {
                if entry.close.is_some() {
                    return Err(SessionError::Busy);
                }
                CloseRequest { id }
                    .build(p)
                    .map_err(|_| SessionError::BuildFailed)?;
                let (tx, rx) = oneshot::channel();
                entry.close = Some(tx);
                let cancel = self.cancel_for(id, Phase::Close);
                Ok(PendingOp { rx, cancel })
            }
        }
    }

    /// Dispatch path for a close respond. The local state is destroyed
    /// regardless of the carried error code.
    pub async fn closed(
        &self,
        _errcode: u8,
        rsp: CloseRespond,
        cancels: &mut Cancels,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        let Some(mut entry) = inner.remove(&rsp.id) else {
            return Err(SessionError::Undefined);
        };
        cancels.remove(&rsp.id);
        let close_tx = entry.close.take();
        let sink = entry.release();
        drop(inner);
        if let Some(tx) = close_tx {
            let _ = tx.send(Ok(()));
        }
        sink.close().await;
        Ok(())
    }

    /// Remove an entry without a close round trip (dial failure
    /// cleanup); the caller closes the returned sink.
    pub fn release(&self, id: Id) -> Option<Arc<dyn Sink>> {
        Self::remove_release(&mut self.inner.lock(), id)
    }

    /// Tear down every retriever, failing all pending operations.
    pub async fn close_all(&self) {
        let sinks: Vec<Arc<dyn Sink>> = {
            let mut inner = self.inner.lock();
            let ids: Vec<Id> = inner.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| Self::remove_release(&mut inner, id))
                .collect()
        };
        for sink in sinks {
            sink.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use bytes::Bytes;

    use super::*;
    use crate::protocol::AddressType;

    #[derive(Default)]
    struct RecordingSink {
        dialed: AtomicBool,
        closed: AtomicBool,
        received: Mutex<Vec<u8>>,
        deliveries: AtomicUsize,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn dialed(&self) {
            self.dialed.store(true, Ordering::SeqCst);
        }

        async fn retrieved(&self, data: &[u8]) {
            self.received.lock().extend_from_slice(data);
            self.deliveries.fetch_add(1, Ordering::SeqCst);
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn reserve(table: &Arc<Retrievers>) -> (Id, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let moved = sink.clone();
        let moved: Arc<dyn Sink> = moved;
        let (id, _) = table.reserve(move |_| moved).unwrap();
        (id, sink)
    }

    fn dial_request(id: Id) -> DialRequest {
        DialRequest {
            id,
            atyp: AddressType::TcpV4,
            addr: Bytes::from_static(&[127, 0, 0, 1]),
            port: 80,
            max_retrieve_len: 1024,
            request: Bytes::new(),
        }
    }

    async fn establish(table: &Arc<Retrievers>, id: Id, rid: u64, total: u16) {
        let mut buf = [0u8; 512];
        let mut p = Pusher::new(&mut buf);
        let op = table.register(id, &dial_request(id), &mut p).unwrap();
        let mut cancels = Cancels::new();
        table
            .registered(
                0,
                DialRespond {
                    id,
                    rid,
                    total,
                    respond: Bytes::new(),
                },
                &mut cancels,
            )
            .await
            .unwrap();
        op.wait().await.unwrap();
    }

    #[tokio::test]
    async fn capacity_cap() {
        let table = Retrievers::new(1);
        let (_id, _sink) = reserve(&table);
        let sink: Arc<dyn Sink> = Arc::new(RecordingSink::default());
        assert_eq!(
            table.reserve(move |_| sink).unwrap_err(),
            SessionError::RetrieversFull
        );
    }

    #[tokio::test]
    async fn dial_respond_establishes_and_delivers() {
        let table = Retrievers::new(4);
        let (id, sink) = reserve(&table);

        let mut buf = [0u8; 512];
        let mut p = Pusher::new(&mut buf);
        let op = table.register(id, &dial_request(id), &mut p).unwrap();

        let mut cancels = Cancels::new();
        cancels.insert(id, op.cancel.clone());
        table
            .registered(
                0,
                DialRespond {
                    id,
                    rid: 1,
                    total: 5,
                    respond: Bytes::from_static(b"hello"),
                },
                &mut cancels,
            )
            .await
            .unwrap();

        assert!(cancels.is_empty());
        op.wait().await.unwrap();
        assert!(sink.dialed.load(Ordering::SeqCst));
        assert_eq!(&sink.received.lock()[..], b"hello");
    }

    #[tokio::test]
    async fn second_dial_on_same_phase_is_busy() {
        let table = Retrievers::new(4);
        let (id, _sink) = reserve(&table);
        let mut buf = [0u8; 512];
        let mut p = Pusher::new(&mut buf);
        let _op = table.register(id, &dial_request(id), &mut p).unwrap();
        let mut p2 = Pusher::new(&mut buf);
        assert_eq!(
            table.register(id, &dial_request(id), &mut p2).unwrap_err(),
            SessionError::Busy
        );
    }

    #[tokio::test]
    async fn stale_retrieve_respond_is_rejected_and_state_unchanged() {
        let table = Retrievers::new(4);
        let (id, sink) = reserve(&table);
        establish(&table, id, 5, 100).await;

        // The retriever now has rid 5, offset 0, total 100.
        let mut buf = [0u8; 64];
        let mut p = Pusher::new(&mut buf);
        let op = table.retrieve(id, &mut p).unwrap();

        let mut cancels = Cancels::new();
        let rejected = table
            .retrieved(
                0,
                RetrieveRespond {
                    id,
                    rid: 3,
                    total: 100,
                    offset: 0,
                    payload: Bytes::from_static(b"old"),
                },
                &mut cancels,
            )
            .await
            .unwrap_err();
        assert_eq!(rejected, SessionError::RetrieveRespondRetry);

        assert_eq!(
            op.wait().await.unwrap_err(),
            SessionError::RetrieveRespondRetry
        );
        // Nothing was delivered and the retriever is intact.
        assert!(sink.received.lock().is_empty());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn retrieve_advances_offset_and_switches_to_resume() {
        let table = Retrievers::new(4);
        let (id, sink) = reserve(&table);
        establish(&table, id, 1, 8).await;

        let mut buf = [0u8; 64];
        let mut p = Pusher::new(&mut buf);
        let op = table.retrieve(id, &mut p).unwrap();
        // offset 0 < total 8, so this serialized a Retrieve.
        assert_eq!(p.data()[0] >> 4, crate::protocol::Kind::Retrieve as u8);

        let mut cancels = Cancels::new();
        table
            .retrieved(
                0,
                RetrieveRespond {
                    id,
                    rid: 1,
                    total: 8,
                    offset: 0,
                    payload: Bytes::from_static(b"12345678"),
                },
                &mut cancels,
            )
            .await
            .unwrap();
        op.wait().await.unwrap();
        assert_eq!(&sink.received.lock()[..], b"12345678");

        // The whole read is consumed; the next turn must resume.
        let mut p2 = Pusher::new(&mut buf);
        let _op2 = table.retrieve(id, &mut p2).unwrap();
        assert_eq!(p2.data()[0] >> 4, crate::protocol::Kind::Resume as u8);
    }

    #[tokio::test]
    async fn expired_send_with_bumped_wid_is_adopted() {
        let table = Retrievers::new(4);
        let (id, _sink) = reserve(&table);
        establish(&table, id, 1, 0).await;

        // Advance wid to 2 through two successful sends.
        for next in [1u64, 2] {
            let mut buf = [0u8; 64];
            let mut p = Pusher::new(&mut buf);
            let op = table.send(id, 1, &mut p).unwrap();
            let mut cancels = Cancels::new();
            table
                .sent(
                    0,
                    SendRespond {
                        id,
                        new_wid: next,
                        sent: 1,
                    },
                    &mut cancels,
                )
                .await
                .unwrap();
            assert_eq!(op.wait().await.unwrap(), 1);
        }

        let mut buf = [0u8; 64];
        let mut p = Pusher::new(&mut buf);
        let op = table.send(id, 1, &mut p).unwrap();
        let mut cancels = Cancels::new();
        table
            .sent(
                code::EXPIRED,
                SendRespond {
                    id,
                    new_wid: 3,
                    sent: 0,
                },
                &mut cancels,
            )
            .await
            .unwrap();
        // The caller sees Expired (retryable) and the epoch advanced.
        assert_eq!(op.wait().await.unwrap_err(), SessionError::Expired);

        let mut p2 = Pusher::new(&mut buf);
        let op2 = table.send(id, 1, &mut p2).unwrap();
        let mut cancels = Cancels::new();
        table
            .sent(
                0,
                SendRespond {
                    id,
                    new_wid: 4,
                    sent: 1,
                },
                &mut cancels,
            )
            .await
            .unwrap();
        assert_eq!(op2.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn close_releases_everything_exactly_once() {
        let table = Retrievers::new(4);
        let (id, sink) = reserve(&table);
        establish(&table, id, 1, 0).await;

        let mut buf = [0u8; 64];
        let mut p = Pusher::new(&mut buf);
        let op = table.close(id, &mut p).unwrap();
        let mut cancels = Cancels::new();
        table
            .closed(0, CloseRespond { id }, &mut cancels)
            .await
            .unwrap();
        op.wait().await.unwrap();

        assert!(sink.closed.load(Ordering::SeqCst));
        assert!(table.is_empty());
        // A second close respond for the same id finds nothing.
        assert_eq!(
            table
                .closed(0, CloseRespond { id }, &mut cancels)
                .await
                .unwrap_err(),
            SessionError::Undefined
        );
    }

    #[tokio::test]
    async fn close_of_unknown_id_still_builds_request() {
        let table = Retrievers::new(4);
        let id = Id([1u8; 32]);
        let mut buf = [0u8; 64];
        let mut p = Pusher::new(&mut buf);
        let op = table.close(id, &mut p).unwrap();
        assert!(!p.is_empty());
        assert_eq!(op.wait().await.unwrap_err(), SessionError::Undefined);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_after_response() {
        let table = Retrievers::new(4);
        let (id, _sink) = reserve(&table);
        establish(&table, id, 1, 0).await;

        let mut buf = [0u8; 64];
        let mut p = Pusher::new(&mut buf);
        let op = table.send(id, 1, &mut p).unwrap();
        let cancel = op.cancel.clone();
        let mut cancels = Cancels::new();
        table
            .sent(
                0,
                SendRespond {
                    id,
                    new_wid: 1,
                    sent: 1,
                },
                &mut cancels,
            )
            .await
            .unwrap();
        // The slot already resolved; settling afterwards is a no-op.
        cancel.settle(SessionError::Unresponded);
        assert_eq!(op.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unresponded_batch_settles_cancels() {
        let table = Retrievers::new(4);
        let (id, _sink) = reserve(&table);
        establish(&table, id, 1, 0).await;

        let mut buf = [0u8; 64];
        let mut p = Pusher::new(&mut buf);
        let op = table.send(id, 1, &mut p).unwrap();
        let mut cancels = Cancels::new();
        cancels.insert(id, op.cancel.clone());
        cancels.settle_all(SessionError::Unresponded);
        assert_eq!(op.wait().await.unwrap_err(), SessionError::Unresponded);
    }

    #[tokio::test]
    async fn no_callbacks_after_close_round_trip() {
        let table = Retrievers::new(4);
        let (id, sink) = reserve(&table);
        establish(&table, id, 1, 0).await;

        let mut buf = [0u8; 64];
        let mut p = Pusher::new(&mut buf);
        let op = table.close(id, &mut p).unwrap();
        let mut cancels = Cancels::new();
        table
            .closed(0, CloseRespond { id }, &mut cancels)
            .await
            .unwrap();
        op.wait().await.unwrap();

        let deliveries = sink.deliveries.load(Ordering::SeqCst);
        // A late retrieve respond for the released id delivers nothing.
        let err = table
            .retrieved(
                0,
                RetrieveRespond {
                    id,
                    rid: 9,
                    total: 3,
                    offset: 0,
                    payload: Bytes::from_static(b"ghost"),
                },
                &mut cancels,
            )
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Undefined);
        assert_eq!(sink.deliveries.load(Ordering::SeqCst), deliveries);
    }
}
