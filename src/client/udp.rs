//! SOCKS5 UDP ASSOCIATE: one relay socket per association, one logical
//! connection per target address.
//!
//! Datagram fragments beyond the first are not supported and are
//! dropped, as is common practice. The association lives as long as
//! its TCP control connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::debug;

use super::requester::Requester;
use super::socks5::{
    udp_address_type, Socks5Request, ATYPE_DOMAIN, ATYPE_IPV4, ATYPE_IPV6, SOCKS_VERSION,
};
use super::ClientError;
use crate::protocol::Id;
use crate::session::Sink;

/// Distinct targets one association may speak to.
const MAX_UDP_TARGETS: usize = 12;

/// Datagrams queued per target while its tunnel send is in flight.
const TARGET_QUEUE: usize = 16;

/// Serve one UDP ASSOCIATE request. The control stream stays open for
/// the lifetime of the association.
pub(crate) async fn associate(
    mut control: TcpStream,
    _req: Socks5Request,
    requester: Arc<Requester>,
    max_retrieve_len: u16,
) -> Result<(), ClientError> {
    let local_ip = control.local_addr()?.ip();
    let socket = Arc::new(UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?);
    let bound = socket.local_addr()?;

    // Reply with the relay's bound address.
    let mut rsp = vec![SOCKS_VERSION, 0x00, 0x00];
    match bound.ip() {
        std::net::IpAddr::V4(ip) => {
            rsp.push(ATYPE_IPV4);
            rsp.extend_from_slice(&ip.octets());
        }
        std::net::IpAddr::V6(ip) => {
            rsp.push(ATYPE_IPV6);
            rsp.extend_from_slice(&ip.octets());
        }
    }
    rsp.extend_from_slice(&bound.port().to_be_bytes());
    control.write_all(&rsp).await?;

    let relay = tokio::spawn(relay_datagrams(socket, requester, max_retrieve_len));

    // The association ends when the client drops the control stream.
    let mut drain = [0u8; 64];
    loop {
        match control.read(&mut drain).await {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }
    relay.abort();
    Ok(())
}

async fn relay_datagrams(
    socket: Arc<UdpSocket>,
    requester: Arc<Requester>,
    max_retrieve_len: u16,
) {
    let mut targets: HashMap<Vec<u8>, mpsc::Sender<Bytes>> = HashMap::new();
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(_) => return,
        };
        let Some((key, atype, addr, port, payload)) = parse_datagram(&buf[..n]) else {
            continue;
        };
        if let Some(tx) = targets.get(&key) {
            if tx.try_send(Bytes::copy_from_slice(payload)).is_err() {
                debug!("udp datagram dropped, target queue full or gone");
            }
            continue;
        }
        if targets.len() >= MAX_UDP_TARGETS {
            debug!("udp datagram dropped, too many targets");
            continue;
        }
        let (tx, rx) = mpsc::channel(TARGET_QUEUE);
        targets.insert(key, tx);
        tokio::spawn(target_worker(
            requester.clone(),
            socket.clone(),
            from,
            udp_address_type(atype),
            addr,
            port,
            max_retrieve_len,
            Bytes::copy_from_slice(payload),
            rx,
        ));
    }
}

/// `[rsv u16][frag u8][atyp][addr][port][data]`; non-zero fragments
/// are unsupported.
fn parse_datagram(b: &[u8]) -> Option<(Vec<u8>, u8, Vec<u8>, u16, &[u8])> {
    if b.len() < 4 || b[2] != 0 {
        return None;
    }
    let atype = b[3];
    let (addr, rest) = match atype {
        ATYPE_IPV4 => (b.get(4..8)?.to_vec(), b.get(8..)?),
        ATYPE_IPV6 => (b.get(4..20)?.to_vec(), b.get(20..)?),
        ATYPE_DOMAIN => {
            let len = *b.get(4)? as usize;
            (b.get(5..5 + len)?.to_vec(), b.get(5 + len..)?)
        }
        _ => return None,
    };
    if rest.len() < 2 {
        return None;
    }
    let port = u16::from_be_bytes([rest[0], rest[1]]);
    let payload = &rest[2..];
    let mut key = Vec::with_capacity(addr.len() + 3);
    key.push(atype);
    key.extend_from_slice(&addr);
    key.extend_from_slice(&port.to_be_bytes());
    Some((key, atype, addr, port, payload))
}

struct UdpSinkInner {
    id: Id,
    requester: Arc<Requester>,
    socket: Arc<UdpSocket>,
    client: SocketAddr,
    header: Vec<u8>,
    closed: AtomicBool,
}

/// Writes retrieved bytes back to the SOCKS5 client with the RFC 1928
/// UDP header prepended.
#[derive(Clone)]
struct UdpReturnSink {
    inner: Arc<UdpSinkInner>,
}

#[async_trait]
impl Sink for UdpReturnSink {
    async fn dialed(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = inner.requester.retrieve(inner.id).await {
                    debug!(id = %inner.id, error = %e, "udp retrieve loop ended");
                    break;
                }
            }
            inner.closed.store(true, Ordering::Release);
        });
    }

    async fn retrieved(&self, data: &[u8]) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let mut datagram = Vec::with_capacity(self.inner.header.len() + data.len());
        datagram.extend_from_slice(&self.inner.header);
        datagram.extend_from_slice(data);
        if self
            .inner
            .socket
            .send_to(&datagram, self.inner.client)
            .await
            .is_err()
        {
            self.inner.closed.store(true, Ordering::Release);
        }
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

fn reply_header(atype: u8, addr: &[u8], port: u16) -> Vec<u8> {
    let mut header = vec![0, 0, 0, atype];
    if atype == ATYPE_DOMAIN {
        header.push(addr.len() as u8);
    }
    header.extend_from_slice(addr);
    header.extend_from_slice(&port.to_be_bytes());
    header
}

#[allow(clippy::too_many_arguments)]
async fn target_worker(
    requester: Arc<Requester>,
    socket: Arc<UdpSocket>,
    client: SocketAddr,
    atyp: crate::protocol::AddressType,
    addr: Vec<u8>,
    port: u16,
    max_retrieve_len: u16,
    first: Bytes,
    mut rx: mpsc::Receiver<Bytes>,
) {
    let header = reply_header(
        match atyp {
            crate::protocol::AddressType::UdpV4 => ATYPE_IPV4,
            crate::protocol::AddressType::UdpV6 => ATYPE_IPV6,
            _ => ATYPE_DOMAIN,
        },
        &addr,
        port,
    );

    let mut sink_slot: Option<UdpReturnSink> = None;
    let slot = &mut sink_slot;
    let build_requester = requester.clone();
    let dialed = requester
        .dial(
            atyp,
            Bytes::copy_from_slice(&addr),
            port,
            max_retrieve_len,
            first,
            move |id| {
                let sink = UdpReturnSink {
                    inner: Arc::new(UdpSinkInner {
                        id,
                        requester: build_requester,
                        socket,
                        client,
                        header,
                        closed: AtomicBool::new(false),
                    }),
                };
                *slot = Some(sink.clone());
                Arc::new(sink)
            },
        )
        .await;
    let (id, sink) = match (dialed, sink_slot) {
        (Ok((id, _)), Some(sink)) => (id, sink),
        (Err(e), _) => {
            debug!(error = %e, "udp dial through tunnel failed");
            return;
        }
        _ => return,
    };

    while let Some(payload) = rx.recv().await {
        if sink.inner.closed.load(Ordering::Acquire) {
            break;
        }
        let mut written = 0;
        let mut failed = false;
        while written < payload.len() {
            match requester.send(id, &payload[written..]).await {
                Ok(n) => written += n,
                Err(e) => {
                    debug!(id = %id, error = %e, "udp send failed");
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            break;
        }
    }
    sink.inner.closed.store(true, Ordering::Release);
    if let Err(e) = requester.close(id).await {
        debug!(id = %id, error = %e, "udp close failed");
    }
}
