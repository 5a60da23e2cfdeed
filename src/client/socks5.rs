//! SOCKS5 front-end (RFC 1928): NO-AUTH and USER/PASS negotiation,
//! CONNECT and UDP ASSOCIATE.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Duration;
use tracing::debug;

use super::conn::TunnelConn;
use super::requester::Requester;
use super::udp;
use super::ClientError;
use crate::pool::Pool;
use crate::protocol::{AddressType, DIAL_SAFE_OVERHEAD_SIZE};
use crate::MAX_REQUEST_PAYLOAD_SIZE;

pub(crate) const SOCKS_VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERNAME_PASSWORD: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub(crate) const ATYPE_IPV4: u8 = 0x01;
pub(crate) const ATYPE_DOMAIN: u8 = 0x03;
pub(crate) const ATYPE_IPV6: u8 = 0x04;

/// How long to wait for request bytes to piggy-back onto the dial.
const INITIAL_READ_DELAY: Duration = Duration::from_millis(100);

/// The biggest initial payload that still fits one turn next to the
/// dial header.
pub(crate) const SAFE_INITIAL_SIZE: usize = MAX_REQUEST_PAYLOAD_SIZE - DIAL_SAFE_OVERHEAD_SIZE;

pub(crate) struct Socks5Request {
    pub cmd: u8,
    pub atype: u8,
    pub addr: Vec<u8>,
    pub port: u16,
}

pub(crate) fn tcp_address_type(atype: u8) -> AddressType {
    match atype {
        ATYPE_IPV4 => AddressType::TcpV4,
        ATYPE_IPV6 => AddressType::TcpV6,
        _ => AddressType::TcpHost,
    }
}

pub(crate) fn udp_address_type(atype: u8) -> AddressType {
    match atype {
        ATYPE_IPV4 => AddressType::UdpV4,
        ATYPE_IPV6 => AddressType::UdpV6,
        _ => AddressType::UdpHost,
    }
}

async fn read_address(stream: &mut TcpStream, atype: u8) -> Result<(Vec<u8>, u16), ClientError> {
    let len = match atype {
        ATYPE_IPV4 => 4,
        ATYPE_IPV6 => 16,
        ATYPE_DOMAIN => {
            let mut b = [0u8; 1];
            stream.read_exact(&mut b).await?;
            b[0] as usize
        }
        _ => return Err(ClientError::BadAddressType(atype)),
    };
    let mut addr = vec![0u8; len];
    stream.read_exact(&mut addr).await?;
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok((addr, u16::from_be_bytes(port)))
}

/// A v4 success/failure reply with a zero bind address.
pub(crate) fn reply(code: u8) -> [u8; 10] {
    [SOCKS_VERSION, code, 0, ATYPE_IPV4, 0, 0, 0, 0, 0, 0]
}

/// Negotiate the method (and credentials when configured), then read
/// the request.
pub(crate) async fn handshake(
    stream: &mut TcpStream,
    auth: Option<&(String, String)>,
) -> Result<Socks5Request, ClientError> {
    let mut buf = [0u8; 256];
    stream.read_exact(&mut buf[..2]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(ClientError::NoAuthMethod);
    }
    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;

    let method = if auth.is_some() {
        if buf[..nmethods].contains(&METHOD_USERNAME_PASSWORD) {
            METHOD_USERNAME_PASSWORD
        } else {
            METHOD_NO_ACCEPTABLE
        }
    } else if buf[..nmethods].contains(&METHOD_NO_AUTH) {
        METHOD_NO_AUTH
    } else {
        METHOD_NO_ACCEPTABLE
    };
    stream.write_all(&[SOCKS_VERSION, method]).await?;
    if method == METHOD_NO_ACCEPTABLE {
        return Err(ClientError::NoAuthMethod);
    }

    if method == METHOD_USERNAME_PASSWORD {
        let (expect_user, expect_pass) = match auth {
            Some(pair) => pair,
            None => return Err(ClientError::NoAuthMethod),
        };
        stream.read_exact(&mut buf[..2]).await?;
        let ulen = buf[1] as usize;
        stream.read_exact(&mut buf[..ulen]).await?;
        let username = String::from_utf8_lossy(&buf[..ulen]).to_string();
        stream.read_exact(&mut buf[..1]).await?;
        let plen = buf[0] as usize;
        stream.read_exact(&mut buf[..plen]).await?;
        let password = String::from_utf8_lossy(&buf[..plen]).to_string();

        let ok = username == *expect_user && password == *expect_pass;
        stream
            .write_all(&[0x01, if ok { 0x00 } else { 0x01 }])
            .await?;
        if !ok {
            return Err(ClientError::AuthFailed);
        }
    }

    stream.read_exact(&mut buf[..4]).await?;
    let cmd = buf[1];
    let atype = buf[3];
    let (addr, port) = read_address(stream, atype).await?;
    Ok(Socks5Request {
        cmd,
        atype,
        addr,
        port,
    })
}

/// Serve one accepted SOCKS5 client.
pub(crate) async fn serve(
    mut stream: TcpStream,
    auth: Option<&(String, String)>,
    handshake_timeout: Duration,
    requester: Arc<Requester>,
    pool: Arc<Pool>,
    max_retrieve_len: u16,
) -> Result<(), ClientError> {
    let req = match tokio::time::timeout(handshake_timeout, handshake(&mut stream, auth)).await {
        Ok(r) => r?,
        Err(_) => return Err(ClientError::HandshakeTimeout),
    };
    match req.cmd {
        CMD_CONNECT => connect(stream, req, requester, pool, max_retrieve_len).await,
        CMD_UDP_ASSOCIATE => udp::associate(stream, req, requester, max_retrieve_len).await,
        other => {
            let _ = stream.write_all(&reply(0x07)).await;
            Err(ClientError::UnsupportedCommand(other))
        }
    }
}

async fn connect(
    mut stream: TcpStream,
    req: Socks5Request,
    requester: Arc<Requester>,
    pool: Arc<Pool>,
    max_retrieve_len: u16,
) -> Result<(), ClientError> {
    // Reply before dialing; the dial round trip carries whatever the
    // client says first, avoiding an extra turn for protocols where
    // the client speaks first.
    stream.write_all(&reply(0x00)).await?;

    let mut initial = pool.get();
    let safe = SAFE_INITIAL_SIZE.min(initial.len());
    let read = tokio::time::timeout(INITIAL_READ_DELAY, stream.read(&mut initial[..safe])).await;
    let initial_len = match read {
        Ok(Ok(n)) => n,
        Ok(Err(_)) => {
            pool.put(initial);
            return Ok(());
        }
        Err(_) => 0,
    };
    let initial_bytes = Bytes::copy_from_slice(&initial[..initial_len]);
    pool.put(initial);

    let atyp = tcp_address_type(req.atype);
    let (reader, writer) = stream.into_split();

    let mut conn_slot: Option<TunnelConn> = None;
    let build_requester = requester.clone();
    let build_pool = pool.clone();
    let slot = &mut conn_slot;
    let dialed = requester
        .dial(
            atyp,
            Bytes::copy_from_slice(&req.addr),
            req.port,
            max_retrieve_len,
            initial_bytes,
            move |id| {
                let conn = TunnelConn::new(
                    id,
                    max_retrieve_len,
                    build_requester,
                    build_pool,
                    reader,
                    writer,
                );
                *slot = Some(conn.clone());
                Arc::new(conn)
            },
        )
        .await;
    if let Err(e) = dialed {
        debug!(error = %e, "dial through tunnel failed");
        return Err(ClientError::Session(e));
    }
    match conn_slot {
        Some(conn) => conn.serve().await.map_err(ClientError::Session),
        None => Ok(()),
    }
}
