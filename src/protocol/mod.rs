//! Wire protocol: the five request/response message pairs and their
//! binary encoding.
//!
//! Every message starts with one packed header byte (high nibble: kind,
//! low nibble: address type for a dial request, error code otherwise)
//! followed by the 32-byte logical connection id. All integers are
//! big-endian.

mod close;
mod dial;
mod resume;
mod retrieve;
mod send;

pub use close::{CloseRequest, CloseRespond};
pub use dial::{DialRequest, DialRespond};
pub use resume::{ResumeRequest, ResumeRespond};
pub use retrieve::{RetrieveRequest, RetrieveRespond};
pub use send::{SendHeader, SendRequest, SendRespond};

use std::fmt;

use thiserror::Error;

use crate::buf::{BufError, Fetcher, Pusher};

/// Packed header byte.
pub const HEADER_SIZE: usize = 1;

/// Logical connection id length.
pub const ID_SIZE: usize = 32;

/// Upper bound of a serialized dial request minus its variable payload:
/// id, host length byte, longest host, port, max retrieve length and
/// request length.
pub const DIAL_SAFE_OVERHEAD_SIZE: usize = ID_SIZE + 1 + 255 + 2 + 2 + 2;

/// Room to reserve for the largest header a sub-response can carry.
pub const GREATEST_HEADER_SIZE: usize = DIAL_SAFE_OVERHEAD_SIZE * 2;

/// Fixed part of a retrieve request after the header byte.
pub const RETRIEVE_REQUEST_SIZE: usize = ID_SIZE + 8 + 2;

/// A full serialized retrieve request.
pub const RETRIEVE_REQUEST_OVERHEAD: usize = HEADER_SIZE + RETRIEVE_REQUEST_SIZE;

/// Fixed part of a send request after the header byte.
pub const SEND_HEADER_SIZE: usize = ID_SIZE + 8 + 2;

/// A full serialized send header, before the payload.
pub const SEND_HEADER_OVERHEAD: usize = HEADER_SIZE + SEND_HEADER_SIZE;

/// Resource error codes carried in the low nibble of session-layer
/// responses.
pub mod code {
    pub const SUCCESS: u8 = 0;
    pub const NOT_FOUND: u8 = 1;
    pub const NOT_READY: u8 = 2;
    pub const EXPIRED: u8 = 3;
    pub const BROKEN: u8 = 4;
    pub const CLOSED: u8 = 5;
    pub const SEND_FAILURE: u8 = 6;
    pub const UNKNOWN: u8 = 7;
}

/// Dial error codes, a separate enumeration from the resource codes.
pub mod dial_code {
    pub const SUCCESS: u8 = 0;
    pub const INVALID_REQUEST: u8 = 1;
    pub const UNREACHABLE: u8 = 2;
    pub const OVER_CAPACITY: u8 = 3;
    pub const ALREADY_DIALED: u8 = 4;
    pub const INTERNAL_FAILURE: u8 = 5;
}

/// Protocol level parse/build errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message truncated or over capacity: {0}")]
    Buf(#[from] BufError),

    #[error("invalid address")]
    InvalidAddress,

    #[error("unknown request type {0}")]
    UnknownType(u8),

    #[error("unknown address type {0}")]
    UnknownAddressType(u8),
}

/// A 32-byte logical connection identifier, minted by the client and
/// opaque to the server.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Id(pub [u8; ID_SIZE]);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

/// Message kinds, the high nibble of the header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    Dial = 0,
    Close = 1,
    Retrieve = 3,
    Resume = 4,
    Send = 5,
}

impl TryFrom<u8> for Kind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Kind::Dial),
            1 => Ok(Kind::Close),
            3 => Ok(Kind::Retrieve),
            4 => Ok(Kind::Resume),
            5 => Ok(Kind::Send),
            _ => Err(ProtocolError::UnknownType(value)),
        }
    }
}

/// Address variants for a dial request; the variant selects both the
/// address field encoding and the transport used at the egress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    TcpV4 = 0,
    TcpV6 = 1,
    TcpHost = 2,
    UdpV4 = 3,
    UdpV6 = 4,
    UdpHost = 5,
}

impl AddressType {
    pub fn is_tcp(self) -> bool {
        matches!(
            self,
            AddressType::TcpV4 | AddressType::TcpV6 | AddressType::TcpHost
        )
    }
}

impl TryFrom<u8> for AddressType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AddressType::TcpV4),
            1 => Ok(AddressType::TcpV6),
            2 => Ok(AddressType::TcpHost),
            3 => Ok(AddressType::UdpV4),
            4 => Ok(AddressType::UdpV6),
            5 => Ok(AddressType::UdpHost),
            _ => Err(ProtocolError::UnknownAddressType(value)),
        }
    }
}

/// Pack a message kind and its 4-bit data field into the header byte.
/// Panics when `data` overflows the nibble (a framing contract
/// violation).
pub fn pack_type(kind: Kind, data: u8) -> u8 {
    assert!(data <= 15, "header data nibble overflow");
    (kind as u8) << 4 | data
}

/// Split a header byte into (kind nibble, data nibble).
pub fn unpack_type(b: u8) -> (u8, u8) {
    (b >> 4, b & 15)
}

pub(crate) fn write_u16(p: &mut Pusher<'_>, v: u16) -> Result<(), BufError> {
    p.push(&v.to_be_bytes())
}

pub(crate) fn write_u64(p: &mut Pusher<'_>, v: u64) -> Result<(), BufError> {
    p.push(&v.to_be_bytes())
}

pub(crate) fn read_u16(f: &mut Fetcher<'_>) -> Result<u16, BufError> {
    let b = f.fetch(2)?;
    Ok(u16::from_be_bytes([b[0], b[1]]))
}

pub(crate) fn read_u64(f: &mut Fetcher<'_>) -> Result<u64, BufError> {
    let b = f.fetch(8)?;
    let mut v = [0u8; 8];
    v.copy_from_slice(b);
    Ok(u64::from_be_bytes(v))
}

pub(crate) fn read_id(f: &mut Fetcher<'_>) -> Result<Id, BufError> {
    let b = f.fetch(ID_SIZE)?;
    let mut id = [0u8; ID_SIZE];
    id.copy_from_slice(b);
    Ok(Id(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u16_round_trip() {
        let mut buf = [0u8; 2];
        let mut p = Pusher::new(&mut buf);
        write_u16(&mut p, 12345).unwrap();
        assert_eq!(read_u16(&mut Fetcher::new(&buf)).unwrap(), 12345);
    }

    #[test]
    fn u64_round_trip() {
        let mut buf = [0u8; 8];
        let mut p = Pusher::new(&mut buf);
        write_u64(&mut p, 123456789).unwrap();
        assert_eq!(read_u64(&mut Fetcher::new(&buf)).unwrap(), 123456789);
    }

    #[test]
    fn header_byte_packing() {
        let b = pack_type(Kind::Send, 3);
        let (kind, data) = unpack_type(b);
        assert_eq!(Kind::try_from(kind).unwrap(), Kind::Send);
        assert_eq!(data, 3);
    }

    #[test]
    fn unknown_kind_rejected() {
        assert_eq!(Kind::try_from(2), Err(ProtocolError::UnknownType(2)));
        assert_eq!(Kind::try_from(9), Err(ProtocolError::UnknownType(9)));
    }

    #[test]
    fn address_type_tcp_udp_split() {
        assert!(AddressType::TcpHost.is_tcp());
        assert!(!AddressType::UdpV4.is_tcp());
        assert_eq!(
            AddressType::try_from(6),
            Err(ProtocolError::UnknownAddressType(6))
        );
    }
}
