//! Send: write a payload to the egress socket.

use bytes::Bytes;

use super::{
    pack_type, read_id, read_u16, read_u64, write_u16, write_u64, Id, Kind, ProtocolError,
};
use crate::buf::{Fetcher, Pusher};

/// The fixed part of a send request. Built separately so the requester
/// can place payload bytes after it without copying them through the
/// message struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendHeader {
    pub id: Id,
    pub wid: u64,
    pub payload_len: u16,
}

impl SendHeader {
    pub fn build(&self, p: &mut Pusher<'_>) -> Result<(), ProtocolError> {
        p.push_byte(pack_type(Kind::Send, 0))?;
        p.push(&self.id.0)?;
        write_u64(p, self.wid)?;
        write_u16(p, self.payload_len)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub id: Id,
    pub wid: u64,
    pub payload: Bytes,
}

impl SendRequest {
    pub fn header(&self) -> SendHeader {
        assert!(
            self.payload.len() <= u16::MAX as usize,
            "send payload exceeds a u16 length"
        );
        SendHeader {
            id: self.id,
            wid: self.wid,
            payload_len: self.payload.len() as u16,
        }
    }

    pub fn build(&self, p: &mut Pusher<'_>) -> Result<(), ProtocolError> {
        self.header().build(p)?;
        p.push(&self.payload)?;
        Ok(())
    }

    pub fn parse(f: &mut Fetcher<'_>) -> Result<Self, ProtocolError> {
        let id = read_id(f)?;
        let wid = read_u64(f)?;
        let payload_len = read_u16(f)? as usize;
        let payload = Bytes::copy_from_slice(f.fetch(payload_len)?);
        Ok(Self { id, wid, payload })
    }

    pub fn respond(&self, new_wid: u64, sent: u16) -> SendRespond {
        SendRespond {
            id: self.id,
            new_wid,
            sent,
        }
    }
}

/// `sent` reports the bytes actually written; the advanced write epoch
/// lets the client detect duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRespond {
    pub id: Id,
    pub new_wid: u64,
    pub sent: u16,
}

impl SendRespond {
    pub fn build(&self, errcode: u8, p: &mut Pusher<'_>) -> Result<(), ProtocolError> {
        p.push_byte(pack_type(Kind::Send, errcode))?;
        p.push(&self.id.0)?;
        write_u64(p, self.new_wid)?;
        write_u16(p, self.sent)?;
        Ok(())
    }

    pub fn parse(f: &mut Fetcher<'_>) -> Result<Self, ProtocolError> {
        let id = read_id(f)?;
        let new_wid = read_u64(f)?;
        let sent = read_u16(f)?;
        Ok(Self { id, new_wid, sent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let req = SendRequest {
            id: Id([8u8; 32]),
            wid: 3,
            payload: Bytes::from_static(b"Send"),
        };
        let mut buf = [0u8; 128];
        let mut p = Pusher::new(&mut buf);
        req.build(&mut p).unwrap();

        let mut f = Fetcher::new(p.data());
        f.fetch(1).unwrap();
        assert_eq!(SendRequest::parse(&mut f).unwrap(), req);
    }

    #[test]
    fn empty_payload_is_valid() {
        let req = SendRequest {
            id: Id::default(),
            wid: 0,
            payload: Bytes::new(),
        };
        let mut buf = [0u8; 64];
        let mut p = Pusher::new(&mut buf);
        req.build(&mut p).unwrap();

        let mut f = Fetcher::new(p.data());
        f.fetch(1).unwrap();
        let parsed = SendRequest::parse(&mut f).unwrap();
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn header_matches_full_build_prefix() {
        let req = SendRequest {
            id: Id([8u8; 32]),
            wid: 3,
            payload: Bytes::from_static(b"abc"),
        };
        let mut full = [0u8; 128];
        let mut p = Pusher::new(&mut full);
        req.build(&mut p).unwrap();
        let full_len = p.len();

        let mut head = [0u8; 64];
        let mut hp = Pusher::new(&mut head);
        req.header().build(&mut hp).unwrap();
        assert_eq!(hp.data(), &full[..full_len - 3]);
    }

    #[test]
    fn respond_round_trip() {
        let rsp = SendRespond {
            id: Id([8u8; 32]),
            new_wid: 4,
            sent: 4,
        };
        let mut buf = [0u8; 64];
        let mut p = Pusher::new(&mut buf);
        rsp.build(0, &mut p).unwrap();

        let mut f = Fetcher::new(p.data());
        f.fetch(1).unwrap();
        assert_eq!(SendRespond::parse(&mut f).unwrap(), rsp);
    }
}
