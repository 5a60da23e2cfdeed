//! Resume: the client has consumed the whole buffered read; the server
//! bumps the read epoch, discards the buffer and starts the next read.

use bytes::Bytes;

use super::{
    pack_type, read_id, read_u16, read_u64, write_u16, write_u64, Id, Kind, ProtocolError,
    RetrieveRequest, RetrieveRespond,
};
use crate::buf::{Fetcher, Pusher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeRequest {
    pub id: Id,
    pub rid: u64,
}

impl ResumeRequest {
    pub fn build(&self, p: &mut Pusher<'_>) -> Result<(), ProtocolError> {
        p.push_byte(pack_type(Kind::Resume, 0))?;
        p.push(&self.id.0)?;
        write_u64(p, self.rid)?;
        Ok(())
    }

    pub fn parse(f: &mut Fetcher<'_>) -> Result<Self, ProtocolError> {
        let id = read_id(f)?;
        let rid = read_u64(f)?;
        Ok(Self { id, rid })
    }

    /// The retrieve the server performs once the epoch has advanced.
    pub fn retrieve_request(&self) -> RetrieveRequest {
        RetrieveRequest {
            id: self.id,
            rid: self.rid,
            offset: 0,
        }
    }

    pub fn respond_from(&self, r: RetrieveRespond) -> ResumeRespond {
        ResumeRespond {
            id: self.id,
            new_rid: r.rid,
            total: r.total,
            payload: r.payload,
        }
    }
}

/// Same shape as a retrieve respond, but carries the advanced read
/// epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRespond {
    pub id: Id,
    pub new_rid: u64,
    pub total: u16,
    pub payload: Bytes,
}

impl ResumeRespond {
    pub fn build(&self, errcode: u8, p: &mut Pusher<'_>) -> Result<(), ProtocolError> {
        p.push_byte(pack_type(Kind::Resume, errcode))?;
        p.push(&self.id.0)?;
        write_u64(p, self.new_rid)?;
        write_u16(p, self.total)?;
        assert!(
            self.payload.len() <= u16::MAX as usize,
            "resume payload exceeds a u16 length"
        );
        write_u16(p, self.payload.len() as u16)?;
        p.push(&self.payload)?;
        Ok(())
    }

    pub fn parse(f: &mut Fetcher<'_>) -> Result<Self, ProtocolError> {
        let id = read_id(f)?;
        let new_rid = read_u64(f)?;
        let total = read_u16(f)?;
        let payload_len = read_u16(f)? as usize;
        let payload = Bytes::copy_from_slice(f.fetch(payload_len)?);
        Ok(Self {
            id,
            new_rid,
            total,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let req = ResumeRequest {
            id: Id([1u8; 32]),
            rid: 9,
        };
        let mut buf = [0u8; 64];
        let mut p = Pusher::new(&mut buf);
        req.build(&mut p).unwrap();

        let mut f = Fetcher::new(p.data());
        f.fetch(1).unwrap();
        assert_eq!(ResumeRequest::parse(&mut f).unwrap(), req);
    }

    #[test]
    fn respond_round_trip() {
        let rsp = ResumeRespond {
            id: Id([1u8; 32]),
            new_rid: 10,
            total: 64,
            payload: Bytes::from_static(b"fresh"),
        };
        let mut buf = [0u8; 128];
        let mut p = Pusher::new(&mut buf);
        rsp.build(0, &mut p).unwrap();

        let mut f = Fetcher::new(p.data());
        f.fetch(1).unwrap();
        assert_eq!(ResumeRespond::parse(&mut f).unwrap(), rsp);
    }
}
