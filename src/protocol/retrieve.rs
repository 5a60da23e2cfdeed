//! Retrieve: partial reads over the chunk currently buffered by the
//! server session.

use bytes::Bytes;

use super::{
    pack_type, read_id, read_u16, read_u64, write_u16, write_u64, Id, Kind, ProtocolError,
};
use crate::buf::{Fetcher, Pusher};

/// Fetch more of the buffered read, starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrieveRequest {
    pub id: Id,
    pub rid: u64,
    pub offset: u16,
}

impl RetrieveRequest {
    pub fn build(&self, p: &mut Pusher<'_>) -> Result<(), ProtocolError> {
        p.push_byte(pack_type(Kind::Retrieve, 0))?;
        p.push(&self.id.0)?;
        write_u64(p, self.rid)?;
        write_u16(p, self.offset)?;
        Ok(())
    }

    pub fn parse(f: &mut Fetcher<'_>) -> Result<Self, ProtocolError> {
        let id = read_id(f)?;
        let rid = read_u64(f)?;
        let offset = read_u16(f)?;
        Ok(Self { id, rid, offset })
    }

    pub fn respond(&self, rid: u64, total: u16, offset: u16, payload: Bytes) -> RetrieveRespond {
        RetrieveRespond {
            id: self.id,
            rid,
            total,
            offset,
            payload,
        }
    }
}

/// A slice of the buffered read. The server may answer with a subset of
/// what remains; the client concatenates slices up to `total`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveRespond {
    pub id: Id,
    pub rid: u64,
    pub total: u16,
    pub offset: u16,
    pub payload: Bytes,
}

impl RetrieveRespond {
    pub fn build(&self, errcode: u8, p: &mut Pusher<'_>) -> Result<(), ProtocolError> {
        p.push_byte(pack_type(Kind::Retrieve, errcode))?;
        p.push(&self.id.0)?;
        write_u64(p, self.rid)?;
        write_u16(p, self.total)?;
        write_u16(p, self.offset)?;
        assert!(
            self.payload.len() <= u16::MAX as usize,
            "retrieve payload exceeds a u16 length"
        );
        write_u16(p, self.payload.len() as u16)?;
        p.push(&self.payload)?;
        Ok(())
    }

    pub fn parse(f: &mut Fetcher<'_>) -> Result<Self, ProtocolError> {
        let id = read_id(f)?;
        let rid = read_u64(f)?;
        let total = read_u16(f)?;
        let offset = read_u16(f)?;
        let payload_len = read_u16(f)? as usize;
        let payload = Bytes::copy_from_slice(f.fetch(payload_len)?);
        Ok(Self {
            id,
            rid,
            total,
            offset,
            payload,
        })
    }
}
