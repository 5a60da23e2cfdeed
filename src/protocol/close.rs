//! Close: tear down a logical connection. Idempotent at the
//! destination.

use super::{pack_type, read_id, Id, Kind, ProtocolError};
use crate::buf::{Fetcher, Pusher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseRequest {
    pub id: Id,
}

impl CloseRequest {
    pub fn build(&self, p: &mut Pusher<'_>) -> Result<(), ProtocolError> {
        p.push_byte(pack_type(Kind::Close, 0))?;
        p.push(&self.id.0)?;
        Ok(())
    }

    pub fn parse(f: &mut Fetcher<'_>) -> Result<Self, ProtocolError> {
        Ok(Self { id: read_id(f)? })
    }

    pub fn respond(&self) -> CloseRespond {
        CloseRespond { id: self.id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseRespond {
    pub id: Id,
}

impl CloseRespond {
    pub fn build(&self, errcode: u8, p: &mut Pusher<'_>) -> Result<(), ProtocolError> {
        p.push_byte(pack_type(Kind::Close, errcode))?;
        p.push(&self.id.0)?;
        Ok(())
    }

    pub fn parse(f: &mut Fetcher<'_>) -> Result<Self, ProtocolError> {
        Ok(Self { id: read_id(f)? })
    }
}
