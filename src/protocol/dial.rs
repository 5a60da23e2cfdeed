//! Dial: open an egress socket and piggy-back the first payload and the
//! first read on the same round trip.

use bytes::Bytes;

use super::{
    pack_type, read_id, read_u16, read_u64, write_u16, write_u64, AddressType, Id, Kind,
    ProtocolError,
};
use crate::buf::{Fetcher, Pusher};

/// Opens an egress connection for `(atyp, addr, port)`. `request` is an
/// initial payload written immediately after connect, saving one round
/// trip; `max_retrieve_len` caps the per-turn read size for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRequest {
    pub id: Id,
    pub atyp: AddressType,
    pub addr: Bytes,
    pub port: u16,
    pub max_retrieve_len: u16,
    pub request: Bytes,
}

impl DialRequest {
    pub fn build(&self, p: &mut Pusher<'_>) -> Result<(), ProtocolError> {
        p.push_byte(pack_type(Kind::Dial, self.atyp as u8))?;
        p.push(&self.id.0)?;
        match self.atyp {
            AddressType::TcpV4 | AddressType::UdpV4 => {
                if self.addr.len() != 4 {
                    return Err(ProtocolError::InvalidAddress);
                }
                p.push(&self.addr)?;
            }
            AddressType::TcpV6 | AddressType::UdpV6 => {
                if self.addr.len() != 16 {
                    return Err(ProtocolError::InvalidAddress);
                }
                p.push(&self.addr)?;
            }
            AddressType::TcpHost | AddressType::UdpHost => {
                if self.addr.len() > u8::MAX as usize {
                    return Err(ProtocolError::InvalidAddress);
                }
                p.push_byte(self.addr.len() as u8)?;
                p.push(&self.addr)?;
            }
        }
        write_u16(p, self.port)?;
        write_u16(p, self.max_retrieve_len)?;
        assert!(
            self.request.len() <= u16::MAX as usize,
            "dial request payload exceeds a u16 length"
        );
        write_u16(p, self.request.len() as u16)?;
        p.push(&self.request)?;
        Ok(())
    }

    /// Parse the fields following the header byte; `atyp` comes from the
    /// header's low nibble.
    pub fn parse(atyp: AddressType, f: &mut Fetcher<'_>) -> Result<Self, ProtocolError> {
        let id = read_id(f)?;
        let addr = match atyp {
            AddressType::TcpV4 | AddressType::UdpV4 => Bytes::copy_from_slice(f.fetch(4)?),
            AddressType::TcpV6 | AddressType::UdpV6 => Bytes::copy_from_slice(f.fetch(16)?),
            AddressType::TcpHost | AddressType::UdpHost => {
                let len = f.fetch(1)?[0] as usize;
                Bytes::copy_from_slice(f.fetch(len)?)
            }
        };
        let port = read_u16(f)?;
        let max_retrieve_len = read_u16(f)?;
        let request_len = read_u16(f)? as usize;
        let request = Bytes::copy_from_slice(f.fetch(request_len)?);
        Ok(Self {
            id,
            atyp,
            addr,
            port,
            max_retrieve_len,
            request,
        })
    }

    pub fn respond(&self, rid: u64, total: u16, respond: Bytes) -> DialRespond {
        DialRespond {
            id: self.id,
            rid,
            total,
            respond,
        }
    }

    /// The synthetic first retrieve issued while dialing.
    pub fn retrieve_request(&self) -> super::RetrieveRequest {
        super::RetrieveRequest {
            id: self.id,
            rid: 0,
            offset: 0,
        }
    }

    /// Pack the first retrieve's result into the dial respond.
    pub fn respond_from(&self, r: super::RetrieveRespond) -> DialRespond {
        self.respond(r.rid, r.total, r.payload)
    }
}

/// Carries the first read of up to `max_retrieve_len` bytes plus that
/// read's total size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRespond {
    pub id: Id,
    pub rid: u64,
    pub total: u16,
    pub respond: Bytes,
}

impl DialRespond {
    pub fn build(&self, errcode: u8, p: &mut Pusher<'_>) -> Result<(), ProtocolError> {
        p.push_byte(pack_type(Kind::Dial, errcode))?;
        p.push(&self.id.0)?;
        write_u64(p, self.rid)?;
        write_u16(p, self.total)?;
        assert!(
            self.respond.len() <= u16::MAX as usize,
            "dial respond payload exceeds a u16 length"
        );
        write_u16(p, self.respond.len() as u16)?;
        p.push(&self.respond)?;
        Ok(())
    }

    pub fn parse(f: &mut Fetcher<'_>) -> Result<Self, ProtocolError> {
        let id = read_id(f)?;
        let rid = read_u64(f)?;
        let total = read_u16(f)?;
        let respond_len = read_u16(f)? as usize;
        let respond = Bytes::copy_from_slice(f.fetch(respond_len)?);
        Ok(Self {
            id,
            rid,
            total,
            respond,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(req: &DialRequest) -> DialRequest {
        let mut buf = [0u8; 1024];
        let mut p = Pusher::new(&mut buf);
        req.build(&mut p).unwrap();

        let mut f = Fetcher::new(p.data());
        let (kind, data) = super::super::unpack_type(f.fetch(1).unwrap()[0]);
        assert_eq!(Kind::try_from(kind).unwrap(), Kind::Dial);
        DialRequest::parse(AddressType::try_from(data).unwrap(), &mut f).unwrap()
    }

    #[test]
    fn request_round_trip_host() {
        let req = DialRequest {
            id: Id([9u8; 32]),
            atyp: AddressType::TcpHost,
            addr: Bytes::from_static(b"example.com"),
            port: 443,
            max_retrieve_len: 4096,
            request: Bytes::from_static(b"Test"),
        };
        assert_eq!(round_trip(&req), req);
    }

    #[test]
    fn request_round_trip_v4_udp() {
        let req = DialRequest {
            id: Id([0u8; 32]),
            atyp: AddressType::UdpV4,
            addr: Bytes::from_static(&[127, 0, 0, 1]),
            port: 53,
            max_retrieve_len: 512,
            request: Bytes::new(),
        };
        assert_eq!(round_trip(&req), req);
    }

    #[test]
    fn bad_address_length_rejected() {
        let req = DialRequest {
            id: Id::default(),
            atyp: AddressType::TcpV4,
            addr: Bytes::from_static(&[1, 2, 3]),
            port: 80,
            max_retrieve_len: 16,
            request: Bytes::new(),
        };
        let mut buf = [0u8; 128];
        let mut p = Pusher::new(&mut buf);
        assert_eq!(req.build(&mut p), Err(ProtocolError::InvalidAddress));
    }

    #[test]
    fn respond_round_trip() {
        let rsp = DialRespond {
            id: Id([3u8; 32]),
            rid: 7,
            total: 1200,
            respond: Bytes::from_static(b"hello"),
        };
        let mut buf = [0u8; 128];
        let mut p = Pusher::new(&mut buf);
        rsp.build(0, &mut p).unwrap();

        let mut f = Fetcher::new(p.data());
        let (_, errcode) = super::super::unpack_type(f.fetch(1).unwrap()[0]);
        assert_eq!(errcode, 0);
        assert_eq!(DialRespond::parse(&mut f).unwrap(), rsp);
    }
}
