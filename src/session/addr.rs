//! Egress endpoint decoding for dial requests.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::protocol::{AddressType, ProtocolError};

/// A decoded egress destination. The transport (TCP or UDP) is chosen
/// by the address type, not by the endpoint itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Socket(SocketAddr),
    Host(String, u16),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Socket(sa) => write!(f, "{sa}"),
            Endpoint::Host(h, p) => write!(f, "{h}:{p}"),
        }
    }
}

pub(crate) fn build_endpoint(
    atyp: AddressType,
    addr: &[u8],
    port: u16,
) -> Result<Endpoint, ProtocolError> {
    match atyp {
        AddressType::TcpV4 | AddressType::UdpV4 => {
            let octets: [u8; 4] = addr.try_into().map_err(|_| ProtocolError::InvalidAddress)?;
            Ok(Endpoint::Socket(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(octets)),
                port,
            )))
        }
        AddressType::TcpV6 | AddressType::UdpV6 => {
            let octets: [u8; 16] = addr.try_into().map_err(|_| ProtocolError::InvalidAddress)?;
            Ok(Endpoint::Socket(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(octets)),
                port,
            )))
        }
        AddressType::TcpHost | AddressType::UdpHost => {
            let host =
                std::str::from_utf8(addr).map_err(|_| ProtocolError::InvalidAddress)?;
            if host.is_empty() {
                return Err(ProtocolError::InvalidAddress);
            }
            Ok(Endpoint::Host(host.to_string(), port))
        }
    }
}
