//! Socket addressing.
//!
//! A resolved peer address. Equality is exact on the underlying socket
//! address bytes, which is what the UDP reachability probe relies on when it
//! matches an echoed datagram against the candidate it was sent to.

use std::fmt;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};

use crate::error::{Error, Result};

/// A resolved IPv4 or IPv6 peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    V4(SocketAddrV4),
    V6(SocketAddrV6),
}

impl Address {
    /// Resolve `host:port` into an address, preferring IPv4 results.
    pub fn resolve(host: &str, port: u16) -> Result<Self> {
        let mut v6 = None;
        for addr in (host, port)
            .to_socket_addrs()
            .map_err(|_| Error::AddressResolution(format!("{host}:{port}")))?
        {
            match addr {
                SocketAddr::V4(a) => return Ok(Address::V4(a)),
                SocketAddr::V6(a) => v6 = Some(Address::V6(a)),
            }
        }
        v6.ok_or_else(|| Error::AddressResolution(format!("{host}:{port}")))
    }

    /// Parse a `host:port` string, resolving the host part.
    pub fn parse(value: &str) -> Result<Self> {
        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| Error::AddressResolution(value.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::AddressResolution(value.to_string()))?;
        Self::resolve(host.trim_matches(['[', ']']), port)
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Address::V6(_))
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::V4(a) => a.port(),
            Address::V6(a) => a.port(),
        }
    }

    pub fn set_port(&mut self, port: u16) {
        match self {
            Address::V4(a) => a.set_port(port),
            Address::V6(a) => a.set_port(port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(a) => Address::V4(a),
            SocketAddr::V6(a) => Address::V6(a),
        }
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        match addr {
            Address::V4(a) => SocketAddr::V4(a),
            Address::V6(a) => SocketAddr::V6(a),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::V4(a) => write!(f, "{a}"),
            Address::V6(a) => write!(f, "{a}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_literal_ipv4() {
        let addr = Address::resolve("127.0.0.1", 5004).unwrap();
        assert!(!addr.is_ipv6());
        assert_eq!(addr.port(), 5004);
        assert_eq!(addr.to_string(), "127.0.0.1:5004");
    }

    #[test]
    fn parses_host_port_pair() {
        let addr = Address::parse("127.0.0.1:9000").unwrap();
        assert_eq!(addr, Address::resolve("127.0.0.1", 9000).unwrap());
    }

    #[test]
    fn equality_is_exact_on_address_and_port() {
        let a = Address::resolve("127.0.0.1", 1000).unwrap();
        let b = Address::resolve("127.0.0.1", 1001).unwrap();
        assert_ne!(a, b);
    }
}
