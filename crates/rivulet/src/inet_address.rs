//! IPv4 socket address value type
//!
//! Thin wrapper over `sockaddr_in`, convertible to and from an
//! "ip:port" string. IPv6 is outside the scope of this core.

use core::fmt;
use rivulet_core::error::{NetError, NetResult};
use std::net::Ipv4Addr;

#[derive(Clone, Copy)]
pub struct InetAddress {
    addr: libc::sockaddr_in,
}

impl InetAddress {
    /// Address from a dotted-quad string and port.
    pub fn new(ip: &str, port: u16) -> NetResult<Self> {
        let parsed: Ipv4Addr = ip
            .parse()
            .map_err(|_| NetError::BadAddress(ip.to_string()))?;
        Ok(Self::from_parts(parsed, port))
    }

    /// Wildcard address (0.0.0.0) on the given port.
    pub fn any(port: u16) -> Self {
        Self::from_parts(Ipv4Addr::UNSPECIFIED, port)
    }

    /// Loopback address on the given port.
    pub fn loopback(port: u16) -> Self {
        Self::from_parts(Ipv4Addr::LOCALHOST, port)
    }

    fn from_parts(ip: Ipv4Addr, port: u16) -> Self {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = u32::from(ip).to_be();
        InetAddress { addr }
    }

    pub(crate) fn from_raw(addr: libc::sockaddr_in) -> Self {
        InetAddress { addr }
    }

    pub(crate) fn raw(&self) -> &libc::sockaddr_in {
        &self.addr
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from_be(self.addr.sin_addr.s_addr))
    }

    pub fn port(&self) -> u16 {
        u16::from_be(self.addr.sin_port)
    }

    pub fn ip_port(&self) -> String {
        format!("{}:{}", self.ip(), self.port())
    }
}

impl fmt::Debug for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InetAddress({})", self.ip_port())
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ip_port())
    }
}

impl PartialEq for InetAddress {
    fn eq(&self, other: &Self) -> bool {
        self.addr.sin_addr.s_addr == other.addr.sin_addr.s_addr
            && self.addr.sin_port == other.addr.sin_port
    }
}

impl Eq for InetAddress {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format() {
        let a = InetAddress::new("127.0.0.1", 8000).unwrap();
        assert_eq!(a.ip(), Ipv4Addr::LOCALHOST);
        assert_eq!(a.port(), 8000);
        assert_eq!(a.ip_port(), "127.0.0.1:8000");
    }

    #[test]
    fn test_bad_address() {
        assert!(matches!(
            InetAddress::new("999.0.0.1", 80),
            Err(NetError::BadAddress(_))
        ));
        assert!(InetAddress::new("not-an-ip", 80).is_err());
    }

    #[test]
    fn test_any_and_loopback() {
        assert_eq!(InetAddress::any(80).ip_port(), "0.0.0.0:80");
        assert_eq!(InetAddress::loopback(80), InetAddress::new("127.0.0.1", 80).unwrap());
    }

    #[test]
    fn test_network_byte_order() {
        let a = InetAddress::new("1.2.3.4", 0x1234).unwrap();
        assert_eq!(a.raw().sin_port, 0x1234u16.to_be());
        assert_eq!(a.raw().sin_addr.s_addr, 0x0102_0304u32.to_be());
    }
}
