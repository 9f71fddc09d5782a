//! 128-bit IP address representation used on the remote network interface.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Prefix used for IPv4 addresses mapped into IPv6 (`::ffff:0:0/96`), as
/// it sits inside the low 64 bits.
const V4_MAPPED_PREFIX: u64 = 0x0000_FFFF_0000_0000;

/// An IPv6-sized address split into two 64-bit halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpAddress {
    pub upper64: u64,
    pub lower64: u64,
}

impl IpAddress {
    /// Map an IPv4 address using the IPv4-mapped-in-IPv6 convention: upper
    /// 64 bits zero, the next 16 bits all ones, the low 32 bits the address.
    pub fn from_ipv4(addr: Ipv4Addr) -> Self {
        Self {
            upper64: 0,
            lower64: V4_MAPPED_PREFIX | u64::from(u32::from(addr)),
        }
    }

    /// The embedded IPv4 address, if this is an IPv4-mapped address.
    pub fn to_ipv4(&self) -> Option<Ipv4Addr> {
        if self.upper64 == 0 && self.lower64 & 0xFFFF_FFFF_0000_0000 == V4_MAPPED_PREFIX {
            Some(Ipv4Addr::from(self.lower64 as u32))
        } else {
            None
        }
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(addr: Ipv6Addr) -> Self {
        let bits = u128::from(addr);
        Self {
            upper64: (bits >> 64) as u64,
            lower64: bits as u64,
        }
    }
}

impl From<IpAddress> for Ipv6Addr {
    fn from(addr: IpAddress) -> Self {
        Ipv6Addr::from((u128::from(addr.upper64) << 64) | u128::from(addr.lower64))
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_ipv4() {
            Some(v4) => write!(f, "{v4}"),
            None => write!(f, "{}", Ipv6Addr::from(*self)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_mapping_layout() {
        let addr = IpAddress::from_ipv4(Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(addr.upper64, 0);
        assert_eq!(addr.lower64, 0x0000_FFFF_0A01_0203);
    }

    #[test]
    fn mapping_agrees_with_std() {
        let v4 = Ipv4Addr::new(192, 168, 7, 200);
        let ours = Ipv6Addr::from(IpAddress::from_ipv4(v4));
        assert_eq!(ours, v4.to_ipv6_mapped());
    }

    #[test]
    fn to_ipv4_rejects_native_v6() {
        let addr = IpAddress::from("2001:db8::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(addr.to_ipv4(), None);
        assert_eq!(addr.to_string(), "2001:db8::1");

        let mapped = IpAddress::from_ipv4(Ipv4Addr::LOCALHOST);
        assert_eq!(mapped.to_ipv4(), Some(Ipv4Addr::LOCALHOST));
        assert_eq!(mapped.to_string(), "127.0.0.1");
    }
}
