//! Address and port matchers used by the filter engine.

use std::net::Ipv4Addr;

/// IPv4 CIDR range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    addr: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            addr: Self::network_addr(addr, prefix_len),
            prefix_len,
        }
    }

    /// Parses `"192.168.1.0/24"` or a bare address (treated as /32).
    pub fn parse(s: &str) -> Option<Self> {
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: Ipv4Addr = addr.parse().ok()?;
                let prefix_len: u8 = prefix.parse().ok()?;
                if prefix_len > 32 {
                    return None;
                }
                Some(Self::new(addr, prefix_len))
            }
            None => {
                let addr: Ipv4Addr = s.parse().ok()?;
                Some(Self::new(addr, 32))
            }
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = Self::prefix_to_mask(self.prefix_len);
        (u32::from(self.addr) & mask) == (u32::from(addr) & mask)
    }

    fn network_addr(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(addr) & Self::prefix_to_mask(prefix_len))
    }

    fn prefix_to_mask(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            !0u32 << (32 - prefix_len)
        }
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn single(port: u16) -> Self {
        Self::new(port, port)
    }

    /// Parses `"80"` or `"1024-65535"`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.split_once('-') {
            Some((start, end)) => {
                let start: u16 = start.parse().ok()?;
                let end: u16 = end.parse().ok()?;
                if end < start {
                    return None;
                }
                Some(Self::new(start, end))
            }
            None => Some(Self::single(s.parse().ok()?)),
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_parse_and_contains() {
        let cidr = Ipv4Cidr::parse("192.168.1.0/24").unwrap();
        assert!(cidr.contains(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(cidr.contains(Ipv4Addr::new(192, 168, 1, 254)));
        assert!(!cidr.contains(Ipv4Addr::new(192, 168, 2, 1)));
    }

    #[test]
    fn test_cidr_edge_prefixes() {
        // /32 matches only the exact address.
        let host = Ipv4Cidr::parse("10.0.0.1/32").unwrap();
        assert!(host.contains(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!host.contains(Ipv4Addr::new(10, 0, 0, 2)));

        // /0 matches everything.
        let any = Ipv4Cidr::parse("0.0.0.0/0").unwrap();
        assert!(any.contains(Ipv4Addr::new(1, 2, 3, 4)));
        assert!(any.contains(Ipv4Addr::new(255, 255, 255, 255)));
    }

    #[test]
    fn test_cidr_bare_address_is_exact() {
        let cidr = Ipv4Cidr::parse("10.1.2.3").unwrap();
        assert!(cidr.contains(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!cidr.contains(Ipv4Addr::new(10, 1, 2, 4)));
    }

    #[test]
    fn test_cidr_rejects_garbage() {
        assert!(Ipv4Cidr::parse("10.0.0.0/33").is_none());
        assert!(Ipv4Cidr::parse("not-an-ip/8").is_none());
    }

    #[test]
    fn test_port_range() {
        let single = PortRange::parse("80").unwrap();
        assert!(single.contains(80));
        assert!(!single.contains(81));

        let range = PortRange::parse("1024-65535").unwrap();
        assert!(range.contains(1024));
        assert!(range.contains(65535));
        assert!(!range.contains(80));

        assert!(PortRange::parse("90-80").is_none());
        assert!(PortRange::parse("http").is_none());
    }
}
