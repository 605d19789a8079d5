//! CIDR subnet type used for customer-network attribution
//!
//! Equality and hashing are defined over the network portion only, so two
//! values describing the same network compare equal regardless of host bits
//! in the address they were built from.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

/// An `(address, prefix length)` pair identifying one customer network
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SubnetCidr {
    address: IpAddr,
    prefix_len: u8,
}

impl SubnetCidr {
    /// Build a subnet, masking off host bits and clamping the prefix length
    /// to 32 (v4) or 128 (v6).
    pub fn new(address: IpAddr, prefix_len: u8) -> Self {
        let prefix_len = prefix_len.min(Self::max_prefix(&address));
        Self {
            address: mask_address(address, prefix_len),
            prefix_len,
        }
    }

    /// The whole-host subnet for an address (/32 or /128)
    pub fn host(address: IpAddr) -> Self {
        Self::new(address, Self::max_prefix(&address))
    }

    fn max_prefix(address: &IpAddr) -> u8 {
        if address.is_ipv4() { 32 } else { 128 }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.address, ip) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask_address(ip, self.prefix_len) == self.address
            }
            _ => false,
        }
    }
}

impl From<IpNetwork> for SubnetCidr {
    fn from(net: IpNetwork) -> Self {
        Self::new(net.ip(), net.prefix())
    }
}

impl FromStr for SubnetCidr {
    type Err = ipnetwork::IpNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<IpNetwork>().map(Self::from)
    }
}

impl PartialEq for SubnetCidr {
    fn eq(&self, other: &Self) -> bool {
        self.prefix_len == other.prefix_len && self.address == other.address
    }
}

impl Eq for SubnetCidr {}

impl std::hash::Hash for SubnetCidr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.prefix_len.hash(state);
    }
}

impl std::fmt::Display for SubnetCidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

fn mask_address(address: IpAddr, prefix_len: u8) -> IpAddr {
    match address {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let mask = if prefix_len == 0 { 0 } else { u32::MAX << (32 - prefix_len as u32) };
            IpAddr::V4(Ipv4Addr::from(bits & mask))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let mask = if prefix_len == 0 { 0 } else { u128::MAX << (128 - prefix_len as u32) };
            IpAddr::V6(Ipv6Addr::from(bits & mask))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_over_network_portion() {
        let a: SubnetCidr = "10.1.2.3/24".parse().unwrap();
        let b: SubnetCidr = "10.1.2.200/24".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "10.1.2.0/24");
    }

    #[test]
    fn test_prefix_clamped() {
        let net = SubnetCidr::new("192.168.0.1".parse().unwrap(), 64);
        assert_eq!(net.prefix_len(), 32);

        let net6 = SubnetCidr::new("2a03:f480::1".parse().unwrap(), 200);
        assert_eq!(net6.prefix_len(), 128);
    }

    #[test]
    fn test_contains() {
        let net: SubnetCidr = "10.0.0.0/8".parse().unwrap();
        assert!(net.contains("10.255.1.1".parse().unwrap()));
        assert!(!net.contains("11.0.0.1".parse().unwrap()));
        // Family mismatch is never contained
        assert!(!net.contains("::1".parse().unwrap()));
    }

    #[test]
    fn test_hash_matches_eq() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert("10.1.2.3/24".parse::<SubnetCidr>().unwrap());
        assert!(set.contains(&"10.1.2.99/24".parse::<SubnetCidr>().unwrap()));
    }
}
