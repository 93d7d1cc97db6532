//! IPv4 subnets in CIDR notation.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use burrow_common::error::{BurrowError, Result};

/// Largest prefix that still leaves a gateway and one container address.
const MAX_PREFIX: u8 = 30;

/// An IPv4 network such as `172.29.0.0/24`.
///
/// The first host address is the bridge gateway; container addresses are
/// handed out from the second host address up to the one before broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    /// Creates a subnet, masking off host bits of `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if `prefix` is larger than 30.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > MAX_PREFIX {
            return Err(BurrowError::config(format!(
                "subnet prefix /{prefix} is too small, at most /{MAX_PREFIX} is supported"
            )));
        }
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask(prefix)),
            prefix,
        })
    }

    /// Network address.
    #[must_use]
    pub const fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length.
    #[must_use]
    pub const fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Address assigned to the bridge.
    #[must_use]
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 1)
    }

    /// Broadcast address.
    #[must_use]
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !mask(self.prefix))
    }

    /// Addresses available to containers, lowest first.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let first = u32::from(self.network) + 2;
        let last = u32::from(self.broadcast()) - 1;
        (first..=last).map(Ipv4Addr::from)
    }

    /// Whether `addr` lies inside this subnet.
    #[must_use]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask(self.prefix) == u32::from(self.network)
    }

    /// Whether the two subnets share any address.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.contains(other.network) || other.contains(self.network)
    }
}

const fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

impl FromStr for Subnet {
    type Err = BurrowError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BurrowError::config(format!("invalid subnet {s:?}, expected a.b.c.d/prefix"));
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr = addr.parse::<Ipv4Addr>().map_err(|_| invalid())?;
        let prefix = prefix.parse::<u8>().map_err(|_| invalid())?;
        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for Subnet {
    type Error = BurrowError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Subnet> for String {
    fn from(subnet: Subnet) -> Self {
        subnet.to_string()
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_masks_host_bits() {
        let subnet: Subnet = "172.29.0.17/24".parse().unwrap();
        assert_eq!(subnet.to_string(), "172.29.0.0/24");
        assert_eq!(subnet.gateway(), Ipv4Addr::new(172, 29, 0, 1));
        assert_eq!(subnet.broadcast(), Ipv4Addr::new(172, 29, 0, 255));
    }

    #[test]
    fn hosts_skip_network_gateway_and_broadcast() {
        let subnet: Subnet = "10.0.0.0/29".parse().unwrap();
        let hosts: Vec<_> = subnet.hosts().collect();
        assert_eq!(hosts.first(), Some(&Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(hosts.last(), Some(&Ipv4Addr::new(10, 0, 0, 6)));
        assert_eq!(hosts.len(), 5);
    }

    #[test]
    fn rejects_malformed_and_tiny_subnets() {
        assert!("10.0.0.0".parse::<Subnet>().is_err());
        assert!("10.0.0.0/33".parse::<Subnet>().is_err());
        assert!("10.0.0.0/31".parse::<Subnet>().is_err());
        assert!("nope/24".parse::<Subnet>().is_err());
    }

    #[test]
    fn contains_and_overlaps() {
        let a: Subnet = "10.1.0.0/16".parse().unwrap();
        let b: Subnet = "10.1.2.0/24".parse().unwrap();
        let c: Subnet = "10.2.0.0/24".parse().unwrap();
        assert!(a.contains(Ipv4Addr::new(10, 1, 200, 3)));
        assert!(!a.contains(Ipv4Addr::new(10, 2, 0, 3)));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn serializes_as_cidr_string() {
        let subnet: Subnet = "192.168.5.0/24".parse().unwrap();
        let json = serde_json::to_string(&subnet).unwrap();
        assert_eq!(json, "\"192.168.5.0/24\"");
        let back: Subnet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, subnet);
    }
}
