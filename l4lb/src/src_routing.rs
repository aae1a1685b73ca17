//! Source-prefix routing rules with longest-prefix-match resolution.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use l4lb_common::RealIndex;

use crate::error::{LbError, LbResult};

/// An IPv4 or IPv6 prefix, stored with host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cidr {
    addr: IpAddr,
    len: u8,
}

fn mask(addr: IpAddr, len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(a) => {
            let bits = u32::from(a);
            let m = if len == 0 { 0 } else { u32::MAX << (32 - len as u32) };
            IpAddr::V4(Ipv4Addr::from(bits & m))
        }
        IpAddr::V6(a) => {
            let bits = u128::from(a);
            let m = if len == 0 { 0 } else { u128::MAX << (128 - len as u32) };
            IpAddr::V6(Ipv6Addr::from(bits & m))
        }
    }
}

fn max_len(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

impl Cidr {
    pub fn new(addr: IpAddr, len: u8) -> LbResult<Self> {
        if len > max_len(&addr) {
            return Err(LbError::InvalidConfiguration(format!(
                "prefix length {} is too long for {}",
                len, addr
            )));
        }
        Ok(Cidr {
            addr: mask(addr, len),
            len,
        })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    pub fn is_v4(&self) -> bool {
        self.addr.is_ipv4()
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        ip.is_ipv4() == self.is_v4() && mask(*ip, self.len) == self.addr
    }
}

impl FromStr for Cidr {
    type Err = LbError;

    fn from_str(s: &str) -> LbResult<Self> {
        let malformed = || LbError::InvalidConfiguration(format!("malformed prefix '{}'", s));
        let (addr, len) = s.split_once('/').ok_or_else(malformed)?;
        let addr: IpAddr = addr.trim().parse().map_err(|_| malformed())?;
        let len: u8 = len.trim().parse().map_err(|_| malformed())?;
        Cidr::new(addr, len)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

/// Published longest-prefix-match table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LpmTable {
    rules: HashMap<Cidr, RealIndex>,
    // prefix lengths in use, longest first
    v4_lens: Vec<u8>,
    v6_lens: Vec<u8>,
}

impl LpmTable {
    pub fn lookup(&self, ip: &IpAddr) -> Option<RealIndex> {
        let lens = if ip.is_ipv4() { &self.v4_lens } else { &self.v6_lens };
        lens.iter().find_map(|len| {
            let key = Cidr {
                addr: mask(*ip, *len),
                len: *len,
            };
            self.rules.get(&key).copied()
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SrcRoutingTable {
    rules: BTreeMap<Cidr, RealIndex>,
}

impl SrcRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, prefix: &Cidr) -> Option<RealIndex> {
        self.rules.get(prefix).copied()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rejects prefixes already routed to a different destination.
    pub fn check_conflicts(&self, prefixes: &[Cidr], dst: RealIndex) -> LbResult<()> {
        for prefix in prefixes {
            if let Some(existing) = self.rules.get(prefix) {
                if *existing != dst {
                    return Err(LbError::InvalidConfiguration(format!(
                        "source prefix {} is already routed elsewhere",
                        prefix
                    )));
                }
            }
        }
        Ok(())
    }

    /// Returns false if the identical rule was already present.
    pub fn insert(&mut self, prefix: Cidr, dst: RealIndex) -> bool {
        self.rules.insert(prefix, dst).is_none()
    }

    pub fn remove(&mut self, prefix: &Cidr) -> Option<RealIndex> {
        self.rules.remove(prefix)
    }

    /// Removes every rule, returning their destinations.
    pub fn drain(&mut self) -> Vec<RealIndex> {
        std::mem::take(&mut self.rules).into_values().collect()
    }

    /// Prefixes routed to `dst`.
    pub fn prefixes_for(&self, dst: RealIndex) -> Vec<Cidr> {
        self.rules
            .iter()
            .filter(|(_, d)| **d == dst)
            .map(|(p, _)| *p)
            .collect()
    }

    pub fn rules(&self) -> impl Iterator<Item = (&Cidr, RealIndex)> {
        self.rules.iter().map(|(p, d)| (p, *d))
    }

    pub fn resolve(&self, ip: &IpAddr) -> Option<RealIndex> {
        self.rules
            .iter()
            .filter(|(p, _)| p.contains(ip))
            .max_by_key(|(p, _)| p.prefix_len())
            .map(|(_, d)| *d)
    }

    pub(crate) fn snapshot(&self) -> LpmTable {
        let mut v4 = BTreeSet::new();
        let mut v6 = BTreeSet::new();
        for prefix in self.rules.keys() {
            if prefix.is_v4() {
                v4.insert(prefix.len);
            } else {
                v6.insert(prefix.len);
            }
        }
        LpmTable {
            rules: self.rules.iter().map(|(p, d)| (*p, *d)).collect(),
            v4_lens: v4.into_iter().rev().collect(),
            v6_lens: v6.into_iter().rev().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Cidr {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn parses_and_normalizes_prefixes() {
        assert_eq!(cidr("192.168.100.7/24").to_string(), "192.168.100.0/24");
        assert_eq!(cidr("fc00:2307::1/32").to_string(), "fc00:2307::/32");
        assert_eq!(cidr("0.0.0.0/0").prefix_len(), 0);
        for bad in ["192.168.0.0", "192.168.0.0/33", "fc00::/129", "nope/8", "10.0.0.0/x"] {
            assert!(matches!(
                bad.parse::<Cidr>(),
                Err(LbError::InvalidConfiguration(_))
            ));
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let mut table = SrcRoutingTable::new();
        table.insert(cidr("192.168.0.0/17"), 1);
        table.insert(cidr("192.168.100.0/24"), 2);
        table.insert(cidr("fc00:2307::/32"), 3);
        table.insert(cidr("fc00:2307::/64"), 4);

        assert_eq!(table.resolve(&ip("192.168.100.5")), Some(2));
        assert_eq!(table.resolve(&ip("192.168.1.1")), Some(1));
        assert_eq!(table.resolve(&ip("192.168.200.1")), None);
        assert_eq!(table.resolve(&ip("fc00:2307::9")), Some(4));
        assert_eq!(table.resolve(&ip("fc00:2307:1::9")), Some(3));

        let lpm = table.snapshot();
        for addr in ["192.168.100.5", "192.168.1.1", "192.168.200.1", "fc00:2307::9", "fc00:2307:1::9"] {
            assert_eq!(lpm.lookup(&ip(addr)), table.resolve(&ip(addr)));
        }
    }

    #[test]
    fn conflicting_destination_is_rejected() {
        let mut table = SrcRoutingTable::new();
        table.insert(cidr("10.1.0.0/16"), 1);
        assert!(table.check_conflicts(&[cidr("10.1.0.0/16")], 1).is_ok());
        assert!(table.check_conflicts(&[cidr("10.1.0.0/16")], 2).is_err());
        assert!(!table.insert(cidr("10.1.0.0/16"), 1));
    }

    #[test]
    fn v4_prefix_does_not_match_v6_source() {
        let mut table = SrcRoutingTable::new();
        table.insert(cidr("0.0.0.0/0"), 1);
        assert_eq!(table.resolve(&ip("::1")), None);
        assert_eq!(table.snapshot().lookup(&ip("::1")), None);
        assert_eq!(table.snapshot().lookup(&ip("8.8.8.8")), Some(1));
    }
}
