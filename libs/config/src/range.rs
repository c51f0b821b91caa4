//! address ranges & the sets they are grouped into
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use ipnet::IpNet;
use thiserror::Error;

use crate::wire;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("range has no subnet")]
    MissingSubnet,
    #[error("Network {0} too small to allocate from")]
    TooSmall(IpNet),
    #[error(
        "Network has host bits set. For a subnet mask of length {prefix} the network address is {network}"
    )]
    HostBits { prefix: u8, network: IpAddr },
    #[error("RangeStart {start} not in network {subnet}")]
    StartOutside { start: IpAddr, subnet: IpNet },
    #[error("RangeEnd {end} not in network {subnet}")]
    EndOutside { end: IpAddr, subnet: IpNet },
    #[error("RangeStart {start} is after RangeEnd {end}")]
    StartAfterEnd { start: IpAddr, end: IpAddr },
    #[error("empty range set")]
    Empty,
    #[error("mixed address families")]
    MixedFamilies,
    #[error("subnets {0} and {1} overlap")]
    Overlap(IpNet, IpNet),
}

/// A contiguous span of a subnet that addresses are handed out from.
/// `range_start` & `range_end` are inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    subnet: IpNet,
    range_start: IpAddr,
    range_end: IpAddr,
    gateway: IpAddr,
}

impl Range {
    /// validate & fill in defaults: the gateway and start default to the
    /// first address after the network address, the end to the last
    /// address (excluding broadcast for IPv4)
    pub fn new(
        subnet: IpNet,
        range_start: Option<IpAddr>,
        range_end: Option<IpAddr>,
        gateway: Option<IpAddr>,
    ) -> Result<Self, RangeError> {
        if subnet.prefix_len() + 2 > subnet.max_prefix_len() {
            return Err(RangeError::TooSmall(subnet));
        }
        if subnet.addr() != subnet.network() {
            return Err(RangeError::HostBits {
                prefix: subnet.prefix_len(),
                network: subnet.network(),
            });
        }
        let first = next_ip(subnet.network());

        let range_start = match range_start.map(|ip| ip.to_canonical()) {
            Some(start) if !subnet.contains(&start) => {
                return Err(RangeError::StartOutside { start, subnet });
            }
            Some(start) => start,
            None => first,
        };
        let range_end = match range_end.map(|ip| ip.to_canonical()) {
            Some(end) if !subnet.contains(&end) => {
                return Err(RangeError::EndOutside { end, subnet });
            }
            Some(end) => end,
            None => last_ip(&subnet),
        };
        if range_start > range_end {
            return Err(RangeError::StartAfterEnd {
                start: range_start,
                end: range_end,
            });
        }

        Ok(Self {
            subnet,
            range_start,
            range_end,
            gateway: gateway.map(|ip| ip.to_canonical()).unwrap_or(first),
        })
    }
    pub fn subnet(&self) -> IpNet {
        self.subnet
    }
    pub fn range_start(&self) -> IpAddr {
        self.range_start
    }
    pub fn range_end(&self) -> IpAddr {
        self.range_end
    }
    pub fn gateway(&self) -> IpAddr {
        self.gateway
    }
    /// `ip` is in the subnet and between start & end
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.subnet.contains(ip) && *ip >= self.range_start && *ip <= self.range_end
    }
    /// do the two ranges share any address
    pub fn overlaps(&self, other: &Range) -> bool {
        self.is_ipv4() == other.is_ipv4()
            && (self.contains(&other.range_start)
                || self.contains(&other.range_end)
                || other.contains(&self.range_start)
                || other.contains(&self.range_end))
    }
    /// `ip` with this range's prefix length
    pub fn with_prefix(&self, ip: IpAddr) -> IpNet {
        // prefix_len came from a valid subnet of the same family
        IpNet::new(ip, self.subnet.prefix_len()).unwrap_or_else(|_| IpNet::from(ip))
    }
    pub fn is_ipv4(&self) -> bool {
        self.subnet.addr().is_ipv4()
    }
}

impl TryFrom<wire::Range> for Range {
    type Error = RangeError;

    fn try_from(range: wire::Range) -> Result<Self, Self::Error> {
        let subnet = range.subnet.ok_or(RangeError::MissingSubnet)?;
        Range::new(subnet, range.range_start, range.range_end, range.gateway)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.range_start, self.range_end)
    }
}

/// An ordered group of ranges of one address family, allocated from as
/// one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSet(Vec<Range>);

impl RangeSet {
    pub fn new(ranges: Vec<Range>) -> Result<Self, RangeError> {
        let first = ranges.first().ok_or(RangeError::Empty)?;
        if ranges.iter().any(|r| r.is_ipv4() != first.is_ipv4()) {
            return Err(RangeError::MixedFamilies);
        }
        for (i, a) in ranges.iter().enumerate() {
            if let Some(b) = ranges[i + 1..].iter().find(|b| a.overlaps(b)) {
                return Err(RangeError::Overlap(a.subnet(), b.subnet()));
            }
        }
        Ok(Self(ranges))
    }
    pub fn ranges(&self) -> &[Range] {
        &self.0
    }
    pub fn iter(&self) -> impl Iterator<Item = &Range> {
        self.0.iter()
    }
    pub fn is_ipv4(&self) -> bool {
        self.0.first().is_some_and(Range::is_ipv4)
    }
    /// is `ip` inside any of the ranges
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.range_for(ip).is_some()
    }
    /// the range holding `ip`
    pub fn range_for(&self, ip: &IpAddr) -> Option<&Range> {
        let ip = ip.to_canonical();
        self.0.iter().find(|r| r.contains(&ip))
    }
    pub fn overlaps(&self, other: &RangeSet) -> bool {
        self.0
            .iter()
            .any(|a| other.0.iter().any(|b| a.overlaps(b)))
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{range}")?;
        }
        Ok(())
    }
}

/// the address after `ip`, wrapping at the end of the family's space
pub fn next_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(ip) => Ipv4Addr::from(u32::from(ip).wrapping_add(1)).into(),
        IpAddr::V6(ip) => Ipv6Addr::from(u128::from(ip).wrapping_add(1)).into(),
    }
}

/// the address before `ip`, wrapping at zero
pub fn prev_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(ip) => Ipv4Addr::from(u32::from(ip).wrapping_sub(1)).into(),
        IpAddr::V6(ip) => Ipv6Addr::from(u128::from(ip).wrapping_sub(1)).into(),
    }
}

/// last usable address of a subnet. IPv4 loses the broadcast address.
fn last_ip(subnet: &IpNet) -> IpAddr {
    match subnet {
        IpNet::V4(net) => prev_ip(net.broadcast().into()),
        IpNet::V6(net) => net.broadcast().into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn range(subnet: &str) -> Range {
        Range::new(subnet.parse().unwrap(), None, None, None).unwrap()
    }

    #[test]
    fn test_defaults_v4() {
        let r = range("192.0.2.0/24");
        assert_eq!(r.range_start(), ip("192.0.2.1"));
        assert_eq!(r.range_end(), ip("192.0.2.254"));
        assert_eq!(r.gateway(), ip("192.0.2.1"));
        assert_eq!(r.to_string(), "192.0.2.1-192.0.2.254");
    }

    #[test]
    fn test_defaults_v6() {
        let r = range("2001:db8:1::/64");
        assert_eq!(r.range_start(), ip("2001:db8:1::1"));
        assert_eq!(r.range_end(), ip("2001:db8:1::ffff:ffff:ffff:ffff"));
        assert_eq!(r.gateway(), ip("2001:db8:1::1"));
    }

    #[test]
    fn test_explicit_bounds() {
        let r = Range::new(
            "10.0.0.0/16".parse().unwrap(),
            Some(ip("10.0.1.10")),
            Some(ip("10.0.1.20")),
            Some(ip("10.0.0.254")),
        )
        .unwrap();
        assert!(r.contains(&ip("10.0.1.10")));
        assert!(r.contains(&ip("10.0.1.20")));
        assert!(!r.contains(&ip("10.0.1.21")));
        assert!(!r.contains(&ip("10.0.0.254")));
        assert!(!r.contains(&ip("2001:db8::1")));
        assert_eq!(r.with_prefix(ip("10.0.1.11")), "10.0.1.11/16".parse::<IpNet>().unwrap());
    }

    #[test]
    fn test_invalid_ranges() {
        let net = |s: &str| s.parse::<IpNet>().unwrap();
        assert_eq!(
            Range::new(net("10.0.0.0/31"), None, None, None).unwrap_err(),
            RangeError::TooSmall(net("10.0.0.0/31"))
        );
        assert!(Range::new(net("10.0.0.0/30"), None, None, None).is_ok());
        assert_eq!(
            Range::new(net("10.0.0.5/24"), None, None, None)
                .unwrap_err()
                .to_string(),
            "Network has host bits set. For a subnet mask of length 24 the network address is 10.0.0.0"
        );
        assert!(matches!(
            Range::new(net("10.0.0.0/24"), Some(ip("10.0.1.1")), None, None),
            Err(RangeError::StartOutside { .. })
        ));
        assert!(matches!(
            Range::new(net("10.0.0.0/24"), None, Some(ip("10.0.1.1")), None),
            Err(RangeError::EndOutside { .. })
        ));
        assert!(matches!(
            Range::new(net("10.0.0.0/24"), Some(ip("10.0.0.9")), Some(ip("10.0.0.2")), None),
            Err(RangeError::StartAfterEnd { .. })
        ));
    }

    #[test]
    fn test_range_set() {
        let set = RangeSet::new(vec![range("10.0.0.0/24"), range("10.0.1.0/24")]).unwrap();
        assert!(set.contains(&ip("10.0.1.5")));
        assert!(!set.contains(&ip("10.0.2.5")));
        assert_eq!(set.range_for(&ip("10.0.1.5")).unwrap().subnet(), "10.0.1.0/24".parse::<IpNet>().unwrap());
        assert_eq!(set.to_string(), "10.0.0.1-10.0.0.254,10.0.1.1-10.0.1.254");
        // v4-mapped addresses are treated as v4
        assert!(set.contains(&ip("::ffff:10.0.0.7")));

        assert_eq!(RangeSet::new(vec![]).unwrap_err(), RangeError::Empty);
        assert_eq!(
            RangeSet::new(vec![range("10.0.0.0/24"), range("2001:db8::/64")]).unwrap_err(),
            RangeError::MixedFamilies
        );
        assert!(matches!(
            RangeSet::new(vec![range("10.0.0.0/16"), range("10.0.5.0/24")]),
            Err(RangeError::Overlap(..))
        ));
    }

    #[test]
    fn test_range_set_overlap() {
        let a = RangeSet::new(vec![range("10.0.0.0/24")]).unwrap();
        let b = RangeSet::new(vec![range("10.0.0.0/25")]).unwrap();
        let c = RangeSet::new(vec![range("2001:db8::/64")]).unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_ip_math() {
        assert_eq!(next_ip(ip("10.0.0.255")), ip("10.0.1.0"));
        assert_eq!(prev_ip(ip("10.0.1.0")), ip("10.0.0.255"));
        assert_eq!(next_ip(ip("2001:db8::ffff")), ip("2001:db8::1:0"));
    }
}
