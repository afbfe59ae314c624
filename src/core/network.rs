//! IPv4 address planning: CIDR arithmetic and subnet layout.
//!
//! Subnets are allocated sequentially from the VPC block: for each subnet
//! group in declaration order, one subnet per availability zone, each block
//! aligned to its own mask.

use super::synth::logical_id;
use super::types::{SubnetTier, VpcSpec};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Smallest subnet the provider accepts.
pub const MAX_PREFIX: u8 = 28;

/// Largest VPC block the provider accepts.
pub const MIN_VPC_PREFIX: u8 = 16;

/// A canonical IPv4 network block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

impl Ipv4Cidr {
    /// Build a block; rejects host bits set below the prefix.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, String> {
        if prefix > 32 {
            return Err(format!("prefix /{} out of range", prefix));
        }
        let bits = u32::from(addr);
        let m = mask(prefix);
        if bits & !m != 0 {
            return Err(format!(
                "{}/{} has host bits set (did you mean {}/{}?)",
                addr,
                prefix,
                Ipv4Addr::from(bits & m),
                prefix
            ));
        }
        Ok(Self {
            network: bits,
            prefix,
        })
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    /// Number of addresses in the block.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix >= self.prefix && other.network & mask(self.prefix) == self.network
    }

    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.contains(other) || other.contains(self)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid CIDR '{}': missing /prefix", s))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|e| format!("invalid CIDR '{}': {}", s, e))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| format!("invalid CIDR '{}': {}", s, e))?;
        Self::new(addr, prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

/// Hands out aligned, non-overlapping blocks from a parent block.
#[derive(Debug, Clone)]
pub struct SubnetAllocator {
    block: Ipv4Cidr,
    next: u64,
}

impl SubnetAllocator {
    pub fn new(block: Ipv4Cidr) -> Self {
        Self { block, next: 0 }
    }

    /// Allocate the next block of the given prefix length.
    pub fn allocate(&mut self, prefix: u8) -> Result<Ipv4Cidr, String> {
        if prefix < self.block.prefix || prefix > 32 {
            return Err(format!(
                "cannot carve a /{} out of {}",
                prefix, self.block
            ));
        }
        let size = 1u64 << (32 - u32::from(prefix));
        let aligned = self.next.div_ceil(size) * size;
        if aligned + size > self.block.size() {
            return Err(format!(
                "{} has no room left for another /{}",
                self.block, prefix
            ));
        }
        self.next = aligned + size;
        let network = self.block.network + aligned as u32;
        Ipv4Cidr::new(Ipv4Addr::from(network), prefix)
    }
}

/// One subnet of a VPC layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSubnet {
    pub group: String,
    pub tier: SubnetTier,
    /// Zero-based availability zone index
    pub az_index: u8,
    pub cidr: Ipv4Cidr,
}

impl PlannedSubnet {
    /// Logical-ID suffix, e.g. `PublicDataSubnet1`.
    pub fn name(&self) -> String {
        format!("{}Subnet{}", logical_id(&self.group), self.az_index + 1)
    }
}

/// Lay out every subnet of a VPC.
pub fn plan_subnets(vpc: &VpcSpec) -> Result<Vec<PlannedSubnet>, String> {
    let block: Ipv4Cidr = vpc.cidr.parse()?;
    let mut allocator = SubnetAllocator::new(block);
    let mut subnets = Vec::new();

    for group in &vpc.subnets {
        for az in 0..vpc.max_azs {
            let cidr = allocator
                .allocate(group.cidr_mask)
                .map_err(|e| format!("subnet group '{}': {}", group.name, e))?;
            subnets.push(PlannedSubnet {
                group: group.name.clone(),
                tier: group.tier,
                az_index: az,
                cidr,
            });
        }
    }

    Ok(subnets)
}

/// Subnets of one tier, in allocation order.
pub fn subnets_of_tier(subnets: &[PlannedSubnet], tier: SubnetTier) -> Vec<&PlannedSubnet> {
    subnets.iter().filter(|s| s.tier == tier).collect()
}

/// The public subnets hosting NAT gateways: the first `nat_gateways` subnets
/// of the first public group, one per availability zone.
pub fn nat_hosts(vpc: &VpcSpec, subnets: &[PlannedSubnet]) -> Vec<PlannedSubnet> {
    let Some(first_public) = vpc.subnets.iter().find(|g| g.tier == SubnetTier::Public) else {
        return Vec::new();
    };
    subnets
        .iter()
        .filter(|s| s.group == first_public.name)
        .take(usize::from(vpc.nat_gateways))
        .cloned()
        .collect()
}

/// Index of the NAT gateway a private subnet in `az_index` routes through.
pub fn nat_for_az(az_index: u8, nat_gateways: u8) -> usize {
    if nat_gateways == 0 {
        return 0;
    }
    usize::from(az_index % nat_gateways)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SubnetGroup;
    use proptest::prelude::*;

    fn wipercheck_vpc() -> VpcSpec {
        VpcSpec {
            name: Some("wipercheck-vpc".to_string()),
            cidr: "10.0.0.0/16".to_string(),
            max_azs: 2,
            nat_gateways: 1,
            subnets: vec![
                SubnetGroup {
                    name: "private-data".to_string(),
                    cidr_mask: 26,
                    tier: SubnetTier::PrivateWithNat,
                },
                SubnetGroup {
                    name: "public-data".to_string(),
                    cidr_mask: 26,
                    tier: SubnetTier::Public,
                },
            ],
        }
    }

    #[test]
    fn test_parse_and_display() {
        let c: Ipv4Cidr = "10.0.0.0/16".parse().unwrap();
        assert_eq!(c.prefix(), 16);
        assert_eq!(c.size(), 65536);
        assert_eq!(c.to_string(), "10.0.0.0/16");
        assert_eq!(c.network(), Ipv4Addr::new(10, 0, 0, 0));
    }

    #[test]
    fn test_parse_rejects_host_bits() {
        let err = "10.0.0.1/16".parse::<Ipv4Cidr>().unwrap_err();
        assert!(err.contains("host bits"));
        assert!(err.contains("10.0.0.0/16"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("10.0.0.0".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0/16".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_contains_and_overlaps() {
        let vpc: Ipv4Cidr = "10.0.0.0/16".parse().unwrap();
        let inside: Ipv4Cidr = "10.0.3.0/24".parse().unwrap();
        let outside: Ipv4Cidr = "10.1.0.0/24".parse().unwrap();
        assert!(vpc.contains(&inside));
        assert!(!inside.contains(&vpc));
        assert!(inside.overlaps(&vpc));
        assert!(!vpc.overlaps(&outside));
    }

    #[test]
    fn test_allocator_aligns_mixed_masks() {
        let mut a = SubnetAllocator::new("10.0.0.0/24".parse().unwrap());
        assert_eq!(a.allocate(28).unwrap().to_string(), "10.0.0.0/28");
        // A /26 must start on a 64-address boundary
        assert_eq!(a.allocate(26).unwrap().to_string(), "10.0.0.64/26");
        assert_eq!(a.allocate(28).unwrap().to_string(), "10.0.0.128/28");
        // 144 addresses used; the next /25 boundary is the end of the block
        assert!(a.allocate(25).is_err());
    }

    #[test]
    fn test_allocator_exhaustion() {
        let mut a = SubnetAllocator::new("10.0.0.0/26".parse().unwrap());
        a.allocate(27).unwrap();
        a.allocate(27).unwrap();
        let err = a.allocate(28).unwrap_err();
        assert!(err.contains("no room"));
    }

    #[test]
    fn test_allocator_rejects_larger_than_block() {
        let mut a = SubnetAllocator::new("10.0.0.0/24".parse().unwrap());
        assert!(a.allocate(16).is_err());
    }

    #[test]
    fn test_wipercheck_layout() {
        let subnets = plan_subnets(&wipercheck_vpc()).unwrap();
        let cidrs: Vec<String> = subnets.iter().map(|s| s.cidr.to_string()).collect();
        assert_eq!(
            cidrs,
            vec!["10.0.0.0/26", "10.0.0.64/26", "10.0.0.128/26", "10.0.0.192/26"]
        );
        assert_eq!(subnets[0].name(), "PrivateDataSubnet1");
        assert_eq!(subnets[3].name(), "PublicDataSubnet2");
        assert_eq!(subnets_of_tier(&subnets, SubnetTier::Public).len(), 2);
    }

    #[test]
    fn test_nat_hosts_first_public_group() {
        let vpc = wipercheck_vpc();
        let subnets = plan_subnets(&vpc).unwrap();
        let hosts = nat_hosts(&vpc, &subnets);
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].name(), "PublicDataSubnet1");
        assert_eq!(nat_for_az(1, 1), 0);
        assert_eq!(nat_for_az(1, 2), 1);
    }

    #[test]
    fn test_layout_overflow_names_group() {
        let mut vpc = wipercheck_vpc();
        vpc.cidr = "10.0.0.0/25".to_string();
        let err = plan_subnets(&vpc).unwrap_err();
        assert!(err.contains("public-data"));
    }

    proptest! {
        #[test]
        fn prop_allocations_disjoint_and_contained(
            masks in proptest::collection::vec(20u8..=28, 1..24)
        ) {
            let block: Ipv4Cidr = "10.0.0.0/16".parse().unwrap();
            let mut a = SubnetAllocator::new(block);
            let mut got: Vec<Ipv4Cidr> = Vec::new();
            for m in masks {
                if let Ok(c) = a.allocate(m) {
                    prop_assert!(block.contains(&c));
                    for prev in &got {
                        prop_assert!(!prev.overlaps(&c));
                    }
                    got.push(c);
                }
            }
        }
    }
}
