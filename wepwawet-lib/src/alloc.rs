//! Discovery of unused kernel resources: routing table IDs, namespace and
//! link names, private IPv4 subnets.
//!
//! Pure functions over a [`NetlinkOps`] snapshot. Given the same kernel
//! state they return the same result: the lowest free integer, the first
//! free probe name, the first free subnet of the first RFC1918 supernet in
//! declared order.

use cidr::{Ipv4Cidr, Ipv4Inet};

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

use crate::error::Error;
use crate::netlink::{Family, NetlinkOps};

/// Lowest routing table ID this crate hands out. Stays clear of the kernel's
/// reserved tables (local=255, main=254, default=253) and of the low range
/// used by other policy-routing tools.
pub const TABLE_ID_START: u32 = 10111;

/// Base for probed namespace and veth link names.
pub const NAME_BASE: &str = "wepwawet";

/// RFC1918 supernets scanned for free subnets, in allocation order.
const RFC1918_SUPERNETS: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
];

async fn used_tables<N: NetlinkOps>(netlink: &N) -> Result<BTreeSet<u32>, Error> {
    let mut used = BTreeSet::new();
    for family in [Family::V4, Family::V6] {
        for rule in netlink.rule_list(family).await? {
            used.insert(rule.table);
        }
    }
    Ok(used)
}

/// Smallest table ID >= `start` not referenced by any routing rule.
pub async fn find_free_table<N: NetlinkOps>(netlink: &N, start: u32) -> Result<u32, Error> {
    let used = used_tables(netlink).await?;
    (start..=u32::MAX)
        .find(|id| !used.contains(id))
        .ok_or_else(|| Error::Allocation("routing table ID space exhausted".into()))
}

/// Whether any routing rule references `table`.
pub async fn is_table_in_use<N: NetlinkOps>(netlink: &N, table: u32) -> Result<bool, Error> {
    Ok(used_tables(netlink).await?.contains(&table))
}

/// `base0`, `base1`, ...: first name not present in the namespace list.
pub async fn find_free_netns_name<N: NetlinkOps>(netlink: &N, base: &str) -> Result<String, Error> {
    let existing = netlink.ns_list().await?;
    Ok(probe_name(base, &existing))
}

/// `base0`, `base1`, ...: first name not taken by an existing link.
pub async fn find_free_link_name<N: NetlinkOps>(netlink: &N, base: &str) -> Result<String, Error> {
    let existing: Vec<String> = netlink.link_list().await?.into_iter().map(|l| l.name).collect();
    Ok(probe_name(base, &existing))
}

fn probe_name(base: &str, existing: &[String]) -> String {
    let mut i = 0u32;
    loop {
        let name = format!("{base}{i}");
        if !existing.iter().any(|n| *n == name) {
            return name;
        }
        i += 1;
    }
}

fn v4_overlaps(a: &Ipv4Cidr, b: &Ipv4Cidr) -> bool {
    a.contains(&b.first_address()) || b.contains(&a.first_address())
}

/// First subnet of the given prefix length, drawn from the RFC1918 supernets
/// in declared order, that overlaps neither an existing route destination nor
/// an interface address.
pub async fn find_unallocated_ipv4_subnet<N: NetlinkOps>(
    netlink: &N,
    prefix_len: u8,
) -> Result<Ipv4Cidr, Error> {
    if prefix_len == 0 || prefix_len > 30 {
        return Err(Error::Allocation(format!("unsupported subnet prefix length {prefix_len}")));
    }

    let mut occupied: Vec<Ipv4Cidr> = Vec::new();
    for route in netlink.route_list(Family::V4, None).await? {
        if let Some(cidr::IpCidr::V4(dst)) = route.destination {
            occupied.push(dst);
        }
    }
    for addr in netlink.addr_list().await? {
        if let IpAddr::V4(ip) = addr.addr
            && let Ok(inet) = Ipv4Inet::new(ip, addr.prefix_len)
        {
            occupied.push(inet.network());
        }
    }

    let size = 1u64 << (32 - prefix_len);
    for (supernet, supernet_len) in RFC1918_SUPERNETS {
        if prefix_len < *supernet_len {
            continue;
        }
        let start = u64::from(u32::from(*supernet));
        let end = start + (1u64 << (32 - supernet_len)) - 1;

        let mut cursor = start;
        while cursor + size - 1 <= end {
            let Ok(candidate) = Ipv4Cidr::new(Ipv4Addr::from(cursor as u32), prefix_len) else {
                break;
            };
            match occupied.iter().find(|c| v4_overlaps(&candidate, c)) {
                None => return Ok(candidate),
                Some(conflict) => {
                    // Skip past the conflicting network, staying aligned to
                    // the subnet size.
                    let after = u64::from(u32::from(conflict.last_address())) + 1;
                    cursor = after.max(cursor + size).div_ceil(size) * size;
                }
            }
        }
    }

    Err(Error::Allocation(format!("no unallocated /{prefix_len} subnet in the private ranges")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockNetlinkOps;
    use crate::netlink::{RouteSpec, RuleAction, RuleSelector, RuleSpec};

    fn rule(table: u32) -> RuleSpec {
        RuleSpec {
            family: Family::V4,
            table,
            priority: 100,
            selector: Some(RuleSelector::UidRange(1000, 1000)),
            action: RuleAction::Lookup,
        }
    }

    #[tokio::test]
    async fn free_table_skips_used_ids() {
        let netlink = MockNetlinkOps::new();
        netlink.add_rule(rule(TABLE_ID_START));
        netlink.add_rule(rule(TABLE_ID_START + 1));

        let id = find_free_table(&netlink, TABLE_ID_START).await.unwrap();
        assert_eq!(id, TABLE_ID_START + 2);
        assert!(is_table_in_use(&netlink, TABLE_ID_START).await.unwrap());
        assert!(!is_table_in_use(&netlink, id).await.unwrap());
    }

    #[tokio::test]
    async fn free_table_considers_both_families() {
        let netlink = MockNetlinkOps::new();
        netlink.add_rule(RuleSpec {
            family: Family::V6,
            ..rule(TABLE_ID_START)
        });

        let id = find_free_table(&netlink, TABLE_ID_START).await.unwrap();
        assert_eq!(id, TABLE_ID_START + 1);
    }

    #[tokio::test]
    async fn netns_and_link_names_probe_upwards() {
        let netlink = MockNetlinkOps::new();
        netlink.add_link("wepwawet0");
        netlink.add_link("eth0");

        let link_name = find_free_link_name(&netlink, NAME_BASE).await.unwrap();
        assert_eq!(link_name, "wepwawet1");

        let ns_name = find_free_netns_name(&netlink, NAME_BASE).await.unwrap();
        assert_eq!(ns_name, "wepwawet0");
    }

    #[tokio::test]
    async fn subnet_allocation_avoids_routes_and_addrs() {
        let netlink = MockNetlinkOps::new();
        let eth0 = netlink.add_link("eth0");
        // 10.0.0.0/8 fully routed elsewhere, host lives in 172.16.0.0/24.
        netlink.add_route(RouteSpec {
            destination: Some("10.0.0.0/8".parse().unwrap()),
            if_index: Some(eth0),
            ..RouteSpec::unicast(Family::V4, 254)
        });
        netlink.add_addr(eth0, "172.16.0.77".parse().unwrap(), 24);

        let subnet = find_unallocated_ipv4_subnet(&netlink, 30).await.unwrap();
        assert_eq!(subnet, "172.16.1.0/30".parse().unwrap());
    }

    #[tokio::test]
    async fn subnet_allocation_prefers_first_supernet() {
        let netlink = MockNetlinkOps::new();
        let subnet = find_unallocated_ipv4_subnet(&netlink, 30).await.unwrap();
        assert_eq!(subnet, "10.0.0.0/30".parse().unwrap());
    }

    #[tokio::test]
    async fn subnet_allocation_rejects_bad_prefix() {
        let netlink = MockNetlinkOps::new();
        assert!(find_unallocated_ipv4_subnet(&netlink, 31).await.is_err());
        assert!(find_unallocated_ipv4_subnet(&netlink, 0).await.is_err());
    }
}
