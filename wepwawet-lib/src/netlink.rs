//! Abstraction over rtnetlink operations.
//!
//! Defines the [`NetlinkOps`] trait and domain types ([`RouteSpec`],
//! [`RuleSpec`], [`LinkInfo`], [`AddrInfo`]) that decouple the routing core
//! from the raw netlink wire format.
//!
//! Production code uses [`RealNetlinkOps`] which wraps `rtnetlink::Handle`.
//! Tests use stateful mocks (see `mocks` module).
//!
//! All operations are single request/response round-trips without retries;
//! failures carry the primitive and its argument.

use async_trait::async_trait;
use cidr::IpCidr;
use futures::TryStreamExt;
use rtnetlink::packet_route::AddressFamily;
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::link::LinkAttribute;
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute, RouteMessage, RouteType};
use rtnetlink::packet_route::rule::{
    RuleAction as NlRuleAction, RuleAttribute, RuleMessage, RuleUidRange,
};
use rtnetlink::{IpVersion, LinkMessageBuilder, LinkUnspec, LinkVeth, LinkWireguard, RouteMessageBuilder};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsFd, AsRawFd};

use crate::error::Error;

/// Where iproute2 keeps named network namespace handles.
pub const NETNS_DIR: &str = "/var/run/netns";

/// The main kernel routing table.
pub const RT_TABLE_MAIN: u32 = 254;

// ============================================================================
// Domain Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of_net(net: &IpCidr) -> Self {
        match net {
            IpCidr::V4(_) => Family::V4,
            IpCidr::V6(_) => Family::V6,
        }
    }

    fn ip_version(self) -> IpVersion {
        match self {
            Family::V4 => IpVersion::V4,
            Family::V6 => IpVersion::V6,
        }
    }
}

/// Route specification decoupled from the rtnetlink wire format.
///
/// `destination: None` is the default route of the route's family.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    pub family: Family,
    pub table: u32,
    pub destination: Option<IpCidr>,
    pub gateway: Option<IpAddr>,
    pub if_index: Option<u32>,
    pub priority: Option<u32>,
    pub kind: RouteKind,
}

impl RouteSpec {
    /// A unicast route skeleton; fill in destination/gateway/oif as needed.
    pub fn unicast(family: Family, table: u32) -> Self {
        Self {
            family,
            table,
            destination: None,
            gateway: None,
            if_index: None,
            priority: None,
            kind: RouteKind::Unicast,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Unicast,
    Prohibit,
    /// Anything else the kernel reports (local, broadcast, ...). Listed but
    /// never created by this crate.
    Other,
}

/// Policy routing rule specification.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSpec {
    pub family: Family,
    pub table: u32,
    pub priority: u32,
    /// `None` for rules without a selector this crate understands
    /// (e.g. the kernel's default local/main/default rules).
    pub selector: Option<RuleSelector>,
    pub action: RuleAction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleSelector {
    /// Source uid within the inclusive range.
    UidRange(u32, u32),
    /// Packet arrived on the named interface.
    InboundIface(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Route using the rule's table.
    Lookup,
    /// Drop with "prohibited" (the killswitch action).
    Prohibit,
}

/// Network link (interface) information.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
}

/// Address assigned to an interface, either family.
#[derive(Debug, Clone, PartialEq)]
pub struct AddrInfo {
    pub if_index: u32,
    pub addr: IpAddr,
    pub prefix_len: u8,
}

/// True when the two networks share any address.
pub fn nets_overlap(a: &IpCidr, b: &IpCidr) -> bool {
    a.contains(&b.first_address()) || b.contains(&a.first_address())
}

// ============================================================================
// Trait
// ============================================================================

/// Abstraction over netlink link/address/route/rule/namespace operations.
///
/// Implementors must be cheaply cloneable (the underlying handle is already
/// reference-counted).
#[async_trait]
pub trait NetlinkOps: Send + Sync + Clone {
    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error>;
    async fn link_add_veth(&self, name: &str, peer: &str) -> Result<(), Error>;
    async fn link_add_wireguard(&self, name: &str) -> Result<(), Error>;
    async fn link_del(&self, index: u32) -> Result<(), Error>;
    async fn link_set_up(&self, index: u32) -> Result<(), Error>;
    /// Move a link into the named network namespace.
    async fn link_set_ns(&self, index: u32, ns_name: &str) -> Result<(), Error>;

    async fn addr_add(&self, index: u32, addr: IpAddr, prefix_len: u8) -> Result<(), Error>;
    async fn addr_list(&self) -> Result<Vec<AddrInfo>, Error>;

    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error>;
    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error>;
    /// List routes of one family, optionally restricted to a table.
    async fn route_list(&self, family: Family, table: Option<u32>) -> Result<Vec<RouteSpec>, Error>;

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error>;
    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error>;
    async fn rule_list(&self, family: Family) -> Result<Vec<RuleSpec>, Error>;

    async fn ns_add(&self, name: &str) -> Result<(), Error>;
    async fn ns_del(&self, name: &str) -> Result<(), Error>;
    async fn ns_list(&self) -> Result<Vec<String>, Error>;
    /// A handle whose netlink socket lives inside the named namespace.
    async fn ns_open(&self, name: &str) -> Result<Self, Error>;

    /// Index of the named link, if present.
    async fn link_index(&self, name: &str) -> Result<Option<u32>, Error> {
        Ok(self.link_list().await?.into_iter().find(|l| l.name == name).map(|l| l.index))
    }

    /// First unicast route in the main table whose destination overlaps `net`
    /// in the same family.
    async fn route_for_destination(&self, net: &IpCidr) -> Result<Option<RouteSpec>, Error> {
        let routes = self.route_list(Family::of_net(net), Some(RT_TABLE_MAIN)).await?;
        Ok(routes.into_iter().find(|r| {
            r.kind == RouteKind::Unicast
                && r.destination.as_ref().is_some_and(|dst| nets_overlap(dst, net))
        }))
    }

    /// Delete every rule referencing `table`. Individual deletions are
    /// best-effort; only the initial listing can fail.
    async fn flush_rules(&self, table: u32, family: Family) -> Result<(), Error> {
        for rule in self.rule_list(family).await? {
            if rule.table != table {
                continue;
            }
            if let Err(error) = self.rule_del(&rule).await {
                tracing::warn!(%error, table, "failed to flush rule, continuing anyway");
            }
        }
        Ok(())
    }

    /// Delete every route in `table`. Individual deletions are best-effort.
    async fn flush_routes(&self, table: u32, family: Family) -> Result<(), Error> {
        for route in self.route_list(family, Some(table)).await? {
            if let Err(error) = self.route_del(&route).await {
                tracing::warn!(%error, table, "failed to flush route, continuing anyway");
            }
        }
        Ok(())
    }
}

// ============================================================================
// Real Implementation
// ============================================================================

/// Production [`NetlinkOps`] backed by an `rtnetlink::Handle`.
#[derive(Clone)]
pub struct RealNetlinkOps {
    handle: rtnetlink::Handle,
}

impl RealNetlinkOps {
    pub fn new(handle: rtnetlink::Handle) -> Self {
        Self { handle }
    }

    /// Create a connection in the caller's namespace and spawn its driver task.
    pub fn connect() -> Result<Self, Error> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::task::spawn(conn);
        Ok(Self::new(handle))
    }

    fn build_route_message(spec: &RouteSpec) -> RouteMessage {
        let mut msg = match spec.family {
            Family::V4 => {
                let mut builder = RouteMessageBuilder::<Ipv4Addr>::new().table_id(spec.table);
                if let Some(IpCidr::V4(dst)) = spec.destination {
                    builder = builder.destination_prefix(dst.first_address(), dst.network_length());
                }
                if let Some(index) = spec.if_index {
                    builder = builder.output_interface(index);
                }
                if let Some(IpAddr::V4(gw)) = spec.gateway {
                    builder = builder.gateway(gw);
                }
                if let Some(priority) = spec.priority {
                    builder = builder.priority(priority);
                }
                builder.build()
            }
            Family::V6 => {
                let mut builder = RouteMessageBuilder::<Ipv6Addr>::new().table_id(spec.table);
                if let Some(IpCidr::V6(dst)) = spec.destination {
                    builder = builder.destination_prefix(dst.first_address(), dst.network_length());
                }
                if let Some(index) = spec.if_index {
                    builder = builder.output_interface(index);
                }
                if let Some(IpAddr::V6(gw)) = spec.gateway {
                    builder = builder.gateway(gw);
                }
                if let Some(priority) = spec.priority {
                    builder = builder.priority(priority);
                }
                builder.build()
            }
        };
        if spec.kind == RouteKind::Prohibit {
            msg.header.kind = RouteType::Prohibit;
        }
        msg
    }

    fn route_message_to_spec(msg: &RouteMessage) -> Option<RouteSpec> {
        let family = match msg.header.address_family {
            AddressFamily::Inet => Family::V4,
            AddressFamily::Inet6 => Family::V6,
            _ => return None,
        };

        let table = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Table(id) => Some(*id),
                _ => None,
            })
            .unwrap_or(msg.header.table as u32);

        let dst_addr = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Destination(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
            RouteAttribute::Destination(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
            _ => None,
        });
        let destination = match dst_addr {
            Some(ip) => Some(IpCidr::new(ip, msg.header.destination_prefix_length).ok()?),
            None => None,
        };

        let gateway = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Gateway(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
            RouteAttribute::Gateway(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
            _ => None,
        });

        let if_index = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Oif(idx) => Some(*idx),
            _ => None,
        });

        let priority = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Priority(p) => Some(*p),
            _ => None,
        });

        let kind = match msg.header.kind {
            RouteType::Unicast => RouteKind::Unicast,
            RouteType::Prohibit => RouteKind::Prohibit,
            _ => RouteKind::Other,
        };

        Some(RouteSpec {
            family,
            table,
            destination,
            gateway,
            if_index,
            priority,
            kind,
        })
    }

    fn rule_message_to_spec(msg: &RuleMessage) -> Option<RuleSpec> {
        let family = match msg.header.family {
            AddressFamily::Inet => Family::V4,
            AddressFamily::Inet6 => Family::V6,
            _ => return None,
        };

        let table = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RuleAttribute::Table(id) => Some(*id),
                _ => None,
            })
            .unwrap_or(msg.header.table as u32);

        let priority = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RuleAttribute::Priority(p) => Some(*p),
                _ => None,
            })
            .unwrap_or(0);

        let selector = msg.attributes.iter().find_map(|a| match a {
            RuleAttribute::UidRange(range) => Some(RuleSelector::UidRange(range.start, range.end)),
            RuleAttribute::Iifname(name) => Some(RuleSelector::InboundIface(name.clone())),
            _ => None,
        });

        let action = match msg.header.action {
            NlRuleAction::Prohibit => RuleAction::Prohibit,
            _ => RuleAction::Lookup,
        };

        Some(RuleSpec {
            family,
            table,
            priority,
            selector,
            action,
        })
    }

    async fn rule_messages(&self, family: Family) -> Result<Vec<RuleMessage>, Error> {
        self.handle
            .rule()
            .get(family.ip_version())
            .execute()
            .try_collect()
            .await
            .map_err(|e| Error::netlink("rule dump", "", e))
    }

    async fn finish_rule_add<T>(mut req: rtnetlink::RuleAddRequest<T>, rule: &RuleSpec) -> Result<(), Error> {
        req = req.table_id(rule.table).priority(rule.priority).action(match rule.action {
            RuleAction::Lookup => NlRuleAction::ToTable,
            RuleAction::Prohibit => NlRuleAction::Prohibit,
        });
        match &rule.selector {
            Some(RuleSelector::InboundIface(name)) => {
                req = req.input_interface(name.clone());
            }
            Some(RuleSelector::UidRange(lo, hi)) => {
                req.message_mut()
                    .attributes
                    .push(RuleAttribute::UidRange(RuleUidRange { start: *lo, end: *hi }));
            }
            None => {}
        }
        req.execute()
            .await
            .map_err(|e| Error::netlink("rule add", format!("{rule:?}"), e))
    }
}

#[async_trait]
impl NetlinkOps for RealNetlinkOps {
    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error> {
        let links: Vec<_> = self
            .handle
            .link()
            .get()
            .execute()
            .try_collect()
            .await
            .map_err(|e| Error::netlink("link dump", "", e))?;

        Ok(links
            .iter()
            .filter_map(|link| {
                let name = link.attributes.iter().find_map(|a| match a {
                    LinkAttribute::IfName(n) => Some(n.clone()),
                    _ => None,
                })?;
                Some(LinkInfo {
                    index: link.header.index,
                    name,
                })
            })
            .collect())
    }

    async fn link_add_veth(&self, name: &str, peer: &str) -> Result<(), Error> {
        self.handle
            .link()
            .add(LinkMessageBuilder::<LinkVeth>::new(name, peer).build())
            .execute()
            .await
            .map_err(|e| Error::netlink("link add veth", format!("{name}/{peer}"), e))
    }

    async fn link_add_wireguard(&self, name: &str) -> Result<(), Error> {
        self.handle
            .link()
            .add(LinkMessageBuilder::<LinkWireguard>::new(name).build())
            .execute()
            .await
            .map_err(|e| Error::netlink("link add wireguard", name, e))
    }

    async fn link_del(&self, index: u32) -> Result<(), Error> {
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| Error::netlink("link del", index, e))
    }

    async fn link_set_up(&self, index: u32) -> Result<(), Error> {
        self.handle
            .link()
            .set(LinkMessageBuilder::<LinkUnspec>::new().index(index).up().build())
            .execute()
            .await
            .map_err(|e| Error::netlink("link set up", index, e))
    }

    async fn link_set_ns(&self, index: u32, ns_name: &str) -> Result<(), Error> {
        let ns_file = std::fs::File::open(format!("{NETNS_DIR}/{ns_name}"))?;
        self.handle
            .link()
            .set(
                LinkMessageBuilder::<LinkUnspec>::new()
                    .index(index)
                    .setns_by_fd(ns_file.as_raw_fd())
                    .build(),
            )
            .execute()
            .await
            .map_err(|e| Error::netlink("link set netns", format!("{index} -> {ns_name}"), e))
    }

    async fn addr_add(&self, index: u32, addr: IpAddr, prefix_len: u8) -> Result<(), Error> {
        self.handle
            .address()
            .add(index, addr, prefix_len)
            .execute()
            .await
            .map_err(|e| Error::netlink("addr add", format!("{addr}/{prefix_len} dev {index}"), e))
    }

    async fn addr_list(&self) -> Result<Vec<AddrInfo>, Error> {
        let addrs: Vec<_> = self
            .handle
            .address()
            .get()
            .execute()
            .try_collect()
            .await
            .map_err(|e| Error::netlink("addr dump", "", e))?;

        Ok(addrs
            .iter()
            .filter_map(|addr| {
                let ip = addr.attributes.iter().find_map(|a| match a {
                    AddressAttribute::Address(ip) => Some(*ip),
                    _ => None,
                })?;
                Some(AddrInfo {
                    if_index: addr.header.index,
                    addr: ip,
                    prefix_len: addr.header.prefix_len,
                })
            })
            .collect())
    }

    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        let msg = Self::build_route_message(route);
        self.handle
            .route()
            .add(msg)
            .execute()
            .await
            .map_err(|e| Error::netlink("route add", format!("{route:?}"), e))
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
        let msg = Self::build_route_message(route);
        self.handle
            .route()
            .del(msg)
            .execute()
            .await
            .map_err(|e| Error::netlink("route del", format!("{route:?}"), e))
    }

    async fn route_list(&self, family: Family, table: Option<u32>) -> Result<Vec<RouteSpec>, Error> {
        let msg = match family {
            Family::V4 => RouteMessageBuilder::<Ipv4Addr>::new().build(),
            Family::V6 => RouteMessageBuilder::<Ipv6Addr>::new().build(),
        };
        let routes: Vec<_> = self
            .handle
            .route()
            .get(msg)
            .execute()
            .try_collect()
            .await
            .map_err(|e| Error::netlink("route dump", "", e))?;

        Ok(routes
            .iter()
            .filter_map(Self::route_message_to_spec)
            .filter(|r| table.is_none_or(|t| r.table == t))
            .collect())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error> {
        let req = self.handle.rule().add();
        match rule.family {
            Family::V4 => Self::finish_rule_add(req.v4(), rule).await,
            Family::V6 => Self::finish_rule_add(req.v6(), rule).await,
        }
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error> {
        for msg in self.rule_messages(rule.family).await? {
            if Self::rule_message_to_spec(&msg).as_ref() == Some(rule) {
                return self
                    .handle
                    .rule()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(|e| Error::netlink("rule del", format!("{rule:?}"), e));
            }
        }
        Err(Error::NotFound(format!("rule {rule:?}")))
    }

    async fn rule_list(&self, family: Family) -> Result<Vec<RuleSpec>, Error> {
        Ok(self
            .rule_messages(family)
            .await?
            .iter()
            .filter_map(Self::rule_message_to_spec)
            .collect())
    }

    async fn ns_add(&self, name: &str) -> Result<(), Error> {
        rtnetlink::NetworkNamespace::add(name.to_string())
            .await
            .map_err(|e| Error::netlink("netns add", name, e))
    }

    async fn ns_del(&self, name: &str) -> Result<(), Error> {
        rtnetlink::NetworkNamespace::del(name.to_string())
            .await
            .map_err(|e| Error::netlink("netns del", name, e))
    }

    async fn ns_list(&self) -> Result<Vec<String>, Error> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(NETNS_DIR).await {
            Ok(entries) => entries,
            // No namespace has ever been created on this host.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    /// The netlink socket is bound to the namespace that is current at socket
    /// creation time, so the scratch thread enters the namespace, opens the
    /// connection, and switches back before it is returned to the pool.
    async fn ns_open(&self, name: &str) -> Result<Self, Error> {
        let ns_file = std::fs::File::open(format!("{NETNS_DIR}/{name}"))?;
        let joined = tokio::task::spawn_blocking(move || -> Result<_, Error> {
            let host_ns = std::fs::File::open("/proc/self/ns/net")?;
            nix::sched::setns(ns_file.as_fd(), nix::sched::CloneFlags::CLONE_NEWNET)
                .map_err(std::io::Error::from)?;
            let connection = rtnetlink::new_connection();
            let restore = nix::sched::setns(host_ns.as_fd(), nix::sched::CloneFlags::CLONE_NEWNET)
                .map_err(std::io::Error::from);
            let (conn, handle, _) = connection?;
            restore?;
            Ok((conn, handle))
        })
        .await;

        let (conn, handle) = match joined {
            Ok(result) => result?,
            Err(error) => {
                tracing::error!(%error, "namespace socket thread panicked");
                return Err(Error::State("namespace socket thread panicked"));
            }
        };

        tokio::task::spawn(conn);
        Ok(Self::new(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_is_symmetric_and_family_aware() -> anyhow::Result<()> {
        let lan: IpCidr = "192.168.1.0/24".parse()?;
        let host: IpCidr = "192.168.1.17/32".parse()?;
        let other: IpCidr = "10.0.0.0/8".parse()?;
        let v6: IpCidr = "2001:db8::/32".parse()?;

        assert!(nets_overlap(&lan, &host));
        assert!(nets_overlap(&host, &lan));
        assert!(!nets_overlap(&lan, &other));
        assert!(!nets_overlap(&lan, &v6));
        Ok(())
    }

    #[test]
    fn route_spec_default_has_no_destination() {
        let spec = RouteSpec::unicast(Family::V4, 10111);
        assert_eq!(spec.destination, None);
        assert_eq!(spec.kind, RouteKind::Unicast);
    }
}
