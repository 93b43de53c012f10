//! Policy routing through a dedicated network namespace.
//!
//! The namespace is wired to the host with a veth pair on a private /30:
//! the host side carries the first usable address, the namespace side the
//! second, and the namespace's default route points at the host side. An
//! inbound-interface rule then steers everything arriving over the veth into
//! the engine's table.

use cidr::Ipv4Cidr;

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use crate::alloc;
use crate::error::Error;
use crate::firewall::FirewallOps;
use crate::netlink::{Family, NetlinkOps, RT_TABLE_MAIN, RouteSpec, RuleAction, RuleSelector, RuleSpec};

use super::{PolicyEnv, RULE_PRIORITY};

/// Where the glibc resolver looks for per-namespace configuration.
const NETNS_ETC: &str = "/etc/netns";

#[derive(Debug, Default)]
struct NamespaceState {
    ns_created: bool,
    outer: Option<(String, u32)>,
    inner_name: Option<String>,
    subnet: Option<Ipv4Cidr>,
    resolv_dir: Option<PathBuf>,
    rules: Vec<RuleSpec>,
    masquerade: Option<(String, String, bool)>,
}

/// Creates a fresh network namespace, wires it to the host and steers its
/// traffic into the engine's table.
#[derive(Debug)]
pub struct NamespacePolicy {
    ns_name: String,
    dns: Vec<IpAddr>,
    killswitch: bool,
    ipv6: bool,
    state: NamespaceState,
}

impl NamespacePolicy {
    pub fn new(ns_name: String, dns: Vec<IpAddr>, killswitch: bool, ipv6: bool) -> Self {
        Self {
            ns_name,
            dns,
            killswitch,
            ipv6,
            state: NamespaceState::default(),
        }
    }

    pub fn ns_name(&self) -> &str {
        &self.ns_name
    }

    /// Ordering matters throughout: the namespace must exist before the veth
    /// peer can move into it, addresses must exist before the links come up,
    /// the in-namespace default route needs the host side reachable, and the
    /// rule references the outer link by name.
    pub(super) async fn up<N: NetlinkOps, F: FirewallOps>(
        &mut self,
        netlink: &N,
        firewall: &F,
        env: &PolicyEnv,
    ) -> Result<(), Error> {
        netlink.ns_add(&self.ns_name).await?;
        self.state.ns_created = true;

        let outer_name = alloc::find_free_link_name(netlink, alloc::NAME_BASE).await?;
        let inner_name = alloc::NAME_BASE.to_string();
        netlink.link_add_veth(&outer_name, &inner_name).await?;
        // The pair was created; record the outer end before anything else can
        // fail so a partial teardown removes both ends.
        let outer_index = netlink
            .link_index(&outer_name)
            .await?
            .ok_or_else(|| Error::NotFound(outer_name.clone()))?;
        self.state.outer = Some((outer_name.clone(), outer_index));
        self.state.inner_name = Some(inner_name.clone());

        let inner_index = netlink
            .link_index(&inner_name)
            .await?
            .ok_or_else(|| Error::NotFound(inner_name.clone()))?;
        netlink.link_set_ns(inner_index, &self.ns_name).await?;

        let subnet = alloc::find_unallocated_ipv4_subnet(netlink, 30).await?;
        self.state.subnet = Some(subnet);
        let (host_addr, ns_addr) = endpoints(&subnet);

        netlink.addr_add(outer_index, IpAddr::V4(host_addr), 30).await?;

        let ns_netlink = netlink.ns_open(&self.ns_name).await?;
        // The index may change when a link crosses namespaces; resolve again.
        let inner_index = ns_netlink
            .link_index(&inner_name)
            .await?
            .ok_or_else(|| Error::NotFound(inner_name.clone()))?;
        ns_netlink.addr_add(inner_index, IpAddr::V4(ns_addr), 30).await?;

        netlink.link_set_up(outer_index).await?;
        if let Some(lo) = ns_netlink.link_index("lo").await? {
            ns_netlink.link_set_up(lo).await?;
        }
        ns_netlink.link_set_up(inner_index).await?;

        ns_netlink
            .route_add(&RouteSpec {
                gateway: Some(IpAddr::V4(host_addr)),
                if_index: Some(inner_index),
                ..RouteSpec::unicast(Family::V4, RT_TABLE_MAIN)
            })
            .await?;

        let mut families = vec![Family::V4];
        if self.ipv6 {
            families.push(Family::V6);
        }
        for family in &families {
            let rule = RuleSpec {
                family: *family,
                table: env.table,
                priority: RULE_PRIORITY,
                selector: Some(RuleSelector::InboundIface(outer_name.clone())),
                action: RuleAction::Lookup,
            };
            netlink.rule_add(&rule).await?;
            self.state.rules.push(rule);
        }
        if self.killswitch {
            for family in &families {
                let rule = RuleSpec {
                    family: *family,
                    table: env.table,
                    priority: RULE_PRIORITY + 1,
                    selector: Some(RuleSelector::InboundIface(outer_name.clone())),
                    action: RuleAction::Prohibit,
                };
                netlink.rule_add(&rule).await?;
                self.state.rules.push(rule);
            }
        }

        if !self.dns.is_empty() {
            let dir = write_resolv_conf(Path::new(NETNS_ETC), &self.ns_name, &self.dns).await?;
            self.state.resolv_dir = Some(dir);
        }

        firewall
            .masquerade_add(&env.tunnel_iface, &inner_name, self.ipv6)
            .await?;
        self.state.masquerade = Some((env.tunnel_iface.clone(), inner_name, self.ipv6));

        tracing::info!(
            ns = %self.ns_name,
            outer = %outer_name,
            subnet = %subnet,
            killswitch = self.killswitch,
            "namespace policy applied"
        );
        Ok(())
    }

    pub(super) async fn down<N: NetlinkOps, F: FirewallOps>(
        &mut self,
        netlink: &N,
        firewall: &F,
    ) -> Result<(), Error> {
        let mut first_error: Option<Error> = None;
        let mut note = |result: Result<(), Error>, what: &str| {
            match result {
                Ok(()) => {}
                Err(Error::NotFound(_)) => {}
                Err(error) => {
                    tracing::warn!(%error, "failed to {what}, continuing anyway");
                    first_error.get_or_insert(error);
                }
            }
        };

        if let Some((iface, tag, ipv6)) = self.state.masquerade.take() {
            note(firewall.masquerade_del(&iface, &tag, ipv6).await, "remove masquerade entry");
        }

        for rule in std::mem::take(&mut self.state.rules).into_iter().rev() {
            note(netlink.rule_del(&rule).await, "delete namespace rule");
        }

        // Deleting the outer end removes the peer inside the namespace too.
        if let Some((_, outer_index)) = self.state.outer.take() {
            note(netlink.link_del(outer_index).await, "delete veth pair");
        }

        if self.state.ns_created {
            self.state.ns_created = false;
            note(netlink.ns_del(&self.ns_name).await, "delete namespace");
        }

        if let Some(dir) = self.state.resolv_dir.take() {
            note(
                tokio::fs::remove_dir_all(&dir).await.map_err(Error::from),
                "remove resolver configuration",
            );
        }

        self.state.inner_name = None;
        self.state.subnet = None;

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Host side gets the first usable address of the /30, namespace side the
/// second.
fn endpoints(subnet: &Ipv4Cidr) -> (Ipv4Addr, Ipv4Addr) {
    let base = u32::from(subnet.first_address());
    (Ipv4Addr::from(base + 1), Ipv4Addr::from(base + 2))
}

/// Writes `nameserver` lines for the namespace; the resolver picks the file
/// up automatically for processes running inside it.
async fn write_resolv_conf(base: &Path, ns_name: &str, servers: &[IpAddr]) -> Result<PathBuf, Error> {
    let dir = base.join(ns_name);
    tokio::fs::create_dir_all(&dir).await?;

    let mut content = String::new();
    for server in servers {
        content.push_str(&format!("nameserver {server}\n"));
    }
    tokio::fs::write(dir.join("resolv.conf"), content).await?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockFirewallOps, MockNetlinkOps};

    fn env() -> PolicyEnv {
        PolicyEnv {
            table: 10111,
            tunnel_iface: "wg0".into(),
            ipv6: false,
        }
    }

    fn policy() -> NamespacePolicy {
        NamespacePolicy::new("wepwawet0".into(), vec![], false, false)
    }

    #[tokio::test]
    async fn up_wires_namespace_veth_and_rule() {
        let netlink = MockNetlinkOps::new();
        netlink.add_link("lo");
        netlink.add_link("wg0");
        let firewall = MockFirewallOps::new();
        let mut policy = policy();

        policy.up(&netlink, &firewall, &env()).await.unwrap();

        let state = netlink.state.lock().unwrap();
        // Outer end stays on the host, inner end moved into the namespace.
        assert!(state.host.links.iter().any(|l| l.name == "wepwawet0"));
        assert!(!state.host.links.iter().any(|l| l.name == "wepwawet"));
        let ns = state.namespaces.get("wepwawet0").unwrap();
        assert!(ns.links.iter().any(|l| l.name == "wepwawet"));

        // /30 endpoints: host side .1, namespace side .2.
        let host_addr = state.host.addrs.iter().find(|a| a.prefix_len == 30).unwrap();
        assert_eq!(host_addr.addr, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(ns.addrs[0].addr, "10.0.0.2".parse::<IpAddr>().unwrap());

        // Default route inside the namespace points at the host side.
        let default = ns.routes.iter().find(|r| r.destination.is_none()).unwrap();
        assert_eq!(default.gateway, Some("10.0.0.1".parse().unwrap()));

        // One inbound-interface rule, IPv4 only (ipv6 disabled).
        assert_eq!(state.host.rules.len(), 1);
        let rule = &state.host.rules[0];
        assert_eq!(rule.selector, Some(RuleSelector::InboundIface("wepwawet0".into())));
        assert_eq!(rule.table, 10111);
        assert_eq!(rule.priority, RULE_PRIORITY);

        // Masquerade tagged with the namespace-side veth name.
        let fw = firewall.state.lock().unwrap();
        assert_eq!(fw.entries.len(), 1);
        assert_eq!(fw.entries[0].iface, "wg0");
        assert_eq!(fw.entries[0].tag, "wepwawet");
    }

    #[tokio::test]
    async fn killswitch_adds_prohibit_rules() {
        let netlink = MockNetlinkOps::new();
        netlink.add_link("lo");
        let firewall = MockFirewallOps::new();
        let mut policy = NamespacePolicy::new("wepwawet0".into(), vec![], true, true);

        policy.up(&netlink, &firewall, &env()).await.unwrap();

        let state = netlink.state.lock().unwrap();
        // v4 + v6 lookup, v4 + v6 prohibit.
        assert_eq!(state.host.rules.len(), 4);
        for family in [Family::V4, Family::V6] {
            let lookup = state
                .host
                .rules
                .iter()
                .find(|r| r.family == family && r.action == RuleAction::Lookup)
                .unwrap();
            let prohibit = state
                .host
                .rules
                .iter()
                .find(|r| r.family == family && r.action == RuleAction::Prohibit)
                .unwrap();
            assert_eq!(prohibit.priority, lookup.priority + 1);
        }
    }

    #[tokio::test]
    async fn down_restores_the_host() {
        let netlink = MockNetlinkOps::new();
        netlink.add_link("lo");
        netlink.add_link("wg0");
        let firewall = MockFirewallOps::new();
        let mut policy = policy();

        let links_before = netlink.state.lock().unwrap().host.links.clone();
        policy.up(&netlink, &firewall, &env()).await.unwrap();
        policy.down(&netlink, &firewall).await.unwrap();

        let state = netlink.state.lock().unwrap();
        assert_eq!(state.host.links, links_before);
        assert!(state.host.rules.is_empty());
        assert!(state.namespaces.is_empty());
        assert!(firewall.state.lock().unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn failed_up_leaves_cleanable_state() {
        let netlink = MockNetlinkOps::new();
        netlink.add_link("lo");
        netlink.fail_on("rule_add", "simulated rule failure");
        let firewall = MockFirewallOps::new();
        let mut policy = policy();

        assert!(policy.up(&netlink, &firewall, &env()).await.is_err());
        policy.down(&netlink, &firewall).await.unwrap();

        let state = netlink.state.lock().unwrap();
        assert!(!state.host.links.iter().any(|l| l.name.starts_with("wepwawet")));
        assert!(state.namespaces.is_empty());
        assert!(firewall.state.lock().unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn second_namespace_gets_distinct_resources() {
        let netlink = MockNetlinkOps::new();
        netlink.add_link("lo");
        let firewall = MockFirewallOps::new();

        let mut first = NamespacePolicy::new("wepwawet0".into(), vec![], false, false);
        let mut second = NamespacePolicy::new("wepwawet1".into(), vec![], false, false);
        first.up(&netlink, &firewall, &env()).await.unwrap();
        second.up(&netlink, &firewall, &env()).await.unwrap();

        let state = netlink.state.lock().unwrap();
        let outer_names: Vec<&str> = state
            .host
            .links
            .iter()
            .filter(|l| l.name.starts_with(alloc::NAME_BASE))
            .map(|l| l.name.as_str())
            .collect();
        assert_eq!(outer_names, ["wepwawet0", "wepwawet1"]);

        let first_subnet = first.state.subnet.unwrap();
        let second_subnet = second.state.subnet.unwrap();
        assert_ne!(first_subnet, second_subnet);
    }

    #[tokio::test]
    async fn resolv_conf_lists_every_server() {
        let base = tempfile::tempdir().unwrap();
        let servers: Vec<IpAddr> = vec!["1.1.1.1".parse().unwrap(), "2606:4700::1111".parse().unwrap()];

        let dir = write_resolv_conf(base.path(), "wepwawet0", &servers).await.unwrap();

        let content = std::fs::read_to_string(dir.join("resolv.conf")).unwrap();
        assert_eq!(content, "nameserver 1.1.1.1\nnameserver 2606:4700::1111\n");
    }

    #[test]
    fn thirty_bit_endpoints() {
        let subnet: Ipv4Cidr = "192.168.7.8/30".parse().unwrap();
        let (host, ns) = endpoints(&subnet);
        assert_eq!(host, Ipv4Addr::new(192, 168, 7, 9));
        assert_eq!(ns, Ipv4Addr::new(192, 168, 7, 10));
    }
}
