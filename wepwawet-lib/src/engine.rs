//! The policy-routing engine.
//!
//! Materialises one routing table over a tunnel interface, re-routes
//! exemption networks over their original next hop, composes an ordered list
//! of policies, and guarantees that everything it created is released on any
//! exit path. Masquerade entries are tagged with the tunnel interface name
//! so teardown and the orphan collector can correlate them.

use cidr::IpCidr;

use crate::alloc;
use crate::error::Error;
use crate::firewall::FirewallOps;
use crate::netlink::{Family, NetlinkOps, RouteKind, RouteSpec};
use crate::policy::{Policy, PolicyEnv};

/// Metric for the IPv6 default route in the tunnel table.
const V6_DEFAULT_METRIC: u32 = 100;

/// Side effects applied so far, in application order. Released in reverse.
#[derive(Debug, Default)]
struct Applied {
    masquerades: Vec<(String, String, bool)>,
    policies_entered: usize,
}

#[derive(Debug)]
enum EngineState {
    Created,
    Active(Applied),
    Terminated,
}

/// A routing context over one tunnel interface and one routing table.
///
/// Lifecycle: `up()` moves Created -> Active, `down()` moves Active ->
/// Terminated. Re-entry is not permitted; `down()` on a non-active engine is
/// a no-op so scope guards may call it unconditionally.
pub struct RoutingEngine<N: NetlinkOps, F: FirewallOps> {
    netlink: N,
    firewall: F,
    interface: String,
    table: u32,
    ipv6: bool,
    /// Networks that bypass the tunnel over their original next hop.
    exemption_nets: Vec<IpCidr>,
    /// When non-empty, only these networks are routed through the tunnel
    /// instead of a default route.
    tunnel_nets: Vec<IpCidr>,
    policies: Vec<Policy>,
    state: EngineState,
}

impl<N: NetlinkOps, F: FirewallOps> RoutingEngine<N, F> {
    pub fn new(netlink: N, firewall: F, interface: impl Into<String>, table: u32, ipv6: bool) -> Self {
        Self {
            netlink,
            firewall,
            interface: interface.into(),
            table,
            ipv6,
            exemption_nets: Vec::new(),
            tunnel_nets: Vec::new(),
            policies: Vec::new(),
            state: EngineState::Created,
        }
    }

    pub fn with_exemption_nets(mut self, nets: Vec<IpCidr>) -> Self {
        self.exemption_nets = nets;
        self
    }

    pub fn with_tunnel_nets(mut self, nets: Vec<IpCidr>) -> Self {
        self.tunnel_nets = nets;
        self
    }

    pub fn with_policies(mut self, policies: Vec<Policy>) -> Self {
        self.policies = policies;
        self
    }

    pub fn table(&self) -> u32 {
        self.table
    }

    /// The masquerade tag of this engine.
    pub fn tag(&self) -> &str {
        &self.interface
    }

    /// Bring the routing context up.
    ///
    /// The first failing step aborts the sequence, tears down everything
    /// already applied, and surfaces the error.
    pub async fn up(&mut self) -> Result<(), Error> {
        match self.state {
            EngineState::Created => {}
            EngineState::Active(_) => return Err(Error::State("routing context is already active")),
            EngineState::Terminated => return Err(Error::State("routing context cannot be re-entered")),
        }

        if alloc::is_table_in_use(&self.netlink, self.table).await? {
            return Err(Error::Allocation(format!("routing table {} is already in use", self.table)));
        }

        // Clear residue a crashed previous run may have left in the table.
        for family in [Family::V4, Family::V6] {
            let _ = self.netlink.flush_rules(self.table, family).await;
            let _ = self.netlink.flush_routes(self.table, family).await;
        }

        let tunnel_index = self
            .netlink
            .link_index(&self.interface)
            .await?
            .ok_or_else(|| Error::NotFound(self.interface.clone()))?;

        let mut applied = Applied::default();
        if let Err(error) = self.apply(tunnel_index, &mut applied).await {
            tracing::warn!(%error, "bring-up failed, tearing down partial state");
            if let Some(teardown_error) = self.release(&mut applied).await {
                tracing::warn!(error = %teardown_error, "partial teardown incomplete");
            }
            self.state = EngineState::Terminated;
            return Err(error);
        }

        self.state = EngineState::Active(applied);
        tracing::info!(table = self.table, interface = %self.interface, "routing context is up");
        Ok(())
    }

    /// Tear the routing context down.
    ///
    /// Every release step is attempted regardless of earlier failures; the
    /// first error encountered is returned once all steps ran. Calling this
    /// again afterwards does nothing.
    pub async fn down(&mut self) -> Result<(), Error> {
        let mut applied = match std::mem::replace(&mut self.state, EngineState::Terminated) {
            EngineState::Active(applied) => applied,
            EngineState::Created | EngineState::Terminated => return Ok(()),
        };

        let result = match self.release(&mut applied).await {
            Some(error) => Err(error),
            None => Ok(()),
        };
        tracing::info!(table = self.table, interface = %self.interface, "routing context is down");
        result
    }

    /// Run the blocking part of each policy in declaration order; yields the
    /// last child exit code, if any policy produced one.
    pub async fn action(&mut self) -> Result<Option<i32>, Error> {
        if !matches!(self.state, EngineState::Active(_)) {
            return Err(Error::State("routing context is not active"));
        }
        let mut last_code = None;
        for policy in &mut self.policies {
            if let Some(code) = policy.action().await? {
                last_code = Some(code);
            }
        }
        Ok(last_code)
    }

    async fn apply(&mut self, tunnel_index: u32, applied: &mut Applied) -> Result<(), Error> {
        self.apply_exemptions(applied).await?;
        self.populate_table(tunnel_index, applied).await?;

        let tag = self.interface.clone();
        self.firewall.masquerade_add(&self.interface, &tag, self.ipv6).await?;
        applied.masquerades.push((self.interface.clone(), tag, self.ipv6));

        let env = PolicyEnv {
            table: self.table,
            tunnel_iface: self.interface.clone(),
            ipv6: self.ipv6,
        };
        for policy in &mut self.policies {
            // Count the policy as entered first: a half-applied policy still
            // needs its `down` during rollback.
            applied.policies_entered += 1;
            policy.up(&self.netlink, &self.firewall, &env).await?;
        }
        Ok(())
    }

    /// Clone the existing route of every exemption network into the tunnel
    /// table and masquerade on its egress interface.
    async fn apply_exemptions(&mut self, applied: &mut Applied) -> Result<(), Error> {
        for net in &self.exemption_nets {
            let family = Family::of_net(net);
            if family == Family::V6 && !self.ipv6 {
                // The IPv6 prohibit default covers these.
                tracing::debug!(%net, "skipping IPv6 exemption network, IPv6 is disabled");
                continue;
            }

            let Some(route) = self.netlink.route_for_destination(net).await? else {
                tracing::warn!(%net, "no existing route overlaps exemption network, skipping");
                continue;
            };

            self.netlink
                .route_add(&RouteSpec {
                    destination: Some(*net),
                    gateway: route.gateway,
                    if_index: route.if_index,
                    ..RouteSpec::unicast(family, self.table)
                })
                .await?;

            if let Some(if_index) = route.if_index {
                let iface = self.iface_name(if_index).await?;
                let tag = self.interface.clone();
                self.firewall.masquerade_add(&iface, &tag, self.ipv6).await?;
                applied.masquerades.push((iface, tag, self.ipv6));
            }
        }
        Ok(())
    }

    async fn populate_table(&mut self, tunnel_index: u32, applied: &mut Applied) -> Result<(), Error> {
        if self.tunnel_nets.is_empty() {
            self.netlink
                .route_add(&RouteSpec {
                    if_index: Some(tunnel_index),
                    ..RouteSpec::unicast(Family::V4, self.table)
                })
                .await?;
            if self.ipv6 {
                self.netlink
                    .route_add(&RouteSpec {
                        if_index: Some(tunnel_index),
                        priority: Some(V6_DEFAULT_METRIC),
                        ..RouteSpec::unicast(Family::V6, self.table)
                    })
                    .await?;
            }
        } else {
            // Route only the configured networks through the tunnel; other
            // traffic keeps leaving via its usual interfaces, NATed.
            for net in &self.tunnel_nets {
                let family = Family::of_net(net);
                if family == Family::V6 && !self.ipv6 {
                    tracing::debug!(%net, "skipping IPv6 tunnel network, IPv6 is disabled");
                    continue;
                }
                self.netlink
                    .route_add(&RouteSpec {
                        destination: Some(*net),
                        if_index: Some(tunnel_index),
                        ..RouteSpec::unicast(family, self.table)
                    })
                    .await?;
            }
            for link in self.netlink.link_list().await? {
                if link.name == self.interface
                    || link.name == "lo"
                    || link.name.starts_with(alloc::NAME_BASE)
                {
                    continue;
                }
                let tag = self.interface.clone();
                self.firewall.masquerade_add(&link.name, &tag, self.ipv6).await?;
                applied.masquerades.push((link.name, tag, self.ipv6));
            }
        }

        if !self.ipv6 {
            // Blackhole all IPv6 traffic steered into this table.
            self.netlink
                .route_add(&RouteSpec {
                    kind: RouteKind::Prohibit,
                    ..RouteSpec::unicast(Family::V6, self.table)
                })
                .await?;
        }
        Ok(())
    }

    /// Release in reverse application order. Returns the first error after
    /// attempting every step.
    async fn release(&mut self, applied: &mut Applied) -> Option<Error> {
        let mut first_error: Option<Error> = None;

        for policy in self.policies[..applied.policies_entered].iter_mut().rev() {
            if let Err(error) = policy.down(&self.netlink, &self.firewall).await {
                tracing::warn!(%error, "policy teardown failed, continuing anyway");
                first_error.get_or_insert(error);
            }
        }
        applied.policies_entered = 0;

        for (iface, tag, ipv6) in applied.masquerades.drain(..).rev() {
            if let Err(error) = self.firewall.masquerade_del(&iface, &tag, ipv6).await {
                tracing::warn!(%error, iface, "failed to remove masquerade entry, continuing anyway");
                first_error.get_or_insert(error);
            }
        }

        for family in [Family::V4, Family::V6] {
            if let Err(error) = self.netlink.flush_routes(self.table, family).await {
                tracing::warn!(%error, "failed to flush routes, continuing anyway");
                first_error.get_or_insert(error);
            }
            if let Err(error) = self.netlink.flush_rules(self.table, family).await {
                tracing::warn!(%error, "failed to flush rules, continuing anyway");
                first_error.get_or_insert(error);
            }
        }

        first_error
    }

    async fn iface_name(&self, if_index: u32) -> Result<String, Error> {
        self.netlink
            .link_list()
            .await?
            .into_iter()
            .find(|l| l.index == if_index)
            .map(|l| l.name)
            .ok_or_else(|| Error::NotFound(format!("interface index {if_index}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockFirewallOps, MockNetlinkOps, snapshot};
    use crate::netlink::{RuleAction, RuleSelector, RuleSpec};
    use crate::policy::{NamespacePolicy, UserRangePolicy};

    const TABLE: u32 = 10111;

    fn host_with_wg0() -> MockNetlinkOps {
        let netlink = MockNetlinkOps::new();
        netlink.add_link("lo");
        let eth0 = netlink.add_link("eth0");
        netlink.add_link("wg0");
        netlink.add_addr(eth0, "192.168.1.100".parse().unwrap(), 24);
        netlink.add_route(RouteSpec {
            destination: Some("192.168.1.0/24".parse().unwrap()),
            gateway: Some("192.168.1.1".parse().unwrap()),
            if_index: Some(eth0),
            ..RouteSpec::unicast(Family::V4, 254)
        });
        netlink
    }

    fn engine(netlink: &MockNetlinkOps, firewall: &MockFirewallOps) -> RoutingEngine<MockNetlinkOps, MockFirewallOps> {
        RoutingEngine::new(netlink.clone(), firewall.clone(), "wg0", TABLE, false)
    }

    // Scenario: uid-range split tunnel with killswitch, IPv6 disabled.
    #[tokio::test]
    async fn uid_range_split_tunnel() {
        let netlink = host_with_wg0();
        let firewall = MockFirewallOps::new();
        let mut engine = engine(&netlink, &firewall)
            .with_policies(vec![Policy::UserRange(UserRangePolicy::new(1000, 1000, true))]);

        engine.up().await.unwrap();

        {
            let state = netlink.state.lock().unwrap();
            let wg0 = 3; // lo=1, eth0=2, wg0=3

            let v4_default = state
                .host
                .routes
                .iter()
                .find(|r| r.table == TABLE && r.family == Family::V4 && r.destination.is_none())
                .unwrap();
            assert_eq!(v4_default.if_index, Some(wg0));
            assert_eq!(v4_default.kind, RouteKind::Unicast);

            let v6_default = state
                .host
                .routes
                .iter()
                .find(|r| r.table == TABLE && r.family == Family::V6)
                .unwrap();
            assert_eq!(v6_default.kind, RouteKind::Prohibit);

            let uid_rules: Vec<&RuleSpec> = state.host.rules.iter().filter(|r| r.table == TABLE).collect();
            assert_eq!(uid_rules.len(), 4);
            for family in [Family::V4, Family::V6] {
                assert!(uid_rules.iter().any(|r| r.family == family
                    && r.priority == 100
                    && r.action == RuleAction::Lookup
                    && r.selector == Some(RuleSelector::UidRange(1000, 1000))));
                assert!(uid_rules.iter().any(|r| r.family == family
                    && r.priority == 101
                    && r.action == RuleAction::Prohibit));
            }

            let fw = firewall.state.lock().unwrap();
            assert_eq!(fw.entries.len(), 1);
            assert_eq!(fw.entries[0].iface, "wg0");
            assert_eq!(fw.entries[0].tag, "wg0");
            assert!(!fw.entries[0].ipv6);
        }

        engine.down().await.unwrap();
        let state = netlink.state.lock().unwrap();
        assert!(!state.host.routes.iter().any(|r| r.table == TABLE));
        assert!(!state.host.rules.iter().any(|r| r.table == TABLE));
        assert!(firewall.state.lock().unwrap().entries.is_empty());
    }

    // Scenario: exemption network keeps its original next hop and gets NAT.
    #[tokio::test]
    async fn exemption_route_is_cloned_and_masqueraded() {
        let netlink = host_with_wg0();
        let firewall = MockFirewallOps::new();
        let mut engine = engine(&netlink, &firewall)
            .with_exemption_nets(vec!["192.168.1.0/24".parse().unwrap()]);

        engine.up().await.unwrap();

        {
            let state = netlink.state.lock().unwrap();
            let cloned: Vec<&RouteSpec> = state
                .host
                .routes
                .iter()
                .filter(|r| r.table == TABLE && r.destination == Some("192.168.1.0/24".parse().unwrap()))
                .collect();
            assert_eq!(cloned.len(), 1);
            assert_eq!(cloned[0].gateway, Some("192.168.1.1".parse().unwrap()));
            assert_eq!(cloned[0].if_index, Some(2));

            let fw = firewall.state.lock().unwrap();
            assert!(fw.entries.iter().any(|e| e.iface == "eth0" && e.tag == "wg0"));
            assert!(fw.entries.iter().any(|e| e.iface == "wg0" && e.tag == "wg0"));
        }

        engine.down().await.unwrap();
        let state = netlink.state.lock().unwrap();
        assert!(!state.host.routes.iter().any(|r| r.table == TABLE));
        assert!(firewall.state.lock().unwrap().entries.is_empty());
    }

    // Scenario: residue from a crashed run is flushed by the next up().
    #[tokio::test]
    async fn up_clears_crash_residue() {
        let netlink = host_with_wg0();
        netlink.add_route(RouteSpec {
            destination: Some("203.0.113.0/24".parse().unwrap()),
            if_index: Some(2),
            ..RouteSpec::unicast(Family::V4, TABLE)
        });
        let firewall = MockFirewallOps::new();
        let mut engine = engine(&netlink, &firewall);

        engine.up().await.unwrap();

        let state = netlink.state.lock().unwrap();
        assert!(
            !state
                .host
                .routes
                .iter()
                .any(|r| r.destination == Some("203.0.113.0/24".parse().unwrap()))
        );
    }

    // Scenario: two engines racing for one table.
    #[tokio::test]
    async fn table_collision_is_rejected() {
        let netlink = host_with_wg0();
        let firewall = MockFirewallOps::new();
        let mut first = engine(&netlink, &firewall)
            .with_policies(vec![Policy::UserRange(UserRangePolicy::new(1000, 1000, false))]);
        let mut second = engine(&netlink, &firewall);

        first.up().await.unwrap();
        let result = second.up().await;
        assert!(matches!(result, Err(Error::Allocation(_))));

        // The loser must not have disturbed the winner's table.
        let state = netlink.state.lock().unwrap();
        assert!(state.host.routes.iter().any(|r| r.table == TABLE));
    }

    // Scenario: IPv6-only exemption while IPv6 is disabled.
    #[tokio::test]
    async fn v6_exemption_is_covered_by_prohibit_default() {
        let netlink = host_with_wg0();
        let firewall = MockFirewallOps::new();
        let mut engine = engine(&netlink, &firewall)
            .with_exemption_nets(vec!["2001:db8::/32".parse().unwrap()]);

        engine.up().await.unwrap();

        let state = netlink.state.lock().unwrap();
        let v6_routes: Vec<&RouteSpec> = state
            .host
            .routes
            .iter()
            .filter(|r| r.table == TABLE && r.family == Family::V6)
            .collect();
        assert_eq!(v6_routes.len(), 1);
        assert_eq!(v6_routes[0].kind, RouteKind::Prohibit);
        assert_eq!(v6_routes[0].destination, None);
    }

    #[tokio::test]
    async fn ipv6_enabled_installs_both_defaults() {
        let netlink = host_with_wg0();
        let firewall = MockFirewallOps::new();
        let mut engine = RoutingEngine::new(netlink.clone(), firewall.clone(), "wg0", TABLE, true);

        engine.up().await.unwrap();

        let state = netlink.state.lock().unwrap();
        let v6_default = state
            .host
            .routes
            .iter()
            .find(|r| r.table == TABLE && r.family == Family::V6)
            .unwrap();
        assert_eq!(v6_default.kind, RouteKind::Unicast);
        assert_eq!(v6_default.priority, Some(V6_DEFAULT_METRIC));
        assert_eq!(v6_default.if_index, Some(3));
    }

    // Restrict mode: only the configured nets travel through the tunnel.
    #[tokio::test]
    async fn tunnel_nets_replace_the_default_route() {
        let netlink = host_with_wg0();
        let firewall = MockFirewallOps::new();
        let mut engine = engine(&netlink, &firewall)
            .with_tunnel_nets(vec!["203.0.113.0/24".parse().unwrap()]);

        engine.up().await.unwrap();

        let state = netlink.state.lock().unwrap();
        assert!(
            !state
                .host
                .routes
                .iter()
                .any(|r| r.table == TABLE && r.family == Family::V4 && r.destination.is_none())
        );
        assert!(state.host.routes.iter().any(|r| {
            r.table == TABLE && r.destination == Some("203.0.113.0/24".parse().unwrap()) && r.if_index == Some(3)
        }));

        // NAT on every other egress link, not on the tunnel-vs-lo pair twice.
        let fw = firewall.state.lock().unwrap();
        assert!(fw.entries.iter().any(|e| e.iface == "eth0"));
        assert!(!fw.entries.iter().any(|e| e.iface == "lo"));
        assert_eq!(fw.entries.iter().filter(|e| e.iface == "wg0").count(), 1);
    }

    #[tokio::test]
    async fn missing_tunnel_interface_is_reported() {
        let netlink = MockNetlinkOps::new();
        netlink.add_link("lo");
        let firewall = MockFirewallOps::new();
        let mut engine = engine(&netlink, &firewall);

        let result = engine.up().await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    // Resource conservation: up + down returns the host to its prior state.
    #[tokio::test]
    async fn up_down_conserves_host_state() {
        let netlink = host_with_wg0();
        let firewall = MockFirewallOps::new();
        let before = snapshot(&netlink);

        let mut engine = engine(&netlink, &firewall)
            .with_exemption_nets(vec!["192.168.1.0/24".parse().unwrap()])
            .with_policies(vec![
                Policy::UserRange(UserRangePolicy::new(1000, 1999, true)),
                Policy::Namespace(NamespacePolicy::new("wepwawet0".into(), vec![], true, false)),
            ]);

        engine.up().await.unwrap();
        engine.down().await.unwrap();

        assert_eq!(snapshot(&netlink), before);
        assert!(firewall.state.lock().unwrap().entries.is_empty());
    }

    // A failing policy rolls the whole bring-up back.
    #[tokio::test]
    async fn failed_policy_rolls_back_everything() {
        let netlink = host_with_wg0();
        netlink.fail_after("rule_add", 2, "simulated rule failure");
        let firewall = MockFirewallOps::new();
        let before = snapshot(&netlink);

        let mut engine = engine(&netlink, &firewall)
            .with_policies(vec![Policy::UserRange(UserRangePolicy::new(1000, 1000, true))]);

        assert!(engine.up().await.is_err());

        netlink.clear_failures();
        assert_eq!(snapshot(&netlink), before);
        assert!(firewall.state.lock().unwrap().entries.is_empty());

        // A failed context stays dead.
        assert!(matches!(engine.up().await, Err(Error::State(_))));
    }

    #[tokio::test]
    async fn down_is_idempotent() {
        let netlink = host_with_wg0();
        let firewall = MockFirewallOps::new();
        let mut engine = engine(&netlink, &firewall)
            .with_policies(vec![Policy::UserRange(UserRangePolicy::new(1000, 1000, false))]);

        engine.up().await.unwrap();
        engine.down().await.unwrap();
        let after_first = snapshot(&netlink);

        engine.down().await.unwrap();
        assert_eq!(snapshot(&netlink), after_first);
    }

    #[tokio::test]
    async fn up_after_down_is_rejected() {
        let netlink = host_with_wg0();
        let firewall = MockFirewallOps::new();
        let mut engine = engine(&netlink, &firewall);

        engine.up().await.unwrap();
        engine.down().await.unwrap();
        assert!(matches!(engine.up().await, Err(Error::State(_))));
    }

    #[tokio::test]
    async fn action_requires_an_active_context() {
        let netlink = host_with_wg0();
        let firewall = MockFirewallOps::new();
        let mut engine = engine(&netlink, &firewall);

        assert!(matches!(engine.action().await, Err(Error::State(_))));

        engine.up().await.unwrap();
        // No process policy: action is a no-op without an exit code.
        assert_eq!(engine.action().await.unwrap(), None);
        engine.down().await.unwrap();
    }

    // Teardown failures are logged, every step still runs, first error returned.
    #[tokio::test]
    async fn down_attempts_every_step_despite_failures() {
        let netlink = host_with_wg0();
        let firewall = MockFirewallOps::new();
        let mut engine = engine(&netlink, &firewall)
            .with_policies(vec![Policy::UserRange(UserRangePolicy::new(1000, 1000, false))]);

        engine.up().await.unwrap();
        firewall.fail_on("masquerade_del", "simulated firewall failure");

        let result = engine.down().await;
        assert!(matches!(result, Err(Error::Firewall { .. })));

        // Rules and routes were still flushed.
        let state = netlink.state.lock().unwrap();
        assert!(!state.host.routes.iter().any(|r| r.table == TABLE));
        assert!(!state.host.rules.iter().any(|r| r.table == TABLE));
    }
}
