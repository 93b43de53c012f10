//! Stateful mocks for the netlink and firewall abstractions.
//!
//! These mocks track actual state (links, routes, rules, namespaces,
//! masquerade entries) rather than call sequences, so tests assert on the
//! simulated system's _state_ after a lifecycle operation. Namespaces are
//! modelled as separate link/address/route spaces; `ns_open` returns a
//! handle scoped to one of them, and veth pairs disappear together the way
//! kernel pairs do.
//!
//! All mocks use `Arc<Mutex<_>>` for interior mutability in async contexts.

#![cfg(test)]

use async_trait::async_trait;

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::firewall::FirewallOps;
use crate::netlink::{AddrInfo, Family, LinkInfo, NetlinkOps, RouteSpec, RuleSpec};

// ============================================================================
// Failure injection
// ============================================================================

#[derive(Debug, Clone)]
struct FailPlan {
    /// Number of calls that still succeed before the operation starts failing.
    remaining: u32,
    message: String,
}

fn check_fail(fail_on: &mut HashMap<String, FailPlan>, op: &str) -> Result<(), Error> {
    if let Some(plan) = fail_on.get_mut(op) {
        if plan.remaining == 0 {
            return Err(Error::Io(std::io::Error::other(plan.message.clone())));
        }
        plan.remaining -= 1;
    }
    Ok(())
}

// ============================================================================
// MockNetlinkOps
// ============================================================================

/// One network namespace's view of links, addresses, routes and rules.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct NetSpace {
    pub links: Vec<LinkInfo>,
    pub addrs: Vec<AddrInfo>,
    pub routes: Vec<RouteSpec>,
    pub rules: Vec<RuleSpec>,
}

#[derive(Debug, Default)]
pub struct NetlinkState {
    pub host: NetSpace,
    pub namespaces: BTreeMap<String, NetSpace>,
    pub veth_pairs: Vec<(String, String)>,
    next_index: u32,
    fail_on: HashMap<String, FailPlan>,
}

/// Everything comparable about the simulated system, for conservation checks.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub host: NetSpace,
    pub namespaces: BTreeMap<String, NetSpace>,
    pub veth_pairs: Vec<(String, String)>,
}

pub fn snapshot(ops: &MockNetlinkOps) -> Snapshot {
    let state = ops.state.lock().unwrap();
    Snapshot {
        host: state.host.clone(),
        namespaces: state.namespaces.clone(),
        veth_pairs: state.veth_pairs.clone(),
    }
}

#[derive(Clone)]
pub struct MockNetlinkOps {
    pub state: Arc<Mutex<NetlinkState>>,
    /// `None` = host namespace, `Some(name)` = handle inside that namespace.
    scope: Option<String>,
}

impl MockNetlinkOps {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetlinkState {
                next_index: 1,
                ..NetlinkState::default()
            })),
            scope: None,
        }
    }

    pub fn add_link(&self, name: &str) -> u32 {
        let mut state = self.state.lock().unwrap();
        let index = state.next_index;
        state.next_index += 1;
        state.host.links.push(LinkInfo {
            index,
            name: name.into(),
        });
        index
    }

    pub fn add_addr(&self, if_index: u32, addr: IpAddr, prefix_len: u8) {
        self.state.lock().unwrap().host.addrs.push(AddrInfo {
            if_index,
            addr,
            prefix_len,
        });
    }

    pub fn add_route(&self, route: RouteSpec) {
        self.state.lock().unwrap().host.routes.push(route);
    }

    pub fn add_rule(&self, rule: RuleSpec) {
        self.state.lock().unwrap().host.rules.push(rule);
    }

    /// Every call to `op` fails from now on.
    pub fn fail_on(&self, op: &str, message: &str) {
        self.fail_after(op, 0, message);
    }

    /// The first `successes` calls to `op` succeed, later ones fail.
    pub fn fail_after(&self, op: &str, successes: u32, message: &str) {
        self.state.lock().unwrap().fail_on.insert(
            op.into(),
            FailPlan {
                remaining: successes,
                message: message.into(),
            },
        );
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().fail_on.clear();
    }

    fn with_space<R>(
        &self,
        op: &str,
        f: impl FnOnce(&mut NetSpace, &mut NetlinkState) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut state = self.state.lock().unwrap();
        check_fail(&mut state.fail_on, op)?;

        // Detach the scoped space so the closure can also touch shared state.
        let mut space = match &self.scope {
            None => std::mem::take(&mut state.host),
            Some(ns) => state
                .namespaces
                .remove(ns)
                .ok_or_else(|| Error::NotFound(format!("namespace {ns}")))?,
        };
        let result = f(&mut space, &mut state);
        match &self.scope {
            None => state.host = space,
            Some(ns) => {
                state.namespaces.insert(ns.clone(), space);
            }
        }
        result
    }

    /// Remove a link and everything hanging off it; a veth peer goes with it.
    fn purge_link(state: &mut NetlinkState, space: &mut NetSpace, name: &str) {
        let Some(pos) = space.links.iter().position(|l| l.name == name) else {
            return;
        };
        let link = space.links.remove(pos);
        space.addrs.retain(|a| a.if_index != link.index);
        space.routes.retain(|r| r.if_index != Some(link.index));

        if let Some(pair_pos) = state.veth_pairs.iter().position(|(a, b)| a == name || b == name) {
            let (a, b) = state.veth_pairs.remove(pair_pos);
            let peer = if a == name { b } else { a };
            Self::purge_link_everywhere(state, space, &peer);
        }
    }

    fn purge_link_everywhere(state: &mut NetlinkState, current: &mut NetSpace, name: &str) {
        Self::purge_link(state, current, name);
        let ns_names: Vec<String> = state.namespaces.keys().cloned().collect();
        for ns in ns_names {
            if let Some(mut space) = state.namespaces.remove(&ns) {
                Self::purge_link(state, &mut space, name);
                state.namespaces.insert(ns, space);
            }
        }
    }
}

#[async_trait]
impl NetlinkOps for MockNetlinkOps {
    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error> {
        self.with_space("link_list", |space, _| Ok(space.links.clone()))
    }

    async fn link_add_veth(&self, name: &str, peer: &str) -> Result<(), Error> {
        self.with_space("link_add_veth", |space, state| {
            if space.links.iter().any(|l| l.name == name || l.name == peer) {
                return Err(Error::Io(std::io::Error::other(format!(
                    "link name collision: {name}/{peer}"
                ))));
            }
            for link_name in [name, peer] {
                let index = state.next_index;
                state.next_index += 1;
                space.links.push(LinkInfo {
                    index,
                    name: link_name.into(),
                });
            }
            state.veth_pairs.push((name.into(), peer.into()));
            Ok(())
        })
    }

    async fn link_add_wireguard(&self, name: &str) -> Result<(), Error> {
        self.with_space("link_add_wireguard", |space, state| {
            if space.links.iter().any(|l| l.name == name) {
                return Err(Error::Io(std::io::Error::other(format!("link exists: {name}"))));
            }
            let index = state.next_index;
            state.next_index += 1;
            space.links.push(LinkInfo {
                index,
                name: name.into(),
            });
            Ok(())
        })
    }

    async fn link_del(&self, index: u32) -> Result<(), Error> {
        self.with_space("link_del", |space, state| {
            let name = space
                .links
                .iter()
                .find(|l| l.index == index)
                .map(|l| l.name.clone())
                .ok_or_else(|| Error::NotFound(format!("link index {index}")))?;
            Self::purge_link(state, space, &name);
            Ok(())
        })
    }

    async fn link_set_up(&self, index: u32) -> Result<(), Error> {
        self.with_space("link_set_up", |space, _| {
            space
                .links
                .iter()
                .find(|l| l.index == index)
                .map(|_| ())
                .ok_or_else(|| Error::NotFound(format!("link index {index}")))
        })
    }

    async fn link_set_ns(&self, index: u32, ns_name: &str) -> Result<(), Error> {
        self.with_space("link_set_ns", |space, state| {
            if !state.namespaces.contains_key(ns_name) {
                return Err(Error::NotFound(format!("namespace {ns_name}")));
            }
            let pos = space
                .links
                .iter()
                .position(|l| l.index == index)
                .ok_or_else(|| Error::NotFound(format!("link index {index}")))?;
            let link = space.links.remove(pos);
            let addrs: Vec<AddrInfo> = space
                .addrs
                .iter()
                .filter(|a| a.if_index == link.index)
                .cloned()
                .collect();
            space.addrs.retain(|a| a.if_index != link.index);
            space.routes.retain(|r| r.if_index != Some(link.index));

            let target = state.namespaces.get_mut(ns_name).expect("checked above");
            target.links.push(link);
            target.addrs.extend(addrs);
            Ok(())
        })
    }

    async fn addr_add(&self, index: u32, addr: IpAddr, prefix_len: u8) -> Result<(), Error> {
        self.with_space("addr_add", |space, _| {
            if !space.links.iter().any(|l| l.index == index) {
                return Err(Error::NotFound(format!("link index {index}")));
            }
            if space.addrs.iter().any(|a| a.if_index == index && a.addr == addr) {
                return Err(Error::Io(std::io::Error::other(format!("address exists: {addr}"))));
            }
            space.addrs.push(AddrInfo {
                if_index: index,
                addr,
                prefix_len,
            });
            Ok(())
        })
    }

    async fn addr_list(&self) -> Result<Vec<AddrInfo>, Error> {
        self.with_space("addr_list", |space, _| Ok(space.addrs.clone()))
    }

    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        self.with_space("route_add", |space, _| {
            let exists = space.routes.iter().any(|r| {
                r.family == route.family && r.table == route.table && r.destination == route.destination
            });
            if exists {
                return Err(Error::Io(std::io::Error::other(format!(
                    "route exists: {:?} table {}",
                    route.destination, route.table
                ))));
            }
            space.routes.push(route.clone());
            Ok(())
        })
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
        self.with_space("route_del", |space, _| {
            let pos = space
                .routes
                .iter()
                .position(|r| {
                    r.family == route.family && r.table == route.table && r.destination == route.destination
                })
                .ok_or_else(|| Error::NotFound(format!("route {:?}", route.destination)))?;
            space.routes.remove(pos);
            Ok(())
        })
    }

    async fn route_list(&self, family: Family, table: Option<u32>) -> Result<Vec<RouteSpec>, Error> {
        self.with_space("route_list", |space, _| {
            Ok(space
                .routes
                .iter()
                .filter(|r| r.family == family && table.is_none_or(|t| r.table == t))
                .cloned()
                .collect())
        })
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error> {
        self.with_space("rule_add", |space, _| {
            space.rules.push(rule.clone());
            Ok(())
        })
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error> {
        self.with_space("rule_del", |space, _| {
            let pos = space
                .rules
                .iter()
                .position(|r| r == rule)
                .ok_or_else(|| Error::NotFound(format!("rule {rule:?}")))?;
            space.rules.remove(pos);
            Ok(())
        })
    }

    async fn rule_list(&self, family: Family) -> Result<Vec<RuleSpec>, Error> {
        self.with_space("rule_list", |space, _| {
            Ok(space.rules.iter().filter(|r| r.family == family).cloned().collect())
        })
    }

    async fn ns_add(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        check_fail(&mut state.fail_on, "ns_add")?;
        if state.namespaces.contains_key(name) {
            return Err(Error::Io(std::io::Error::other(format!("namespace exists: {name}"))));
        }
        // A fresh namespace starts out with its own loopback device.
        let lo_index = state.next_index;
        state.next_index += 1;
        let mut space = NetSpace::default();
        space.links.push(LinkInfo {
            index: lo_index,
            name: "lo".into(),
        });
        state.namespaces.insert(name.into(), space);
        Ok(())
    }

    async fn ns_del(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        check_fail(&mut state.fail_on, "ns_del")?;
        let space = state
            .namespaces
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("namespace {name}")))?;
        // Veth peers die with the namespace that holds their other end.
        for link in &space.links {
            if let Some(pos) = state
                .veth_pairs
                .iter()
                .position(|(a, b)| *a == link.name || *b == link.name)
            {
                let (a, b) = state.veth_pairs.remove(pos);
                let peer = if a == link.name { b } else { a };
                let mut host = std::mem::take(&mut state.host);
                Self::purge_link(&mut state, &mut host, &peer);
                state.host = host;
            }
        }
        Ok(())
    }

    async fn ns_list(&self) -> Result<Vec<String>, Error> {
        let mut state = self.state.lock().unwrap();
        check_fail(&mut state.fail_on, "ns_list")?;
        Ok(state.namespaces.keys().cloned().collect())
    }

    async fn ns_open(&self, name: &str) -> Result<Self, Error> {
        let mut state = self.state.lock().unwrap();
        check_fail(&mut state.fail_on, "ns_open")?;
        if !state.namespaces.contains_key(name) {
            return Err(Error::NotFound(format!("namespace {name}")));
        }
        Ok(Self {
            state: Arc::clone(&self.state),
            scope: Some(name.into()),
        })
    }
}

// ============================================================================
// MockFirewallOps
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct MasqueradeEntry {
    pub iface: String,
    pub tag: String,
    pub ipv6: bool,
}

#[derive(Debug, Default)]
pub struct FirewallState {
    pub entries: Vec<MasqueradeEntry>,
    fail_on: HashMap<String, FailPlan>,
}

#[derive(Clone)]
pub struct MockFirewallOps {
    pub state: Arc<Mutex<FirewallState>>,
}

impl MockFirewallOps {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FirewallState::default())),
        }
    }

    pub fn fail_on(&self, op: &str, message: &str) {
        self.state.lock().unwrap().fail_on.insert(
            op.into(),
            FailPlan {
                remaining: 0,
                message: message.into(),
            },
        );
    }
}

fn firewall_fail(fail_on: &mut HashMap<String, FailPlan>, op: &'static str) -> Result<(), Error> {
    if let Some(plan) = fail_on.get_mut(op) {
        if plan.remaining == 0 {
            return Err(Error::Firewall {
                program: "iptables",
                args: op.into(),
                status: plan.message.clone(),
            });
        }
        plan.remaining -= 1;
    }
    Ok(())
}

#[async_trait]
impl FirewallOps for MockFirewallOps {
    async fn masquerade_add(&self, iface: &str, tag: &str, ipv6: bool) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        firewall_fail(&mut state.fail_on, "masquerade_add")?;
        state.entries.push(MasqueradeEntry {
            iface: iface.into(),
            tag: tag.into(),
            ipv6,
        });
        Ok(())
    }

    async fn masquerade_del(&self, iface: &str, tag: &str, ipv6: bool) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        firewall_fail(&mut state.fail_on, "masquerade_del")?;
        let pos = state
            .entries
            .iter()
            .position(|e| e.iface == iface && e.tag == tag && e.ipv6 == ipv6)
            .ok_or_else(|| Error::Firewall {
                program: "iptables",
                args: format!("-D POSTROUTING -o {iface} --comment {tag}"),
                status: "no matching entry".into(),
            })?;
        state.entries.remove(pos);
        Ok(())
    }

    async fn masquerade_gc(&self, tag_prefix: &str) -> Result<usize, Error> {
        let mut state = self.state.lock().unwrap();
        firewall_fail(&mut state.fail_on, "masquerade_gc")?;
        let before = state.entries.len();
        state.entries.retain(|e| !e.tag.starts_with(tag_prefix));
        Ok(before - state.entries.len())
    }
}
