//! Routing policies: the selector+action pairs composed over one routing
//! table by the engine.
//!
//! A policy claims kernel objects in `up`, releases them in reverse order in
//! `down`, and optionally blocks in `action`. Everything a policy creates is
//! recorded in its own state so that `down` can release a partially
//! constructed setup after a failed `up`.

mod namespace;
mod process;
mod user;

pub use namespace::NamespacePolicy;
pub use process::ProcessPolicy;
pub use user::UserRangePolicy;

use crate::error::Error;
use crate::firewall::FirewallOps;
use crate::netlink::NetlinkOps;

/// Priority of a policy's main routing rule. The killswitch companion sits
/// one step higher (numerically), i.e. at lower precedence, so it only
/// catches packets the main table could not route.
pub const RULE_PRIORITY: u32 = 100;

/// Engine context handed down to policies.
#[derive(Debug, Clone)]
pub struct PolicyEnv {
    /// The routing table the engine populated.
    pub table: u32,
    /// The tunnel link name; also the engine's masquerade tag.
    pub tunnel_iface: String,
    /// Whether the engine routes IPv6 through the tunnel.
    pub ipv6: bool,
}

/// A routing policy variant.
///
/// `ProcessPolicy` contains a `NamespacePolicy` rather than extending it;
/// the namespace lifecycle is reused wholesale and only `action` differs.
#[derive(Debug)]
pub enum Policy {
    UserRange(UserRangePolicy),
    Namespace(NamespacePolicy),
    Process(ProcessPolicy),
}

impl Policy {
    /// Acquire resources and install rules/routes for this policy.
    pub async fn up<N: NetlinkOps, F: FirewallOps>(
        &mut self,
        netlink: &N,
        firewall: &F,
        env: &PolicyEnv,
    ) -> Result<(), Error> {
        match self {
            Policy::UserRange(p) => p.up(netlink, env).await,
            Policy::Namespace(p) => p.up(netlink, firewall, env).await,
            Policy::Process(p) => p.up(netlink, firewall, env).await,
        }
    }

    /// Release everything `up` recorded, in reverse order. Tolerates objects
    /// that are already gone.
    pub async fn down<N: NetlinkOps, F: FirewallOps>(
        &mut self,
        netlink: &N,
        firewall: &F,
    ) -> Result<(), Error> {
        match self {
            Policy::UserRange(p) => p.down(netlink).await,
            Policy::Namespace(p) => p.down(netlink, firewall).await,
            Policy::Process(p) => p.down(netlink, firewall).await,
        }
    }

    /// Blocking part of the policy, if any. Only `ProcessPolicy` does work
    /// here; it returns the child's exit code.
    pub async fn action(&mut self) -> Result<Option<i32>, Error> {
        match self {
            Policy::Process(p) => p.action().await,
            _ => Ok(None),
        }
    }
}
