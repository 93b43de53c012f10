//! Policy routing by source uid range.

use crate::error::Error;
use crate::netlink::{Family, NetlinkOps, RuleAction, RuleSelector, RuleSpec};

use super::{PolicyEnv, RULE_PRIORITY};

/// Routes packets whose source uid falls in `[uid_lo, uid_hi]` via the
/// engine's table, for both address families.
///
/// With the killswitch enabled a `prohibit` rule is installed right behind
/// the lookup rule, so selected traffic is dropped rather than leaked via the
/// main table when the tunnel table cannot resolve a route.
#[derive(Debug)]
pub struct UserRangePolicy {
    uid_lo: u32,
    uid_hi: u32,
    killswitch: bool,
    added_rules: Vec<RuleSpec>,
}

impl UserRangePolicy {
    pub fn new(uid_lo: u32, uid_hi: u32, killswitch: bool) -> Self {
        Self {
            uid_lo,
            uid_hi,
            killswitch,
            added_rules: Vec::new(),
        }
    }

    pub(super) async fn up<N: NetlinkOps>(&mut self, netlink: &N, env: &PolicyEnv) -> Result<(), Error> {
        for family in [Family::V4, Family::V6] {
            let rule = RuleSpec {
                family,
                table: env.table,
                priority: RULE_PRIORITY,
                selector: Some(RuleSelector::UidRange(self.uid_lo, self.uid_hi)),
                action: RuleAction::Lookup,
            };
            netlink.rule_add(&rule).await?;
            self.added_rules.push(rule);
        }

        if self.killswitch {
            for family in [Family::V4, Family::V6] {
                let rule = RuleSpec {
                    family,
                    table: env.table,
                    priority: RULE_PRIORITY + 1,
                    selector: Some(RuleSelector::UidRange(self.uid_lo, self.uid_hi)),
                    action: RuleAction::Prohibit,
                };
                netlink.rule_add(&rule).await?;
                self.added_rules.push(rule);
            }
        }

        tracing::info!(
            uid_lo = self.uid_lo,
            uid_hi = self.uid_hi,
            killswitch = self.killswitch,
            table = env.table,
            "uid range policy applied"
        );
        Ok(())
    }

    pub(super) async fn down<N: NetlinkOps>(&mut self, netlink: &N) -> Result<(), Error> {
        let mut first_error = None;
        for rule in self.added_rules.drain(..).rev() {
            match netlink.rule_del(&rule).await {
                Ok(()) => {}
                // Already removed, e.g. by the engine's table flush.
                Err(Error::NotFound(_)) => {}
                Err(error) => {
                    tracing::warn!(%error, "failed to delete uid range rule, continuing anyway");
                    first_error.get_or_insert(error);
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockNetlinkOps;

    fn env() -> PolicyEnv {
        PolicyEnv {
            table: 10111,
            tunnel_iface: "wg0".into(),
            ipv6: false,
        }
    }

    #[tokio::test]
    async fn installs_lookup_rules_for_both_families() {
        let netlink = MockNetlinkOps::new();
        let mut policy = UserRangePolicy::new(1000, 1000, false);

        policy.up(&netlink, &env()).await.unwrap();

        let state = netlink.state.lock().unwrap();
        assert_eq!(state.host.rules.len(), 2);
        for rule in &state.host.rules {
            assert_eq!(rule.table, 10111);
            assert_eq!(rule.priority, RULE_PRIORITY);
            assert_eq!(rule.selector, Some(RuleSelector::UidRange(1000, 1000)));
            assert_eq!(rule.action, RuleAction::Lookup);
        }
        let families: Vec<Family> = state.host.rules.iter().map(|r| r.family).collect();
        assert!(families.contains(&Family::V4));
        assert!(families.contains(&Family::V6));
    }

    #[tokio::test]
    async fn killswitch_sits_behind_the_lookup_rule() {
        let netlink = MockNetlinkOps::new();
        let mut policy = UserRangePolicy::new(1000, 1005, true);

        policy.up(&netlink, &env()).await.unwrap();

        let state = netlink.state.lock().unwrap();
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
            assert_eq!(prohibit.selector, lookup.selector);
        }
    }

    #[tokio::test]
    async fn down_removes_everything_and_tolerates_missing_rules() {
        let netlink = MockNetlinkOps::new();
        let mut policy = UserRangePolicy::new(1000, 1000, true);

        policy.up(&netlink, &env()).await.unwrap();
        // Simulate the engine flushing the table first.
        netlink.state.lock().unwrap().host.rules.clear();

        policy.down(&netlink).await.unwrap();
        assert!(netlink.state.lock().unwrap().host.rules.is_empty());
    }

    #[tokio::test]
    async fn partial_up_is_released_by_down() {
        let netlink = MockNetlinkOps::new();
        netlink.fail_after("rule_add", 2, "simulated rule failure");
        let mut policy = UserRangePolicy::new(1000, 1000, true);

        assert!(policy.up(&netlink, &env()).await.is_err());
        policy.down(&netlink).await.unwrap();

        assert!(netlink.state.lock().unwrap().host.rules.is_empty());
    }
}
