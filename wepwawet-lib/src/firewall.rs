//! Abstraction over netfilter NAT masquerade entries.
//!
//! Every entry this crate creates carries an `-m comment --comment <tag>`
//! marker; the tag is the correlation key for teardown and for the orphan
//! collector, since iptables itself has no resource handle to keep.
//!
//! Production code shells out to the host's `iptables` (and `ip6tables` when
//! IPv6 is enabled). Tests use stateful mocks (see `mocks` module).

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::Error;

const IPTABLES: &str = "iptables";
const IP6TABLES: &str = "ip6tables";

/// Abstraction over masquerade management in `nat/POSTROUTING`.
///
/// `masquerade_add` and `masquerade_del` with identical arguments are exact
/// inverses; symmetric teardown depends on that.
#[async_trait]
pub trait FirewallOps: Send + Sync + Clone {
    async fn masquerade_add(&self, iface: &str, tag: &str, ipv6: bool) -> Result<(), Error>;
    async fn masquerade_del(&self, iface: &str, tag: &str, ipv6: bool) -> Result<(), Error>;

    /// Remove every masquerade entry whose comment starts with `tag_prefix`,
    /// both families. Returns the number of entries removed. Meant as a
    /// diagnostic for entries orphaned by a crashed run.
    async fn masquerade_gc(&self, tag_prefix: &str) -> Result<usize, Error>;
}

/// Production [`FirewallOps`] invoking the iptables binaries.
#[derive(Clone)]
pub struct RealFirewallOps;

impl RealFirewallOps {
    fn masquerade_args(op: &str, iface: &str, tag: &str) -> Vec<String> {
        ["-t", "nat", op, "POSTROUTING", "-o", iface, "-m", "comment", "--comment", tag, "-j", "MASQUERADE"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    async fn exec(program: &'static str, args: &[String]) -> Result<String, Error> {
        let output = Command::new(program).args(args).output().await.map_err(|e| Error::Firewall {
            program,
            args: args.join(" "),
            status: format!("failed to execute: {e}"),
        })?;

        if !output.status.success() {
            return Err(Error::Firewall {
                program,
                args: args.join(" "),
                status: output.status.to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn masquerade(op: &str, iface: &str, tag: &str, ipv6: bool) -> Result<(), Error> {
        let args = Self::masquerade_args(op, iface, tag);
        Self::exec(IPTABLES, &args).await?;
        if ipv6 {
            Self::exec(IP6TABLES, &args).await?;
        }
        Ok(())
    }

    /// Replay tagged `-A POSTROUTING ...` listing lines as deletions.
    async fn gc_family(program: &'static str, tag_prefix: &str) -> Result<usize, Error> {
        let listing = Self::exec(program, &["-t".into(), "nat".into(), "-S".into(), "POSTROUTING".into()]).await?;

        let mut removed = 0;
        for line in listing.lines() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.first() != Some(&"-A") || !tokens.contains(&"MASQUERADE") {
                continue;
            }
            let comment = tokens
                .iter()
                .position(|t| *t == "--comment")
                .and_then(|i| tokens.get(i + 1));
            let Some(comment) = comment else { continue };
            if !comment.trim_matches('"').starts_with(tag_prefix) {
                continue;
            }

            let mut args: Vec<String> = vec!["-t".into(), "nat".into(), "-D".into()];
            args.extend(tokens[1..].iter().map(|t| t.trim_matches('"').to_string()));
            Self::exec(program, &args).await?;
            removed += 1;
        }
        Ok(removed)
    }
}

#[async_trait]
impl FirewallOps for RealFirewallOps {
    async fn masquerade_add(&self, iface: &str, tag: &str, ipv6: bool) -> Result<(), Error> {
        Self::masquerade("-I", iface, tag, ipv6).await?;
        tracing::debug!(iface, tag, ipv6, "masquerade entry added");
        Ok(())
    }

    async fn masquerade_del(&self, iface: &str, tag: &str, ipv6: bool) -> Result<(), Error> {
        Self::masquerade("-D", iface, tag, ipv6).await?;
        tracing::debug!(iface, tag, ipv6, "masquerade entry removed");
        Ok(())
    }

    async fn masquerade_gc(&self, tag_prefix: &str) -> Result<usize, Error> {
        let mut removed = Self::gc_family(IPTABLES, tag_prefix).await?;
        // ip6tables may be absent on v4-only hosts.
        match Self::gc_family(IP6TABLES, tag_prefix).await {
            Ok(n) => removed += n,
            Err(error) => tracing::warn!(%error, "skipping IPv6 masquerade collection"),
        }
        if removed > 0 {
            tracing::info!(removed, tag_prefix, "collected orphaned masquerade entries");
        }
        Ok(removed)
    }
}
