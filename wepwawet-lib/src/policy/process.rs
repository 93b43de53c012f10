//! Run a command inside a policy namespace.

use std::os::fd::AsFd;

use tokio::process::Command;

use crate::error::Error;
use crate::firewall::FirewallOps;
use crate::netlink::{NETNS_DIR, NetlinkOps};

use super::{NamespacePolicy, PolicyEnv};

/// A [`NamespacePolicy`] plus a command to execute inside the namespace.
///
/// `action` blocks for the child's whole lifetime and yields its exit code so
/// the caller can propagate it.
#[derive(Debug)]
pub struct ProcessPolicy {
    namespace: NamespacePolicy,
    cmd: Vec<String>,
}

impl ProcessPolicy {
    pub fn new(namespace: NamespacePolicy, cmd: Vec<String>) -> Self {
        Self { namespace, cmd }
    }

    pub fn namespace(&self) -> &NamespacePolicy {
        &self.namespace
    }

    pub(super) async fn up<N: NetlinkOps, F: FirewallOps>(
        &mut self,
        netlink: &N,
        firewall: &F,
        env: &PolicyEnv,
    ) -> Result<(), Error> {
        self.namespace.up(netlink, firewall, env).await
    }

    pub(super) async fn down<N: NetlinkOps, F: FirewallOps>(
        &mut self,
        netlink: &N,
        firewall: &F,
    ) -> Result<(), Error> {
        self.namespace.down(netlink, firewall).await
    }

    /// Spawn the command inside the namespace and wait for it.
    ///
    /// The child enters the namespace between fork and exec; the handle is
    /// opened beforehand so the hook only issues the `setns` call. The child
    /// is reaped if this future is dropped (e.g. the caller races it against
    /// a termination signal).
    pub(super) async fn action(&mut self) -> Result<Option<i32>, Error> {
        let (program, args) = self
            .cmd
            .split_first()
            .ok_or_else(|| Error::Child(std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command")))?;

        let ns_file = std::fs::File::open(format!("{NETNS_DIR}/{}", self.namespace.ns_name()))?;

        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);
        unsafe {
            command.pre_exec(move || {
                nix::sched::setns(ns_file.as_fd(), nix::sched::CloneFlags::CLONE_NEWNET)
                    .map_err(std::io::Error::from)
            });
        }

        let mut child = command.spawn().map_err(Error::Child)?;
        tracing::info!(cmd = ?self.cmd, ns = %self.namespace.ns_name(), "command started");
        let status = child.wait().await?;
        tracing::info!(%status, "command finished");
        Ok(status.code())
    }
}
