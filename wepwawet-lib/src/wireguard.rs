//! WireGuard tunnel bring-up and teardown.
//!
//! The link and its addresses go through netlink like everything else; keys
//! and the peer are applied through the kernel's WireGuard interface. The
//! peer's allowed-ips form the WireGuard crypto-routing table, which is
//! independent of the policy routing table the engine manages.

use async_trait::async_trait;
use wireguard_control::{Backend, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};

use std::net::SocketAddr;

use crate::config::{VpnConfig, WgInterface, WgPeer};
use crate::error::Error;
use crate::netlink::NetlinkOps;

/// Something with a bring-up/teardown lifecycle around the engine's.
///
/// Compose the driver *around* the engine in the caller's scope so the
/// tunnel outlives the routing table that references it.
#[async_trait]
pub trait TunnelDriver: Send {
    async fn up(&mut self) -> Result<(), Error>;
    async fn down(&mut self) -> Result<(), Error>;
}

/// Kernel WireGuard device driver.
pub struct WireGuardDriver<N: NetlinkOps> {
    netlink: N,
    interface: String,
    device: WgInterface,
    peer: WgPeer,
}

impl<N: NetlinkOps> WireGuardDriver<N> {
    pub fn from_config(netlink: N, interface: impl Into<String>, vpn: &VpnConfig) -> Self {
        let VpnConfig::Wireguard { interface: device, peer } = vpn;
        Self {
            netlink,
            interface: interface.into(),
            device: device.clone(),
            peer: peer.clone(),
        }
    }

    async fn delete_stale_link(&self) -> Result<(), Error> {
        if let Some(index) = self.netlink.link_index(&self.interface).await? {
            tracing::info!(interface = %self.interface, "removing leftover tunnel link");
            self.netlink.link_del(index).await?;
        }
        Ok(())
    }

    async fn configure_device(&self) -> Result<(), Error> {
        let name: InterfaceName = self
            .interface
            .parse()
            .map_err(|e| Error::WireGuard(format!("invalid interface name: {e}")))?;
        let private_key = Key::from_base64(&self.device.private_key)
            .map_err(|_| Error::WireGuard("invalid private key".into()))?;
        let public_key = Key::from_base64(&self.peer.public_key)
            .map_err(|_| Error::WireGuard("invalid peer public key".into()))?;

        let endpoint = resolve_endpoint(&self.peer.endpoint).await?;
        let mut peer = PeerConfigBuilder::new(&public_key)
            .set_endpoint(endpoint)
            .set_persistent_keepalive_interval(self.peer.keepalive)
            .replace_allowed_ips();
        for net in &self.peer.allowed_ips {
            peer = peer.add_allowed_ip(net.first_address(), net.network_length());
        }
        if let Some(psk) = &self.peer.preshared_key {
            let psk = Key::from_base64(psk).map_err(|_| Error::WireGuard("invalid preshared key".into()))?;
            peer = peer.set_preshared_key(psk);
        }

        DeviceUpdate::new()
            .set_private_key(private_key)
            .add_peer(peer)
            .apply(&name, Backend::Kernel)
            .map_err(|e| Error::WireGuard(e.to_string()))
    }
}

#[async_trait]
impl<N: NetlinkOps + 'static> TunnelDriver for WireGuardDriver<N> {
    async fn up(&mut self) -> Result<(), Error> {
        self.delete_stale_link().await?;

        self.netlink.link_add_wireguard(&self.interface).await?;
        let index = self
            .netlink
            .link_index(&self.interface)
            .await?
            .ok_or_else(|| Error::NotFound(self.interface.clone()))?;

        for inet in &self.device.address {
            self.netlink.addr_add(index, inet.address(), inet.network_length()).await?;
        }
        self.netlink.link_set_up(index).await?;

        self.configure_device().await?;
        tracing::info!(interface = %self.interface, "wireguard tunnel is up");
        Ok(())
    }

    async fn down(&mut self) -> Result<(), Error> {
        match self.netlink.link_index(&self.interface).await? {
            Some(index) => {
                self.netlink.link_del(index).await?;
                tracing::info!(interface = %self.interface, "wireguard tunnel is down");
            }
            None => tracing::debug!(interface = %self.interface, "tunnel link already gone"),
        }
        Ok(())
    }
}

/// `host:port` with either an address literal or a resolvable name.
async fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr, Error> {
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return Ok(addr);
    }
    tokio::net::lookup_host(endpoint)
        .await
        .map_err(|e| Error::WireGuard(format!("cannot resolve endpoint {endpoint}: {e}")))?
        .next()
        .ok_or_else(|| Error::WireGuard(format!("endpoint {endpoint} resolved to no address")))
}
