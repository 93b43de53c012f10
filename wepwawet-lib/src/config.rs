//! YAML configuration file handling.

use cidr::{IpCidr, IpInet};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use std::path::Path;
use std::str::FromStr;

use crate::policy::{Policy, UserRangePolicy};

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration file not found")]
    NoFile,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Top-level configuration, matching the YAML schema consumed by `run`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub table_name: u32,
    pub interface: String,
    #[serde(default = "default_ipv6")]
    pub ipv6: bool,
    /// Networks that bypass the tunnel.
    #[serde(default)]
    pub nets: Vec<IpCidr>,
    #[serde(default)]
    pub vpn: Option<VpnConfig>,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

fn default_ipv6() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VpnConfig {
    Wireguard {
        interface: WgInterface,
        peer: WgPeer,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WgInterface {
    /// Tunnel addresses with their prefixes, e.g. `10.9.0.2/24`.
    pub address: Vec<IpInet>,
    pub private_key: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WgPeer {
    pub public_key: String,
    #[serde(default)]
    pub preshared_key: Option<String>,
    /// The peer's crypto-routing table, distinct from the policy table.
    pub allowed_ips: Vec<IpCidr>,
    /// `host:port`.
    pub endpoint: String,
    pub keepalive: u16,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PolicyConfig {
    Uid {
        uid_range: UidRange,
        killswitch: bool,
    },
}

/// Inclusive uid range given as `"LO:HI"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidRange {
    pub lo: u32,
    pub hi: u32,
}

impl FromStr for UidRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lo, hi) = s
            .split_once(':')
            .ok_or_else(|| format!("expected LO:HI, got {s:?}"))?;
        let lo: u32 = lo.parse().map_err(|e| format!("invalid lower uid: {e}"))?;
        let hi: u32 = hi.parse().map_err(|e| format!("invalid upper uid: {e}"))?;
        if lo > hi {
            return Err(format!("uid range is inverted: {lo} > {hi}"));
        }
        Ok(Self { lo, hi })
    }
}

impl<'de> Deserialize<'de> for UidRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Config {
    pub async fn from_path(path: &Path) -> Result<Self, Error> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NoFile
            } else {
                Error::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Instantiate the configured policies, in declaration order.
    pub fn build_policies(&self) -> Vec<Policy> {
        self.policies
            .iter()
            .map(|policy| match policy {
                PolicyConfig::Uid { uid_range, killswitch } => {
                    Policy::UserRange(UserRangePolicy::new(uid_range.lo, uid_range.hi, *killswitch))
                }
            })
            .collect()
    }
}
