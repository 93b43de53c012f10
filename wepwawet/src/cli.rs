use cidr::IpCidr;
use clap::{Parser, Subcommand};

use std::net::IpAddr;
use std::path::PathBuf;

/// Per-user and per-process VPN policy routing
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Bring the tunnel and routing policies up, wait for a signal
    #[command()]
    Run {
        /// General configuration file
        #[arg(short, long)]
        config_file: PathBuf,
    },

    /// Run one command through the tunnel inside a fresh namespace
    #[command()]
    Exec(Box<ExecArgs>),

    /// Configuration file utilities
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Remove masquerade entries left behind by a crashed run
    #[command()]
    Gc {
        /// Remove entries whose comment starts with this prefix
        #[arg(long)]
        tag_prefix: String,
    },
}

#[derive(Debug, clap::Args)]
pub struct ExecArgs {
    /// Routing table ID (allocated automatically when omitted)
    #[arg(short, long)]
    pub table: Option<u32>,

    /// Tunnel interface to route through
    #[arg(short, long)]
    pub interface: String,

    /// Route IPv6 through the tunnel
    #[arg(long, overrides_with = "no_ipv6")]
    pub ipv6: bool,

    /// Blackhole IPv6 instead (default)
    #[arg(long, overrides_with = "ipv6")]
    pub no_ipv6: bool,

    /// Drop selected traffic instead of leaking it when the tunnel table
    /// cannot route it
    #[arg(short, long)]
    pub killswitch: bool,

    /// Networks that bypass the tunnel (repeatable)
    #[arg(long = "exclude", value_name = "CIDR")]
    pub exclude: Vec<IpCidr>,

    /// Route only these networks through the tunnel (repeatable)
    #[arg(long = "net", value_name = "CIDR")]
    pub net: Vec<IpCidr>,

    /// Nameservers for the command's namespace (repeatable)
    #[arg(long = "dns", value_name = "IP")]
    pub dns: Vec<IpAddr>,

    /// Command and arguments to execute
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub cmd: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the configuration file; exit 0 when it is valid, 1 otherwise
    #[command()]
    Validate {
        /// General configuration file
        #[arg(short, long)]
        config_file: PathBuf,
    },
}

pub fn parse() -> Cli {
    Cli::parse()
}
