mod cli;

use tokio::signal::unix::{SignalKind, signal};

use std::path::Path;
use std::process;

use wepwawet_lib::config::Config;
use wepwawet_lib::engine::RoutingEngine;
use wepwawet_lib::firewall::{FirewallOps, RealFirewallOps};
use wepwawet_lib::netlink::RealNetlinkOps;
use wepwawet_lib::policy::{NamespacePolicy, Policy, ProcessPolicy};
use wepwawet_lib::wireguard::{TunnelDriver, WireGuardDriver};
use wepwawet_lib::{alloc, logging};

use crate::cli::{Command, ConfigCommand, ExecArgs};

#[tokio::main]
async fn main() {
    let cli = cli::parse();
    logging::init(&cli.log_level);

    let code = match cli.command {
        Command::Run { config_file } => run(&config_file).await,
        Command::Exec(args) => exec(*args).await,
        Command::Config(ConfigCommand::Validate { config_file }) => validate(&config_file).await,
        Command::Gc { tag_prefix } => gc(&tag_prefix).await,
    };
    process::exit(code);
}

/// Tunnel up, engine up, wait for SIGINT/SIGTERM, tear down in reverse.
async fn run(config_file: &Path) -> i32 {
    let config = match Config::from_path(config_file).await {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, path = %config_file.display(), "cannot load configuration");
            return exitcode::CONFIG;
        }
    };

    let netlink = match RealNetlinkOps::connect() {
        Ok(netlink) => netlink,
        Err(error) => {
            tracing::error!(%error, "cannot open netlink connection");
            return exitcode::OSERR;
        }
    };

    let mut driver = config
        .vpn
        .as_ref()
        .map(|vpn| WireGuardDriver::from_config(netlink.clone(), &config.interface, vpn));
    if let Some(driver) = &mut driver
        && let Err(error) = driver.up().await
    {
        tracing::error!(%error, "tunnel bring-up failed");
        return exitcode::OSERR;
    }

    let mut engine = RoutingEngine::new(
        netlink.clone(),
        RealFirewallOps,
        &config.interface,
        config.table_name,
        config.ipv6,
    )
    .with_exemption_nets(config.nets.clone())
    .with_policies(config.build_policies());

    if let Err(error) = engine.up().await {
        tracing::error!(%error, "routing bring-up failed");
        tunnel_down(&mut driver).await;
        return exitcode::OSERR;
    }

    wait_for_signal().await;

    let mut code = exitcode::OK;
    if let Err(error) = engine.down().await {
        tracing::error!(%error, "routing teardown incomplete");
        code = exitcode::OSERR;
    }
    if !tunnel_down(&mut driver).await {
        code = exitcode::OSERR;
    }
    code
}

/// One-shot: engine up with a process policy around the command, execute,
/// tear down, exit with the child's code.
async fn exec(args: ExecArgs) -> i32 {
    let netlink = match RealNetlinkOps::connect() {
        Ok(netlink) => netlink,
        Err(error) => {
            tracing::error!(%error, "cannot open netlink connection");
            return exitcode::OSERR;
        }
    };

    let table = match args.table {
        Some(table) => table,
        None => match alloc::find_free_table(&netlink, alloc::TABLE_ID_START).await {
            Ok(table) => table,
            Err(error) => {
                tracing::error!(%error, "cannot allocate a routing table");
                return exitcode::OSERR;
            }
        },
    };
    let ns_name = match alloc::find_free_netns_name(&netlink, alloc::NAME_BASE).await {
        Ok(name) => name,
        Err(error) => {
            tracing::error!(%error, "cannot allocate a namespace name");
            return exitcode::OSERR;
        }
    };

    let ipv6 = args.ipv6 && !args.no_ipv6;
    let namespace = NamespacePolicy::new(ns_name, args.dns, args.killswitch, ipv6);
    let policy = Policy::Process(ProcessPolicy::new(namespace, args.cmd));

    let mut engine = RoutingEngine::new(netlink, RealFirewallOps, &args.interface, table, ipv6)
        .with_exemption_nets(args.exclude)
        .with_tunnel_nets(args.net)
        .with_policies(vec![policy]);

    if let Err(error) = engine.up().await {
        tracing::error!(%error, "routing bring-up failed");
        return exitcode::OSERR;
    }

    // A termination signal drops the action future, which reaps the child;
    // teardown then runs either way.
    let child_code = tokio::select! {
        result = engine.action() => match result {
            Ok(code) => code,
            Err(error) => {
                tracing::error!(%error, "command execution failed");
                None
            }
        },
        _ = wait_for_signal() => None,
    };

    if let Err(error) = engine.down().await {
        tracing::error!(%error, "routing teardown incomplete");
    }

    child_code.unwrap_or(exitcode::SOFTWARE)
}

async fn validate(config_file: &Path) -> i32 {
    match Config::from_path(config_file).await {
        Ok(_) => {
            println!("config file is valid");
            exitcode::OK
        }
        Err(error) => {
            eprintln!("config file is invalid: {error}");
            1
        }
    }
}

async fn gc(tag_prefix: &str) -> i32 {
    match RealFirewallOps.masquerade_gc(tag_prefix).await {
        Ok(removed) => {
            println!("removed {removed} orphaned masquerade entries");
            exitcode::OK
        }
        Err(error) => {
            tracing::error!(%error, "masquerade collection failed");
            exitcode::OSERR
        }
    }
}

async fn tunnel_down<T: TunnelDriver>(driver: &mut Option<T>) -> bool {
    let Some(driver) = driver else { return true };
    match driver.down().await {
        Ok(()) => true,
        Err(error) => {
            tracing::error!(%error, "tunnel teardown failed");
            false
        }
    }
}

async fn wait_for_signal() {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(signal) => signal,
        Err(error) => {
            tracing::error!(%error, "cannot install SIGINT handler");
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(error) => {
            tracing::error!(%error, "cannot install SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => tracing::info!("received SIGINT"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
    }
}
