use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use starmesh::config::AgentConfig;
use starmesh::crypto::PacketCipher;
use starmesh::nat::RouteOverrideGuard;
use starmesh::tun::{self, TunConfig, TunInterface};
use starmesh::Agent;
use std::net::{IpAddr, Ipv4Addr};
use tokio::net::UdpSocket;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(
    name = "starmesh-agent",
    version,
    about = "Spoke endpoint for the starmesh overlay VPN",
    long_about = "Dials the hub over UDP, registers its overlay address and \
        bridges the local tunnel device to the hub.\n\n\
        Example:\n  \
          sudo starmesh-agent --hub-ip 203.0.113.4 --tun-ip 10.0.0.2 --secret MySecret"
)]
struct Args {
    /// Real (WAN) address of the hub
    #[arg(long)]
    hub_ip: Option<IpAddr>,

    /// Hub UDP port
    #[arg(long)]
    hub_port: Option<u16>,

    /// Overlay address of this agent
    #[arg(long)]
    tun_ip: Option<Ipv4Addr>,

    /// Shared secret for datagram encryption
    #[arg(long)]
    secret: Option<String>,

    /// Overlay address of the hub (registration destination)
    #[arg(long)]
    hub_tun_ip: Option<Ipv4Addr>,

    /// Send all internet traffic through the tunnel
    #[arg(long)]
    redirect_gateway: bool,

    /// Tunnel interface name
    #[arg(long)]
    tun_name: Option<String>,

    /// Path to a TOML config file
    #[arg(long, short = 'C')]
    config: Option<std::path::PathBuf>,
}

fn resolve_config(args: Args) -> AgentConfig {
    let mut cfg = if let Some(path) = &args.config {
        AgentConfig::load(path).unwrap_or_else(|e| {
            warn!("failed to load config from {:?}: {}. Using defaults.", path, e);
            AgentConfig::default()
        })
    } else {
        AgentConfig::load_or_default()
    };

    if let Some(ip) = args.hub_ip {
        cfg.hub_ip = Some(ip);
    }
    if let Some(port) = args.hub_port {
        cfg.hub_port = port;
    }
    if let Some(ip) = args.tun_ip {
        cfg.tun_ip = Some(ip);
    }
    if let Some(secret) = args.secret {
        cfg.secret = secret;
    }
    if let Some(ip) = args.hub_tun_ip {
        cfg.hub_tun_ip = ip;
    }
    if args.redirect_gateway {
        cfg.redirect_gateway = true;
    }
    if let Some(name) = args.tun_name {
        cfg.tun_name = name;
    }
    cfg
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cfg = resolve_config(Args::parse());

    let hub_ip = match cfg.hub_ip {
        Some(ip) => ip,
        None => bail!("--hub-ip is required (the hub's public address)"),
    };
    let tun_ip = match cfg.tun_ip {
        Some(ip) => ip,
        None => bail!("--tun-ip is required (this agent's overlay address)"),
    };

    let cipher = PacketCipher::new(&cfg.secret);

    tun::check_tun_permissions()?;
    let iface = TunInterface::create(TunConfig::new(&cfg.tun_name, tun_ip))
        .context("tunnel setup failed")?;
    let tun_name = iface.name().to_string();

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind UDP socket")?;
    socket
        .connect((hub_ip, cfg.hub_port))
        .await
        .context("failed to dial the hub")?;
    info!("agent {} dialing hub at {}:{}", tun_ip, hub_ip, cfg.hub_port);

    // Installed after the hub route exists; reverted when main returns.
    let _route_guard = if cfg.redirect_gateway {
        Some(
            RouteOverrideGuard::install(&tun_name, hub_ip)
                .context("failed to redirect the default route")?,
        )
    } else {
        None
    };

    let agent = Agent::new(socket, cipher, tun_ip, cfg.hub_tun_ip);
    tokio::select! {
        res = agent.run(iface.into_device()) => res,
        _ = signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
