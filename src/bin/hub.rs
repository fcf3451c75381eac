use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use starmesh::config::HubConfig;
use starmesh::crypto::PacketCipher;
use starmesh::nat::ExitNodeGuard;
use starmesh::router::RoutingTable;
use starmesh::tun::{self, TunConfig, TunInterface};
use starmesh::{dashboard, Hub};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(
    name = "starmesh-hub",
    version,
    about = "Central hub for the starmesh overlay VPN",
    long_about = "Listens for encrypted UDP from agents, learns their real \
        addresses, forwards overlay traffic between them and optionally \
        NATs overlay traffic out to the internet.\n\n\
        Example:\n  \
          sudo starmesh-hub --local-port 45678 --tun-ip 10.0.0.1 --secret MySecret"
)]
struct Args {
    /// Local UDP port to listen on
    #[arg(long)]
    local_port: Option<u16>,

    /// TCP port for the web dashboard
    #[arg(long)]
    web_port: Option<u16>,

    /// Overlay address of this hub
    #[arg(long)]
    tun_ip: Option<Ipv4Addr>,

    /// Shared secret for datagram encryption
    #[arg(long)]
    secret: Option<String>,

    /// Overlay address of the peer acting as exit node
    #[arg(long)]
    exit_node: Option<Ipv4Addr>,

    /// Tunnel interface name
    #[arg(long)]
    tun_name: Option<String>,

    /// Path to a TOML config file
    #[arg(long, short = 'C')]
    config: Option<std::path::PathBuf>,
}

fn resolve_config(args: Args) -> HubConfig {
    let mut cfg = if let Some(path) = &args.config {
        HubConfig::load(path).unwrap_or_else(|e| {
            warn!("failed to load config from {:?}: {}. Using defaults.", path, e);
            HubConfig::default()
        })
    } else {
        HubConfig::load_or_default()
    };

    if let Some(port) = args.local_port {
        cfg.local_port = port;
    }
    if let Some(port) = args.web_port {
        cfg.web_port = port;
    }
    if let Some(ip) = args.tun_ip {
        cfg.tun_ip = ip;
    }
    if let Some(secret) = args.secret {
        cfg.secret = secret;
    }
    if let Some(ip) = args.exit_node {
        cfg.exit_node = Some(ip);
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

    let cipher = PacketCipher::new(&cfg.secret);

    tun::check_tun_permissions()?;
    let iface = TunInterface::create(TunConfig::new(&cfg.tun_name, cfg.tun_ip))
        .context("tunnel setup failed")?;
    let tun_name = iface.name().to_string();

    let table = Arc::new(RoutingTable::new());
    if let Some(exit_ip) = cfg.exit_node {
        table.set_exit_node(exit_ip);
    }

    // When this hub is its own exit node, the host kernel does the NATing;
    // the guard reverts the rules when main returns.
    let local_exit = cfg.exit_node == Some(cfg.tun_ip);
    let _nat_guard = if local_exit {
        Some(ExitNodeGuard::enable(&tun_name).context("failed to enable exit node")?)
    } else {
        None
    };

    let socket = UdpSocket::bind(("0.0.0.0", cfg.local_port))
        .await
        .context("failed to bind UDP socket")?;
    info!("hub listening on UDP/{}", cfg.local_port);

    let dash_table = Arc::clone(&table);
    let web_port = cfg.web_port;
    tokio::spawn(async move {
        if let Err(e) = dashboard::serve(dash_table, web_port).await {
            error!("dashboard failed: {}", e);
        }
    });

    let hub = Hub::new(socket, cipher, Arc::clone(&table), cfg.tun_ip, local_exit);
    tokio::select! {
        res = hub.run(iface.into_device()) => res,
        _ = signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
