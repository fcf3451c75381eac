//! Layer-3 tunnel device wrapper.
//!
//! Opens a TUN interface, assigns the overlay address and brings the link
//! up. Reads and writes are whole IPv4 packets; nothing here parses them.

use anyhow::{Context, Result};
use log::info;
#[cfg(target_os = "linux")]
use log::warn;
use std::net::Ipv4Addr;

/// Tunnel MTU. 1300 leaves room for the 28-byte datagram framing plus the
/// outer IP and UDP headers under common path MTUs.
pub const TUN_MTU: u16 = 1300;

/// Tunnel interface parameters.
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Interface name (e.g. "star0").
    pub name: String,
    /// Overlay address assigned to the interface.
    pub address: Ipv4Addr,
    /// Overlay netmask, /24 by convention.
    pub netmask: Ipv4Addr,
    pub mtu: u16,
}

impl TunConfig {
    pub fn new(name: &str, address: Ipv4Addr) -> Self {
        Self {
            name: name.to_string(),
            address,
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            mtu: TUN_MTU,
        }
    }
}

/// An open, configured tunnel device.
pub struct TunInterface {
    device: tun2::AsyncDevice,
    config: TunConfig,
}

impl TunInterface {
    /// Create the device, assign `<address>/24`, set the MTU and bring the
    /// link up. Any failure here is fatal to the caller.
    pub fn create(config: TunConfig) -> Result<Self> {
        let mut tun_config = tun2::Configuration::default();
        tun_config
            .tun_name(&config.name)
            .address(config.address)
            .netmask(config.netmask)
            .mtu(config.mtu)
            .up();

        #[cfg(target_os = "linux")]
        tun_config.platform_config(|p| {
            p.packet_information(false);
        });

        let device = tun2::create_as_async(&tun_config)
            .context("failed to create tunnel device")?;

        info!(
            "tunnel {} up at {}/{} mtu {}",
            config.name, config.address, config.netmask, config.mtu
        );
        Ok(Self { device, config })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn address(&self) -> Ipv4Addr {
        self.config.address
    }

    /// Hand the device over to a forwarder, which splits it into one
    /// reading and one writing half.
    pub fn into_device(self) -> tun2::AsyncDevice {
        self.device
    }
}

/// Preflight check that tunnel creation can work at all.
pub fn check_tun_permissions() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        if std::fs::metadata("/dev/net/tun").is_err() {
            anyhow::bail!("/dev/net/tun not available; is the tun module loaded?");
        }
        if unsafe { libc::geteuid() } != 0 {
            warn!("not running as root; tunnel creation may fail without CAP_NET_ADMIN");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = TunConfig::new("star0", Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(config.name, "star0");
        assert_eq!(config.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(config.mtu, 1300);
    }
}
