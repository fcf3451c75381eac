//! Configuration for the hub and agent binaries.
//!
//! Values come from an optional TOML file with serde defaults; command-line
//! flags override whatever the file provided.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

/// Hub settings.
#[derive(Debug, Deserialize)]
pub struct HubConfig {
    /// UDP port the transport listens on.
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// TCP port for the web dashboard.
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    /// This hub's overlay address, the gateway of the subnet.
    #[serde(default = "default_hub_overlay_ip")]
    pub tun_ip: Ipv4Addr,
    #[serde(default = "default_secret")]
    pub secret: String,
    /// Overlay address of the peer acting as exit node. When it equals
    /// `tun_ip` the hub itself NATs overlay traffic out.
    #[serde(default)]
    pub exit_node: Option<Ipv4Addr>,
    #[serde(default = "default_tun_name")]
    pub tun_name: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            local_port: default_local_port(),
            web_port: default_web_port(),
            tun_ip: default_hub_overlay_ip(),
            secret: default_secret(),
            exit_node: None,
            tun_name: default_tun_name(),
        }
    }
}

/// Agent settings. `hub_ip` and `tun_ip` have no sensible defaults and are
/// validated by the binary before serving.
#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    /// Real (WAN) address of the hub.
    #[serde(default)]
    pub hub_ip: Option<IpAddr>,
    /// Hub UDP port. Matches the hub's bind default.
    #[serde(default = "default_local_port")]
    pub hub_port: u16,
    /// This agent's overlay address.
    #[serde(default)]
    pub tun_ip: Option<Ipv4Addr>,
    #[serde(default = "default_secret")]
    pub secret: String,
    /// The hub's overlay address, used as the registration destination.
    #[serde(default = "default_hub_overlay_ip")]
    pub hub_tun_ip: Ipv4Addr,
    /// Send all internet traffic through the tunnel.
    #[serde(default)]
    pub redirect_gateway: bool,
    #[serde(default = "default_tun_name")]
    pub tun_name: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hub_ip: None,
            hub_port: default_local_port(),
            tun_ip: None,
            secret: default_secret(),
            hub_tun_ip: default_hub_overlay_ip(),
            redirect_gateway: false,
            tun_name: default_tun_name(),
        }
    }
}

fn default_local_port() -> u16 {
    45678
}
fn default_web_port() -> u16 {
    8080
}
fn default_hub_overlay_ip() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 1)
}
fn default_secret() -> String {
    "change-this-password".to_string()
}
fn default_tun_name() -> String {
    "star0".to_string()
}

fn load_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {:?}", path))?;
    toml::from_str(&content).context("failed to parse TOML config")
}

fn load_first<T: serde::de::DeserializeOwned + Default>(paths: &[&str]) -> T {
    for path in paths {
        let expanded = shellexpand::tilde(path).to_string();
        if Path::new(&expanded).exists() {
            if let Ok(config) = load_toml(Path::new(&expanded)) {
                return config;
            }
        }
    }
    T::default()
}

impl HubConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_toml(path.as_ref())
    }

    /// Search the standard locations, falling back to defaults.
    pub fn load_or_default() -> Self {
        load_first(&[
            "/etc/starmesh/hub.toml",
            "~/.starmesh/hub.toml",
            "./hub.toml",
        ])
    }
}

impl AgentConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_toml(path.as_ref())
    }

    pub fn load_or_default() -> Self {
        load_first(&[
            "/etc/starmesh/agent.toml",
            "~/.starmesh/agent.toml",
            "./agent.toml",
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.local_port, 45678);
        assert_eq!(config.web_port, 8080);
        assert_eq!(config.tun_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(config.exit_node, None);
        assert_eq!(config.tun_name, "star0");
    }

    #[test]
    fn agent_port_default_matches_hub_bind_default() {
        let hub = HubConfig::default();
        let agent = AgentConfig::default();
        assert_eq!(agent.hub_port, hub.local_port);
    }

    #[test]
    fn hub_toml_overrides_defaults() {
        let config: HubConfig = toml::from_str(
            r#"
            local_port = 5555
            tun_ip = "10.0.0.1"
            exit_node = "10.0.0.1"
            secret = "s3cret"
            "#,
        )
        .unwrap();
        assert_eq!(config.local_port, 5555);
        assert_eq!(config.exit_node, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(config.secret, "s3cret");
        // Unset keys keep their defaults.
        assert_eq!(config.web_port, 8080);
    }

    #[test]
    fn agent_toml_overrides_defaults() {
        let config: AgentConfig = toml::from_str(
            r#"
            hub_ip = "203.0.113.4"
            tun_ip = "10.0.0.2"
            redirect_gateway = true
            "#,
        )
        .unwrap();
        assert_eq!(config.hub_ip, Some("203.0.113.4".parse().unwrap()));
        assert_eq!(config.tun_ip, Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert!(config.redirect_gateway);
        assert_eq!(config.hub_port, 45678);
        assert_eq!(config.hub_tun_ip, Ipv4Addr::new(10, 0, 0, 1));
    }
}
