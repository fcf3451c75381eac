//! Host-side NAT, forwarding and route configuration.
//!
//! Exit-node mode turns the hub's host kernel into the overlay's internet
//! gateway: IPv4 forwarding plus three iptables rules scoped to the tunnel
//! interface. Agents can separately override their default route so all
//! traffic enters the tunnel. Both are expressed as guards whose `Drop`
//! reverts the host, so teardown runs on every exit path once install
//! succeeded.

use anyhow::{anyhow, bail, Context, Result};
use log::{error, info};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::process::Command;

const TABLE_NAT: &str = "nat";
const TABLE_FILTER: &str = "filter";
const CHAIN_POSTROUTING: &str = "POSTROUTING";
const CHAIN_FORWARD: &str = "FORWARD";
const TARGET_MASQUERADE: &str = "MASQUERADE";
const TARGET_ACCEPT: &str = "ACCEPT";

/// One iptables rule, described once so install and teardown use the exact
/// same matcher tuple.
#[derive(Debug, Clone)]
pub struct NatRule {
    pub name: &'static str,
    pub table: &'static str,
    pub chain: &'static str,
    pub args: Vec<String>,
}

/// The three rules that make a host forward and source-NAT overlay traffic
/// out through its physical interfaces.
fn exit_node_rules(tun_name: &str) -> Vec<NatRule> {
    vec![
        NatRule {
            name: "masquerade outbound",
            table: TABLE_NAT,
            chain: CHAIN_POSTROUTING,
            args: vec![
                "!".into(),
                "-o".into(),
                tun_name.into(),
                "-j".into(),
                TARGET_MASQUERADE.into(),
            ],
        },
        NatRule {
            name: "forward from tunnel",
            table: TABLE_FILTER,
            chain: CHAIN_FORWARD,
            args: vec!["-i".into(), tun_name.into(), "-j".into(), TARGET_ACCEPT.into()],
        },
        NatRule {
            name: "forward to tunnel (established)",
            table: TABLE_FILTER,
            chain: CHAIN_FORWARD,
            args: vec![
                "-o".into(),
                tun_name.into(),
                "-m".into(),
                "state".into(),
                "--state".into(),
                "RELATED,ESTABLISHED".into(),
                "-j".into(),
                TARGET_ACCEPT.into(),
            ],
        },
    ]
}

fn run_cmd<I, S>(program: &str, args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args);
    let output = cmd
        .output()
        .with_context(|| format!("failed to execute {:?}", cmd))?;
    if !output.status.success() {
        bail!(
            "{:?} failed: {}",
            cmd,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// iptables exits 0 from `-C` when the rule is present.
fn rule_exists(rule: &NatRule) -> bool {
    Command::new("iptables")
        .args(["-t", rule.table, "-C", rule.chain])
        .args(&rule.args)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check-then-insert at position 1 so the rule takes precedence over any
/// pre-existing chain contents (container runtimes, firewall front-ends).
fn ensure_rule(rule: &NatRule) -> Result<()> {
    if rule_exists(rule) {
        return Ok(());
    }
    let mut args: Vec<String> = vec![
        "-t".into(),
        rule.table.into(),
        "-I".into(),
        rule.chain.into(),
        "1".into(),
    ];
    args.extend(rule.args.iter().cloned());
    run_cmd("iptables", &args)?;
    info!("applied rule: {}", rule.name);
    Ok(())
}

/// Delete by the exact matcher tuple used to install.
fn delete_rule(rule: &NatRule) -> Result<()> {
    let mut args: Vec<String> = vec![
        "-t".into(),
        rule.table.into(),
        "-D".into(),
        rule.chain.into(),
    ];
    args.extend(rule.args.iter().cloned());
    run_cmd("iptables", &args)?;
    info!("removed rule: {}", rule.name);
    Ok(())
}

/// Holds the host in exit-node state. Dropping the guard tears the rules
/// back down.
pub struct ExitNodeGuard {
    rules: Vec<NatRule>,
}

impl ExitNodeGuard {
    /// Enable kernel forwarding and install the NAT ruleset. Any failure
    /// aborts the whole enablement and the caller must not serve.
    pub fn enable(tun_name: &str) -> Result<Self> {
        info!("enabling exit node on interface {}", tun_name);

        run_cmd("sysctl", ["-w", "net.ipv4.ip_forward=1"])
            .context("failed to enable net.ipv4.ip_forward")?;

        let rules = exit_node_rules(tun_name);
        for rule in &rules {
            ensure_rule(rule)
                .with_context(|| format!("failed to apply rule '{}'", rule.name))?;
        }

        info!("exit node active: NAT and forwarding rules applied");
        Ok(Self { rules })
    }
}

impl Drop for ExitNodeGuard {
    fn drop(&mut self) {
        info!("cleaning up NAT and forwarding rules");
        for rule in &self.rules {
            // Best effort: keep going so one stuck rule cannot strand the rest.
            if let Err(e) = delete_rule(rule) {
                error!("failed to remove rule '{}': {}", rule.name, e);
            }
        }
    }
}

/// Routes installed by [`RouteOverrideGuard`], kept for symmetric deletion.
struct OverrideRoute {
    args: Vec<String>,
}

/// Forces all internet traffic through the tunnel without touching the
/// pre-existing default route: a host route pins the hub's real address to
/// the old gateway, then 0.0.0.0/1 and 128.0.0.0/1 via the tunnel shadow
/// the default.
pub struct RouteOverrideGuard {
    routes: Vec<OverrideRoute>,
}

impl RouteOverrideGuard {
    pub fn install(tun_name: &str, hub_real_ip: IpAddr) -> Result<Self> {
        let gateway = default_gateway().context("failed to detect default gateway")?;
        info!(
            "local gateway {}; redirecting all traffic via {}",
            gateway, tun_name
        );

        let hub = hub_real_ip.to_string();
        let gw = gateway.to_string();

        // Anti-loop: encrypted datagrams to the hub must keep using the
        // physical path.
        run_cmd("ip", ["route", "add", &hub, "via", &gw])
            .context("failed to pin hub route to the old gateway")?;

        if let Err(e) = run_cmd("ip", ["route", "add", "0.0.0.0/1", "dev", tun_name]) {
            let _ = run_cmd("ip", ["route", "del", &hub]);
            return Err(e.context("failed to add 0.0.0.0/1 route"));
        }
        if let Err(e) = run_cmd("ip", ["route", "add", "128.0.0.0/1", "dev", tun_name]) {
            let _ = run_cmd("ip", ["route", "del", "0.0.0.0/1"]);
            let _ = run_cmd("ip", ["route", "del", &hub]);
            return Err(e.context("failed to add 128.0.0.0/1 route"));
        }

        Ok(Self {
            routes: vec![
                OverrideRoute { args: vec!["0.0.0.0/1".into()] },
                OverrideRoute { args: vec!["128.0.0.0/1".into()] },
                OverrideRoute { args: vec![hub] },
            ],
        })
    }
}

impl Drop for RouteOverrideGuard {
    fn drop(&mut self) {
        info!("restoring default routes");
        for route in &self.routes {
            let mut args: Vec<String> = vec!["route".into(), "del".into()];
            args.extend(route.args.iter().cloned());
            if let Err(e) = run_cmd("ip", &args) {
                error!("failed to delete route {:?}: {}", route.args, e);
            }
        }
    }
}

/// Parse /proc/net/route for the current default gateway.
fn default_gateway() -> Result<Ipv4Addr> {
    let table = fs::read_to_string("/proc/net/route")
        .context("failed to read /proc/net/route")?;

    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        // Destination 00000000 is the default route.
        if fields[1] == "00000000" && fields[2] != "00000000" {
            return parse_hex_gateway(fields[2]);
        }
    }
    Err(anyhow!("no default gateway found"))
}

/// Gateways in /proc/net/route are little-endian hex.
fn parse_hex_gateway(hex_str: &str) -> Result<Ipv4Addr> {
    let bytes = hex::decode(hex_str).context("invalid gateway hex")?;
    if bytes.len() != 4 {
        bail!("unexpected gateway length: {} bytes", bytes.len());
    }
    Ok(Ipv4Addr::new(bytes[3], bytes[2], bytes[1], bytes[0]))
}
