//! Hub-and-spoke overlay VPN data plane.
//!
//! A central hub multiplexes an encrypted UDP transport among agents. Each
//! endpoint owns a layer-3 tunnel device on a shared overlay subnet
//! (10.0.0.0/24 by convention); the hub learns peer locations from
//! authenticated traffic, forwards overlay packets peer to peer through
//! itself and can bridge the overlay to the host kernel's NAT to act as an
//! internet exit.

pub mod agent;
pub mod config;
pub mod crypto;
pub mod dashboard;
pub mod hub;
pub mod nat;
pub mod router;
pub mod tun;

pub use agent::Agent;
pub use config::{AgentConfig, HubConfig};
pub use crypto::PacketCipher;
pub use hub::Hub;
pub use nat::{ExitNodeGuard, RouteOverrideGuard};
pub use router::{PeerRecord, RoutingTable};
pub use tun::{TunConfig, TunInterface};
