//! Learning routing table: overlay IP to last observed real UDP endpoint.
//!
//! The hub learns peer locations from authenticated traffic instead of a
//! configured peer list. Records are never evicted; the dashboard reports
//! staleness from `last_seen` but liveness is not enforced.

use log::{debug, info};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// State of one peer on the overlay.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Overlay address, the stable key.
    pub overlay_ip: Ipv4Addr,
    /// Source address of the most recent authenticated datagram. Updated
    /// in place when the peer's NAT binding moves.
    pub endpoint: SocketAddr,
    /// Time of the most recent authenticated datagram.
    pub last_seen: Instant,
    /// Plaintext bytes received from this peer.
    pub rx_bytes: u64,
    /// Plaintext bytes forwarded to this peer.
    pub tx_bytes: u64,
}

#[derive(Default)]
struct Inner {
    peers: HashMap<Ipv4Addr, PeerRecord>,
    exit_node: Option<Ipv4Addr>,
}

/// Concurrent peer table shared by the forwarder pumps and the dashboard.
///
/// A single readers-writer lock guards the whole structure; every critical
/// section is short and never held across an await point.
#[derive(Default)]
pub struct RoutingTable {
    inner: RwLock<Inner>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Upsert the record for `overlay_ip` from an authenticated datagram,
    /// adopting `real_addr` as the peer's current endpoint and refreshing
    /// `last_seen`. An unspecified source address is never learned.
    pub fn learn(&self, overlay_ip: Ipv4Addr, real_addr: SocketAddr) {
        if overlay_ip.is_unspecified() {
            return;
        }
        let mut inner = self.write();
        match inner.peers.entry(overlay_ip) {
            Entry::Occupied(mut entry) => {
                let peer = entry.get_mut();
                if peer.endpoint != real_addr {
                    info!("peer {} moved to {}", overlay_ip, real_addr);
                    peer.endpoint = real_addr;
                }
                peer.last_seen = Instant::now();
            }
            Entry::Vacant(entry) => {
                info!("new peer {} at {}", overlay_ip, real_addr);
                entry.insert(PeerRecord {
                    overlay_ip,
                    endpoint: real_addr,
                    last_seen: Instant::now(),
                    rx_bytes: 0,
                    tx_bytes: 0,
                });
            }
        }
    }

    /// Refresh `last_seen` for the peer currently mapped to `real_addr`.
    /// Keepalives carry no overlay address, so this is the only way an
    /// empty datagram can prove a peer alive.
    pub fn touch_endpoint(&self, real_addr: SocketAddr) {
        let mut inner = self.write();
        for peer in inner.peers.values_mut() {
            if peer.endpoint == real_addr {
                peer.last_seen = Instant::now();
            }
        }
    }

    /// Add received plaintext bytes to a known peer. Unknown peers are a
    /// no-op.
    pub fn record_rx(&self, overlay_ip: Ipv4Addr, bytes: u64) {
        let mut inner = self.write();
        if let Some(peer) = inner.peers.get_mut(&overlay_ip) {
            peer.rx_bytes = peer.rx_bytes.wrapping_add(bytes);
        }
    }

    /// Add forwarded plaintext bytes to a known peer. Unknown peers are a
    /// no-op.
    pub fn record_tx(&self, overlay_ip: Ipv4Addr, bytes: u64) {
        let mut inner = self.write();
        if let Some(peer) = inner.peers.get_mut(&overlay_ip) {
            peer.tx_bytes = peer.tx_bytes.wrapping_add(bytes);
        }
    }

    /// Current real endpoint of `overlay_ip`, if known.
    pub fn lookup(&self, overlay_ip: Ipv4Addr) -> Option<SocketAddr> {
        self.read().peers.get(&overlay_ip).map(|p| p.endpoint)
    }

    /// Routing decision for a destination overlay address: a direct peer
    /// match wins, otherwise the exit node's endpoint serves as the default
    /// route, otherwise the packet has no route and must be dropped.
    pub fn get_route(&self, dst: Ipv4Addr) -> Option<SocketAddr> {
        let inner = self.read();
        if let Some(peer) = inner.peers.get(&dst) {
            return Some(peer.endpoint);
        }
        if let Some(exit_ip) = inner.exit_node {
            if let Some(exit_peer) = inner.peers.get(&exit_ip) {
                return Some(exit_peer.endpoint);
            }
            debug!("exit node {} has not registered yet", exit_ip);
        }
        None
    }

    /// Designate the overlay address whose endpoint serves as the default
    /// route. May be called before that peer has registered; `get_route`
    /// falls through until it has.
    pub fn set_exit_node(&self, overlay_ip: Ipv4Addr) {
        self.write().exit_node = Some(overlay_ip);
        info!("exit node set to {}", overlay_ip);
    }

    /// Point-in-time value copy of every record, safe to iterate without
    /// holding the lock.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.read().peers.values().cloned().collect()
    }
}
