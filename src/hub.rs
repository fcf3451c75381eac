//! Hub packet-forwarding engine.
//!
//! Two pumps bridge the UDP socket and the tunnel device through the
//! learning routing table. Every forwarded packet is decrypted and sealed
//! again under a hub-generated nonce, which keeps nonces unique per sender
//! without coordination; the hub sees all overlay traffic in the clear,
//! the trust property of the star topology.

use crate::crypto::PacketCipher;
use crate::router::RoutingTable;
use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;

/// Large enough for any tunnel packet or wire datagram at the 1300 MTU.
const BUF_SIZE: usize = 2048;

/// A plaintext shorter than this cannot carry an IPv4 header.
pub(crate) const IPV4_HEADER_LEN: usize = 20;

/// Source address field of an IPv4 header. Caller guarantees at least 20
/// bytes.
pub(crate) fn ipv4_src(packet: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15])
}

/// Destination address field of an IPv4 header.
pub(crate) fn ipv4_dst(packet: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19])
}

/// The central forwarder: owns the listening socket, the codec and this
/// node's overlay identity; shares the routing table with the dashboard.
pub struct Hub {
    socket: UdpSocket,
    cipher: PacketCipher,
    table: Arc<RoutingTable>,
    overlay_ip: Ipv4Addr,
    /// True when this hub is itself the configured exit node, so packets
    /// for non-overlay destinations are handed to the local kernel.
    local_exit: bool,
}

impl Hub {
    pub fn new(
        socket: UdpSocket,
        cipher: PacketCipher,
        table: Arc<RoutingTable>,
        overlay_ip: Ipv4Addr,
        local_exit: bool,
    ) -> Self {
        Self {
            socket,
            cipher,
            table,
            overlay_ip,
            local_exit,
        }
    }

    /// Drive both pumps until a fatal error. The only fatal condition is
    /// the tunnel device failing; socket errors are absorbed at the pump
    /// boundary.
    pub async fn run<D>(self, device: D) -> Result<()>
    where
        D: AsyncRead + AsyncWrite,
    {
        info!(
            "hub forwarder up (overlay {}, local exit: {})",
            self.overlay_ip, self.local_exit
        );
        let (tun_reader, tun_writer) = tokio::io::split(device);
        tokio::select! {
            res = self.inbound(tun_writer) => res,
            res = self.outbound(tun_reader) => res,
        }
    }

    /// Socket to routing decision: authenticate, learn the sender, then
    /// deliver to a peer, the local tunnel or the kernel.
    async fn inbound<D: AsyncWrite>(&self, mut tun: WriteHalf<D>) -> Result<()> {
        let mut buf = [0u8; BUF_SIZE];
        loop {
            let (n, real_addr) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    debug!("socket recv failed: {}", e);
                    continue;
                }
            };

            let plaintext = match self.cipher.open(&buf[..n]) {
                Ok(p) => p,
                Err(_) => continue,
            };

            if plaintext.is_empty() {
                // Keepalive. It authenticated, so the sender is alive, but
                // it names no overlay address; refresh by endpoint instead.
                self.table.touch_endpoint(real_addr);
                continue;
            }
            if plaintext.len() < IPV4_HEADER_LEN {
                continue;
            }

            let src_ip = ipv4_src(&plaintext);
            let dst_ip = ipv4_dst(&plaintext);
            if src_ip.is_unspecified() {
                continue;
            }

            self.table.learn(src_ip, real_addr);
            self.table.record_rx(src_ip, plaintext.len() as u64);

            if self.table.lookup(dst_ip).is_some() {
                // Overlay traffic for another peer.
                self.forward(&plaintext, dst_ip).await;
            } else if dst_ip == self.overlay_ip {
                // Local delivery, e.g. a ping to the hub itself.
                if let Err(e) = tun.write_all(&plaintext).await {
                    warn!("tunnel write failed: {}", e);
                }
            } else if self.local_exit {
                // Internet traffic. Injected into our tunnel, the kernel
                // routes it out through the physical interface under the
                // masquerade rules.
                if let Err(e) = tun.write_all(&plaintext).await {
                    warn!("tunnel write failed: {}", e);
                }
            } else {
                debug!("drop: unknown destination {}", dst_ip);
            }
        }
    }

    /// Tunnel to routing decision. A device read failure is fatal; the
    /// device is assumed available for the process lifetime.
    async fn outbound<D: AsyncRead>(&self, mut tun: ReadHalf<D>) -> Result<()> {
        let mut buf = [0u8; BUF_SIZE];
        loop {
            let n = tun
                .read(&mut buf)
                .await
                .context("tunnel device read failed")?;
            if n == 0 {
                return Err(anyhow!("tunnel device closed"));
            }
            if n < IPV4_HEADER_LEN {
                continue;
            }
            let dst_ip = ipv4_dst(&buf[..n]);
            self.forward(&buf[..n], dst_ip).await;
        }
    }

    /// Route, seal under a fresh nonce and transmit. No route means the
    /// packet is silently dropped.
    async fn forward(&self, plaintext: &[u8], dst_ip: Ipv4Addr) {
        let endpoint = match self.table.get_route(dst_ip) {
            Some(ep) => ep,
            None => {
                debug!("drop: no route to {}", dst_ip);
                return;
            }
        };

        let datagram = match self.cipher.seal(plaintext) {
            Ok(d) => d,
            Err(e) => {
                warn!("encryption for {} failed: {}", dst_ip, e);
                return;
            }
        };

        match self.socket.send_to(&datagram, endpoint).await {
            Ok(_) => self.table.record_tx(dst_ip, plaintext.len() as u64),
            Err(e) => debug!("send to {} ({}) failed: {}", dst_ip, endpoint, e),
        }
    }
}
