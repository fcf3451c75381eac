//! Agent tunnel endpoint.
//!
//! An agent dials the hub's fixed UDP endpoint, announces its overlay
//! address once, keeps the NAT binding warm with empty keepalives and runs
//! the two pumps between its tunnel device and the dialed socket.

use crate::crypto::PacketCipher;
use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::time::interval;

const BUF_SIZE: usize = 2048;

/// Interval between empty keepalive datagrams. Twenty seconds sits inside
/// typical NAT UDP binding timeouts.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Build the registration packet: a bare 20-byte IPv4 header whose source
/// field announces this agent's overlay address to the hub. The hub's
/// inspection only reads the version nibble and the two address fields;
/// everything else stays zero.
pub(crate) fn registration_packet(overlay_ip: Ipv4Addr, hub_overlay_ip: Ipv4Addr) -> [u8; 20] {
    let mut packet = [0u8; 20];
    // Version 4, header length 5 words.
    packet[0] = 0x45;
    packet[12..16].copy_from_slice(&overlay_ip.octets());
    packet[16..20].copy_from_slice(&hub_overlay_ip.octets());
    packet
}

/// Spoke endpoint: owns the codec and a socket dialed to the hub.
pub struct Agent {
    socket: UdpSocket,
    cipher: PacketCipher,
    overlay_ip: Ipv4Addr,
    hub_overlay_ip: Ipv4Addr,
}

impl Agent {
    /// `socket` must already be connected to the hub's real endpoint.
    pub fn new(
        socket: UdpSocket,
        cipher: PacketCipher,
        overlay_ip: Ipv4Addr,
        hub_overlay_ip: Ipv4Addr,
    ) -> Self {
        Self {
            socket,
            cipher,
            overlay_ip,
            hub_overlay_ip,
        }
    }

    /// Register once, then drive the keepalive timer and both pumps until
    /// a fatal error. As on the hub, only the tunnel device is fatal.
    pub async fn run<D>(self, device: D) -> Result<()>
    where
        D: AsyncRead + AsyncWrite,
    {
        info!("agent {} connected to hub", self.overlay_ip);
        let (tun_reader, tun_writer) = tokio::io::split(device);

        self.register().await;

        tokio::select! {
            res = self.keepalive_loop() => res,
            res = self.inbound(tun_writer) => res,
            res = self.outbound(tun_reader) => res,
        }
    }

    /// One synthetic header so the hub learns this overlay address before
    /// any organic traffic flows. Losing it only delays learning until the
    /// first real packet, so failure is logged rather than fatal.
    async fn register(&self) {
        let packet = registration_packet(self.overlay_ip, self.hub_overlay_ip);
        let result = match self.cipher.seal(&packet) {
            Ok(datagram) => self.socket.send(&datagram).await.map(|_| ()),
            Err(e) => {
                error!("failed to seal registration: {}", e);
                return;
            }
        };
        match result {
            Ok(()) => info!("registered overlay address {} with hub", self.overlay_ip),
            Err(e) => error!("failed to send registration: {}", e),
        }
    }

    async fn keepalive_loop(&self) -> Result<()> {
        let mut ticker = interval(KEEPALIVE_INTERVAL);
        // The first tick completes immediately; registration just went out.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.cipher.seal(&[]) {
                Ok(datagram) => {
                    if let Err(e) = self.socket.send(&datagram).await {
                        warn!("keepalive send failed: {}", e);
                    }
                }
                Err(e) => warn!("failed to seal keepalive: {}", e),
            }
        }
    }

    /// Hub to tunnel: decrypt and hand the packet to the kernel untouched.
    async fn inbound<D: AsyncWrite>(&self, mut tun: WriteHalf<D>) -> Result<()> {
        let mut buf = [0u8; BUF_SIZE];
        loop {
            let n = match self.socket.recv(&mut buf).await {
                Ok(n) => n,
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
                continue;
            }

            if let Err(e) = tun.write_all(&plaintext).await {
                warn!("tunnel write failed: {}", e);
            }
        }
    }

    /// Tunnel to hub: everything the kernel routes into the tunnel is
    /// sealed and sent, without local filtering or parsing.
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

            match self.cipher.seal(&buf[..n]) {
                Ok(datagram) => {
                    if let Err(e) = self.socket.send(&datagram).await {
                        debug!("send to hub failed: {}", e);
                    }
                }
                Err(e) => warn!("encryption failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_packet_layout() {
        let packet = registration_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
        );

        assert_eq!(packet.len(), 20);
        assert_eq!(packet[0], 0x45);
        assert_eq!(&packet[12..16], &[10, 0, 0, 2]);
        assert_eq!(&packet[16..20], &[10, 0, 0, 1]);
        // Every other byte stays zero.
        for (i, b) in packet.iter().enumerate() {
            if i != 0 && !(12..20).contains(&i) {
                assert_eq!(*b, 0, "byte {}", i);
            }
        }
    }
}
