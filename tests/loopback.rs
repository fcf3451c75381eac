//! End-to-end loopback tests.
//!
//! Real UDP sockets on localhost carry the encrypted transport; in-memory
//! duplex streams stand in for the tunnel devices, the same trick as
//! mocking the kernel-facing resource so the whole pipeline runs without
//! privileges.

use starmesh::agent::Agent;
use starmesh::crypto::PacketCipher;
use starmesh::hub::Hub;
use starmesh::router::{PeerRecord, RoutingTable};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

const SECRET: &str = "loopback-test-secret";
const HUB_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const AGENT_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const AGENT_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 3);

struct TestHub {
    addr: SocketAddr,
    table: Arc<RoutingTable>,
    /// Our side of the hub's in-memory tunnel device.
    tun: DuplexStream,
}

async fn start_hub(local_exit: bool) -> TestHub {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let table = Arc::new(RoutingTable::new());

    let (device, tun) = tokio::io::duplex(64 * 1024);
    let hub = Hub::new(
        socket,
        PacketCipher::new(SECRET),
        Arc::clone(&table),
        HUB_IP,
        local_exit,
    );
    tokio::spawn(async move {
        let _ = hub.run(device).await;
    });

    TestHub { addr, table, tun }
}

struct TestAgent {
    addr: SocketAddr,
    /// Our side of the agent's in-memory tunnel device.
    tun: DuplexStream,
}

async fn start_agent(hub_addr: SocketAddr, overlay_ip: Ipv4Addr) -> TestAgent {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(hub_addr).await.unwrap();
    let addr = socket.local_addr().unwrap();

    let (device, tun) = tokio::io::duplex(64 * 1024);
    let agent = Agent::new(socket, PacketCipher::new(SECRET), overlay_ip, HUB_IP);
    tokio::spawn(async move {
        let _ = agent.run(device).await;
    });

    TestAgent { addr, tun }
}

/// Poll the routing table until `pred` holds or two seconds pass.
async fn wait_for_peers<F>(table: &RoutingTable, pred: F) -> Vec<PeerRecord>
where
    F: Fn(&[PeerRecord]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let snapshot = table.snapshot();
        if pred(&snapshot) {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached, snapshot: {:?}",
            snapshot
        );
        sleep(Duration::from_millis(10)).await;
    }
}

fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; 20 + payload.len()];
    packet[0] = 0x45;
    let total_len = (20 + payload.len()) as u16;
    packet[2..4].copy_from_slice(&total_len.to_be_bytes());
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet[20..].copy_from_slice(payload);
    packet
}

async fn read_packet(tun: &mut DuplexStream) -> Vec<u8> {
    let mut buf = [0u8; 2048];
    let n = timeout(Duration::from_secs(1), tun.read(&mut buf))
        .await
        .expect("no packet arrived within 1s")
        .unwrap();
    buf[..n].to_vec()
}

async fn assert_no_packet(tun: &mut DuplexStream) {
    let mut buf = [0u8; 2048];
    let result = timeout(Duration::from_millis(300), tun.read(&mut buf)).await;
    assert!(result.is_err(), "unexpected delivery: {:?}", &buf[..result.unwrap().unwrap()]);
}

#[tokio::test]
async fn cold_registration_populates_the_table() {
    let hub = start_hub(false).await;
    let agent = start_agent(hub.addr, AGENT_A).await;

    let snapshot = wait_for_peers(&hub.table, |peers| !peers.is_empty()).await;

    assert_eq!(snapshot.len(), 1);
    let peer = &snapshot[0];
    assert_eq!(peer.overlay_ip, AGENT_A);
    assert_eq!(peer.endpoint, agent.addr);
    assert!(peer.last_seen.elapsed() < Duration::from_secs(1));
    assert!(peer.rx_bytes >= 20);
}

#[tokio::test]
async fn peer_to_peer_roundtrip_is_bit_identical() {
    let hub = start_hub(false).await;
    let mut agent_a = start_agent(hub.addr, AGENT_A).await;
    let mut agent_b = start_agent(hub.addr, AGENT_B).await;

    wait_for_peers(&hub.table, |peers| peers.len() == 2).await;

    // A sends to B through the hub.
    let request = ipv4_packet(AGENT_A, AGENT_B, b"echo request payload");
    agent_a.tun.write_all(&request).await.unwrap();
    assert_eq!(read_packet(&mut agent_b.tun).await, request);

    // B answers.
    let reply = ipv4_packet(AGENT_B, AGENT_A, b"echo reply payload!!");
    agent_b.tun.write_all(&reply).await.unwrap();
    assert_eq!(read_packet(&mut agent_a.tun).await, reply);

    // The hub counted the forwarded plaintext bytes for both directions.
    let snapshot = hub.table.snapshot();
    let rec = |ip: Ipv4Addr| snapshot.iter().find(|p| p.overlay_ip == ip).unwrap();
    assert!(rec(AGENT_B).tx_bytes >= request.len() as u64);
    assert!(rec(AGENT_A).tx_bytes >= reply.len() as u64);
}

#[tokio::test]
async fn unknown_destination_is_dropped() {
    let hub = start_hub(false).await;
    let mut agent_a = start_agent(hub.addr, AGENT_A).await;

    wait_for_peers(&hub.table, |peers| !peers.is_empty()).await;

    let stray = ipv4_packet(AGENT_A, Ipv4Addr::new(10, 0, 0, 99), b"to nobody");
    agent_a.tun.write_all(&stray).await.unwrap();

    sleep(Duration::from_millis(200)).await;
    let snapshot = hub.table.snapshot();
    assert!(snapshot
        .iter()
        .all(|p| p.overlay_ip != Ipv4Addr::new(10, 0, 0, 99)));
    assert_no_packet(&mut agent_a.tun).await;
}

#[tokio::test]
async fn peer_roam_adopts_the_new_endpoint() {
    let hub = start_hub(false).await;
    let agent = start_agent(hub.addr, AGENT_A).await;
    wait_for_peers(&hub.table, |peers| !peers.is_empty()).await;
    assert_eq!(hub.table.lookup(AGENT_A), Some(agent.addr));

    // The NAT binding moves: the same overlay identity speaks from a new
    // socket. The next authenticated packet carries the new source.
    let cipher = PacketCipher::new(SECRET);
    let rebound = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    rebound.connect(hub.addr).await.unwrap();
    let announcement = ipv4_packet(AGENT_A, HUB_IP, &[]);
    rebound.send(&cipher.seal(&announcement).unwrap()).await.unwrap();

    let new_addr = rebound.local_addr().unwrap();
    wait_for_peers(&hub.table, |peers| {
        peers.iter().any(|p| p.endpoint == new_addr)
    })
    .await;
    assert_eq!(hub.table.lookup(AGENT_A), Some(new_addr));
}

#[tokio::test]
async fn unauthenticated_datagrams_leave_no_trace() {
    let mut hub = start_hub(false).await;

    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    raw.connect(hub.addr).await.unwrap();
    // Unauthenticated noise, long enough to look like a datagram.
    raw.send(&[0xAB; 64]).await.unwrap();

    sleep(Duration::from_millis(200)).await;
    assert!(hub.table.snapshot().is_empty());
    assert_no_packet(&mut hub.tun).await;
}

#[tokio::test]
async fn hub_delivers_local_traffic_to_its_tunnel() {
    let mut hub = start_hub(false).await;
    let mut agent_a = start_agent(hub.addr, AGENT_A).await;

    wait_for_peers(&hub.table, |peers| !peers.is_empty()).await;
    // The registration header was itself addressed to the hub.
    assert_eq!(read_packet(&mut hub.tun).await.len(), 20);

    let ping = ipv4_packet(AGENT_A, HUB_IP, b"ping the hub itself");
    agent_a.tun.write_all(&ping).await.unwrap();
    assert_eq!(read_packet(&mut hub.tun).await, ping);
}

#[tokio::test]
async fn exit_node_hub_hands_internet_traffic_to_the_kernel() {
    let mut hub = start_hub(true).await;
    let mut agent_a = start_agent(hub.addr, AGENT_A).await;

    wait_for_peers(&hub.table, |peers| !peers.is_empty()).await;
    // Drain the locally delivered registration header.
    assert_eq!(read_packet(&mut hub.tun).await.len(), 20);

    let outbound = ipv4_packet(AGENT_A, Ipv4Addr::new(8, 8, 8, 8), b"dns query bytes");
    agent_a.tun.write_all(&outbound).await.unwrap();

    // The hub writes the plaintext into its own tunnel; from there the
    // kernel would masquerade it out the physical interface.
    assert_eq!(read_packet(&mut hub.tun).await, outbound);
}

#[tokio::test]
async fn non_exit_hub_drops_internet_traffic() {
    let mut hub = start_hub(false).await;
    let mut agent_a = start_agent(hub.addr, AGENT_A).await;

    wait_for_peers(&hub.table, |peers| !peers.is_empty()).await;
    // Drain the locally delivered registration header.
    assert_eq!(read_packet(&mut hub.tun).await.len(), 20);

    let outbound = ipv4_packet(AGENT_A, Ipv4Addr::new(8, 8, 8, 8), b"dns query bytes");
    agent_a.tun.write_all(&outbound).await.unwrap();

    assert_no_packet(&mut hub.tun).await;
}
