//! Userspace backend built on boringtun
//!
//! One `Tunn` per peer, a single UDP socket and a single TUN device.
//! Incoming datagrams are demultiplexed to peers by message type:
//! handshake initiations identify the peer through `parse_handshake_anon`
//! against the server static key, everything else carries a receiver index
//! whose upper 24 bits are the peer index we assigned at install time.

use super::{DeviceConfig, EngineError, PeerConfig, PeerStatsEntry, WgBackend};
use crate::keys;
use crate::tun::{self, TunReader, TunWriter};
use async_trait::async_trait;
use boringtun::noise::handshake::parse_handshake_anon;
use boringtun::noise::rate_limiter::RateLimiter;
use boringtun::noise::{Packet, Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use ipnetwork::Ipv4Network;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const MAX_PACKET: usize = 65536;
/// How often boringtun's per-peer timers are serviced
const TIMER_INTERVAL: Duration = Duration::from_millis(250);
/// Handshakes per second tolerated before the rate limiter asks for cookies
const HANDSHAKES_PER_SECOND: u64 = 100;

struct PeerState {
    tunn: Tunn,
    index: u32,
    endpoint: Option<SocketAddr>,
    allowed_ips: Vec<Ipv4Network>,
    rx_bytes: u64,
    tx_bytes: u64,
}

impl PeerState {
    fn allows(&self, ip: std::net::Ipv4Addr) -> bool {
        self.allowed_ips.iter().any(|net| net.contains(ip))
    }
}

#[derive(Default)]
struct PeerTable {
    by_key: HashMap<[u8; 32], PeerState>,
    by_index: HashMap<u32, [u8; 32]>,
}

struct Running {
    secret: StaticSecret,
    peers: Arc<Mutex<PeerTable>>,
    rate_limiter: Arc<RateLimiter>,
    next_index: AtomicU32,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Pure-userspace WireGuard device.
#[derive(Default)]
pub struct UserspaceBackend {
    state: tokio::sync::Mutex<Option<Running>>,
}

impl UserspaceBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WgBackend for UserspaceBackend {
    async fn configure(&self, config: &DeviceConfig) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if let Some(running) = state.take() {
            running.stop();
        }

        let secret = StaticSecret::from(keys::decode_key(&config.private_key)?);
        let public = PublicKey::from(&secret);

        let (tun_reader, tun_writer) = tun::create(
            &config.device_name,
            config.address,
            config.subnet,
            config.mtu,
        )
        .map_err(|e| EngineError::Device(e.to_string()))?;

        let socket = UdpSocket::bind(config.bind_addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                EngineError::PortBusy(config.bind_addr.to_string())
            } else {
                EngineError::Device(e.to_string())
            }
        })?;
        tracing::info!(addr = %config.bind_addr, "WireGuard endpoint listening");

        let socket = Arc::new(socket);
        let peers: Arc<Mutex<PeerTable>> = Arc::default();
        let rate_limiter = Arc::new(RateLimiter::new(&public, HANDSHAKES_PER_SECOND));
        let tun_writer = Arc::new(tokio::sync::Mutex::new(tun_writer));
        let (shutdown, _) = watch::channel(false);

        let tasks = vec![
            tokio::spawn(udp_loop(
                Arc::clone(&socket),
                Arc::clone(&peers),
                secret.clone(),
                public,
                Arc::clone(&rate_limiter),
                Arc::clone(&tun_writer),
                shutdown.subscribe(),
            )),
            tokio::spawn(tun_loop(
                tun_reader,
                Arc::clone(&socket),
                Arc::clone(&peers),
                shutdown.subscribe(),
            )),
            tokio::spawn(timer_loop(
                Arc::clone(&socket),
                Arc::clone(&peers),
                Arc::clone(&rate_limiter),
                shutdown.subscribe(),
            )),
        ];

        *state = Some(Running {
            secret,
            peers,
            rate_limiter,
            next_index: AtomicU32::new(0),
            shutdown,
            tasks,
        });
        Ok(())
    }

    async fn install_peer(&self, peer: &PeerConfig) -> Result<(), EngineError> {
        let state = self.state.lock().await;
        let running = state
            .as_ref()
            .ok_or_else(|| EngineError::Device("engine not configured".into()))?;

        let key = keys::decode_key(&peer.public_key)?;
        let index = running.next_index.fetch_add(1, Ordering::Relaxed);
        let keepalive = (peer.persistent_keepalive > 0).then_some(peer.persistent_keepalive);

        let tunn = Tunn::new(
            running.secret.clone(),
            PublicKey::from(key),
            None,
            keepalive,
            index,
            Some(Arc::clone(&running.rate_limiter)),
        )
        .map_err(|e| EngineError::Device(e.to_string()))?;

        let mut table = running.peers.lock();
        table.by_index.insert(index, key);
        table.by_key.insert(
            key,
            PeerState {
                tunn,
                index,
                endpoint: None,
                allowed_ips: peer.allowed_ips.clone(),
                rx_bytes: 0,
                tx_bytes: 0,
            },
        );
        Ok(())
    }

    async fn uninstall_peer(&self, public_key: &str) -> Result<(), EngineError> {
        let state = self.state.lock().await;
        let Some(running) = state.as_ref() else {
            return Ok(());
        };
        let key = keys::decode_key(public_key)?;
        let mut table = running.peers.lock();
        if let Some(peer) = table.by_key.remove(&key) {
            table.by_index.remove(&peer.index);
        }
        Ok(())
    }

    async fn peer_stats(&self) -> Result<Vec<PeerStatsEntry>, EngineError> {
        let state = self.state.lock().await;
        let Some(running) = state.as_ref() else {
            return Ok(Vec::new());
        };
        let now = SystemTime::now();
        let table = running.peers.lock();
        Ok(table
            .by_key
            .iter()
            .map(|(key, peer)| PeerStatsEntry {
                public_key: keys::encode_key(key),
                endpoint: peer.endpoint,
                last_handshake: peer
                    .tunn
                    .time_since_last_handshake()
                    .and_then(|elapsed| now.checked_sub(elapsed)),
                rx_bytes: peer.rx_bytes,
                tx_bytes: peer.tx_bytes,
            })
            .collect())
    }

    async fn close(&self) -> Result<(), EngineError> {
        if let Some(running) = self.state.lock().await.take() {
            running.stop();
            tracing::info!("userspace engine closed");
        }
        Ok(())
    }
}

impl Running {
    fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            task.abort();
        }
    }
}

/// UDP → decrypt → TUN. Also answers handshakes and cookie requests.
async fn udp_loop(
    socket: Arc<UdpSocket>,
    peers: Arc<Mutex<PeerTable>>,
    secret: StaticSecret,
    public: PublicKey,
    rate_limiter: Arc<RateLimiter>,
    tun_writer: Arc<tokio::sync::Mutex<TunWriter>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut src_buf = vec![0u8; MAX_PACKET];
    let mut cookie_buf = vec![0u8; MAX_PACKET];
    let mut work_buf = vec![0u8; MAX_PACKET];

    loop {
        let (len, addr) = tokio::select! {
            _ = shutdown.changed() => break,
            result = socket.recv_from(&mut src_buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    tracing::debug!("UDP recv error: {}", e);
                    continue;
                }
            },
        };
        let datagram = &src_buf[..len];

        // mac1/mac2 verification; under load the limiter answers with a cookie
        let verdict = rate_limiter.verify_packet(Some(addr.ip()), datagram, &mut cookie_buf);
        let key = match verdict {
            Ok(Packet::HandshakeInit(ref init)) => parse_handshake_anon(&secret, &public, init)
                .ok()
                .map(|handshake| handshake.peer_static_public),
            Ok(Packet::HandshakeResponse(response)) => {
                peer_for_index(&peers, response.receiver_idx >> 8)
            }
            Ok(Packet::PacketCookieReply(reply)) => peer_for_index(&peers, reply.receiver_idx >> 8),
            Ok(Packet::PacketData(data)) => peer_for_index(&peers, data.receiver_idx >> 8),
            Err(TunnResult::WriteToNetwork(cookie)) => {
                let cookie = cookie.to_vec();
                let _ = socket.send_to(&cookie, addr).await;
                continue;
            }
            Err(_) => continue,
        };
        let Some(key) = key else {
            tracing::trace!(%addr, "datagram from unknown peer dropped");
            continue;
        };

        let mut to_network: Vec<Vec<u8>> = Vec::new();
        let mut to_tunnel: Option<Vec<u8>> = None;
        {
            let mut table = peers.lock();
            let Some(peer) = table.by_key.get_mut(&key) else {
                continue;
            };
            match peer.tunn.decapsulate(Some(addr.ip()), datagram, &mut work_buf) {
                TunnResult::Done => {
                    peer.endpoint = Some(addr);
                }
                TunnResult::Err(e) => {
                    tracing::trace!(%addr, "decapsulate error: {:?}", e);
                }
                TunnResult::WriteToNetwork(data) => {
                    peer.endpoint = Some(addr);
                    to_network.push(data.to_vec());
                    // flush packets queued while the handshake completed
                    while let TunnResult::WriteToNetwork(data) =
                        peer.tunn.decapsulate(None, &[], &mut work_buf)
                    {
                        to_network.push(data.to_vec());
                    }
                }
                TunnResult::WriteToTunnelV4(data, inner_src) => {
                    if peer.allows(inner_src) {
                        peer.endpoint = Some(addr);
                        peer.rx_bytes += data.len() as u64;
                        to_tunnel = Some(data.to_vec());
                    } else {
                        tracing::trace!(%inner_src, "inner source outside allowed IPs, dropped");
                    }
                }
                TunnResult::WriteToTunnelV6(..) => {
                    tracing::trace!("IPv6 payload dropped");
                }
            }
        }

        for packet in to_network {
            let _ = socket.send_to(&packet, addr).await;
        }
        if let Some(packet) = to_tunnel {
            if let Err(e) = tun_writer.lock().await.write_all(&packet).await {
                tracing::warn!("TUN write failed: {}", e);
            }
        }
    }
}

/// TUN → encrypt → UDP, routed by the destination's owning peer.
async fn tun_loop(
    mut reader: TunReader,
    socket: Arc<UdpSocket>,
    peers: Arc<Mutex<PeerTable>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_PACKET];
    let mut work_buf = vec![0u8; MAX_PACKET];

    loop {
        let len = tokio::select! {
            _ = shutdown.changed() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("TUN read error: {}", e);
                    break;
                }
            },
        };
        let Some(dst_ip) = tun::ipv4_destination(&buf[..len]) else {
            continue;
        };

        let mut outbound: Option<(Vec<u8>, SocketAddr)> = None;
        {
            let mut table = peers.lock();
            if let Some(peer) = table.by_key.values_mut().find(|p| p.allows(dst_ip)) {
                let Some(endpoint) = peer.endpoint else {
                    continue;
                };
                match peer.tunn.encapsulate(&buf[..len], &mut work_buf) {
                    TunnResult::WriteToNetwork(data) => {
                        peer.tx_bytes += data.len() as u64;
                        outbound = Some((data.to_vec(), endpoint));
                    }
                    TunnResult::Err(e) => {
                        tracing::trace!(%dst_ip, "encapsulate error: {:?}", e);
                    }
                    _ => {}
                }
            } else {
                tracing::trace!(%dst_ip, "no peer owns destination, dropped");
            }
        }
        if let Some((packet, endpoint)) = outbound {
            let _ = socket.send_to(&packet, endpoint).await;
        }
    }
}

/// Drives boringtun's per-peer timers (keepalives, rekeys) and resets the
/// handshake rate limiter once a second.
async fn timer_loop(
    socket: Arc<UdpSocket>,
    peers: Arc<Mutex<PeerTable>>,
    rate_limiter: Arc<RateLimiter>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(TIMER_INTERVAL);
    let mut work_buf = vec![0u8; MAX_PACKET];
    let mut ticks: u32 = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        ticks = ticks.wrapping_add(1);
        if ticks % 4 == 0 {
            rate_limiter.reset_count();
        }

        let mut outbound: Vec<(Vec<u8>, SocketAddr)> = Vec::new();
        {
            let mut table = peers.lock();
            for peer in table.by_key.values_mut() {
                let Some(endpoint) = peer.endpoint else {
                    continue;
                };
                match peer.tunn.update_timers(&mut work_buf) {
                    TunnResult::WriteToNetwork(data) => {
                        outbound.push((data.to_vec(), endpoint));
                    }
                    TunnResult::Err(e) => {
                        tracing::trace!("timer error: {:?}", e);
                    }
                    _ => {}
                }
            }
        }
        for (packet, endpoint) in outbound {
            let _ = socket.send_to(&packet, endpoint).await;
        }
    }
}

fn peer_for_index(peers: &Arc<Mutex<PeerTable>>, index: u32) -> Option<[u8; 32]> {
    peers.lock().by_index.get(&index).copied()
}
