//! WireGuard engine
//!
//! The dataplane behind one interface: a kernel-module backend driven
//! through the `wg`/`ip` tools, or a pure userspace backend built on
//! boringtun. `WgEngine` owns the peer-table bookkeeping both backends
//! share (duplicate and allowed-IP overlap rejection) and delegates the
//! device work to the selected `WgBackend`.

pub mod kernel;
pub mod userspace;

use crate::keys::{self, KeyError};
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::SystemTime;
use thiserror::Error;

/// Default persistent keepalive pushed to peers, seconds.
pub const DEFAULT_KEEPALIVE: u16 = 25;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("listen port busy: {0}")]
    PortBusy(String),

    #[error("peer already installed: {0}")]
    DuplicatePeer(String),

    #[error("allowed IPs {0} overlap an existing peer")]
    OverlappingAllowedIps(Ipv4Network),

    #[error("device error: {0}")]
    Device(String),
}

impl From<KeyError> for EngineError {
    fn from(e: KeyError) -> Self {
        EngineError::InvalidKey(e.to_string())
    }
}

/// Interface-level configuration handed to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub device_name: String,
    pub private_key: String,
    /// UDP bind address; loopback when the WebSocket bridge fronts the engine
    pub bind_addr: SocketAddr,
    /// The server's own address inside the subnet
    pub address: std::net::Ipv4Addr,
    pub subnet: Ipv4Network,
    pub mtu: u16,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub public_key: String,
    pub allowed_ips: Vec<Ipv4Network>,
    pub persistent_keepalive: u16,
}

impl PeerConfig {
    pub fn new(public_key: impl Into<String>, allowed_ips: Vec<Ipv4Network>) -> Self {
        Self {
            public_key: public_key.into(),
            allowed_ips,
            persistent_keepalive: DEFAULT_KEEPALIVE,
        }
    }
}

/// Aggregate traffic counters over all peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct PeerStatsEntry {
    pub public_key: String,
    pub endpoint: Option<SocketAddr>,
    pub last_handshake: Option<SystemTime>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Device backend contract. Validation lives in `WgEngine`; implementations
/// only touch the device.
#[async_trait]
pub trait WgBackend: Send + Sync {
    async fn configure(&self, config: &DeviceConfig) -> Result<(), EngineError>;
    async fn install_peer(&self, peer: &PeerConfig) -> Result<(), EngineError>;
    async fn uninstall_peer(&self, public_key: &str) -> Result<(), EngineError>;
    async fn peer_stats(&self) -> Result<Vec<PeerStatsEntry>, EngineError>;
    async fn close(&self) -> Result<(), EngineError>;
}

pub struct WgEngine {
    backend: Box<dyn WgBackend>,
    /// Mirror of installed peers, used for duplicate/overlap rejection
    peers: RwLock<HashMap<String, Vec<Ipv4Network>>>,
    device: Mutex<Option<DeviceConfig>>,
}

impl WgEngine {
    pub fn new(backend: Box<dyn WgBackend>) -> Self {
        Self {
            backend,
            peers: RwLock::new(HashMap::new()),
            device: Mutex::new(None),
        }
    }

    /// Bring the device up. Calling again with the same values is a no-op;
    /// different values tear the device down and reconfigure.
    pub async fn configure(&self, config: DeviceConfig) -> Result<(), EngineError> {
        keys::decode_key(&config.private_key)?;

        let current = self.device.lock().clone();
        match current {
            Some(ref existing) if *existing == config => return Ok(()),
            Some(_) => {
                self.backend.close().await?;
                self.peers.write().clear();
            }
            None => {}
        }

        self.backend.configure(&config).await?;
        *self.device.lock() = Some(config);
        Ok(())
    }

    pub async fn add_peer(&self, peer: PeerConfig) -> Result<(), EngineError> {
        keys::decode_key(&peer.public_key)?;

        {
            let peers = self.peers.read();
            if peers.contains_key(&peer.public_key) {
                return Err(EngineError::DuplicatePeer(peer.public_key));
            }
            for (_, nets) in peers.iter() {
                for existing in nets {
                    for new in &peer.allowed_ips {
                        if existing.overlaps(*new) {
                            return Err(EngineError::OverlappingAllowedIps(*new));
                        }
                    }
                }
            }
        }

        self.backend.install_peer(&peer).await?;
        self.peers
            .write()
            .insert(peer.public_key.clone(), peer.allowed_ips.clone());
        tracing::info!(public_key = %peer.public_key, allowed_ips = ?peer.allowed_ips, "peer installed");
        Ok(())
    }

    /// Remove a peer. A missing peer is not an error.
    pub async fn remove_peer(&self, public_key: &str) -> Result<(), EngineError> {
        if !self.peers.read().contains_key(public_key) {
            return Ok(());
        }
        self.backend.uninstall_peer(public_key).await?;
        self.peers.write().remove(public_key);
        tracing::info!(public_key, "peer removed");
        Ok(())
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        let peers = self.backend.peer_stats().await?;
        Ok(peers.iter().fold(EngineStats::default(), |mut acc, p| {
            acc.rx_bytes += p.rx_bytes;
            acc.tx_bytes += p.tx_bytes;
            acc
        }))
    }

    pub async fn peer_stats(&self) -> Result<Vec<PeerStatsEntry>, EngineError> {
        self.backend.peer_stats().await
    }

    /// Release the TUN device and UDP socket.
    pub async fn close(&self) -> Result<(), EngineError> {
        self.backend.close().await?;
        self.peers.write().clear();
        *self.device.lock() = None;
        Ok(())
    }
}
