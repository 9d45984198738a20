//! WireSocket - WireGuard over WebSocket VPN server
//!
//! Carries WireGuard inside WebSocket frames so clients on networks that
//! only allow outbound HTTPS can still reach the VPN.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        WIRESOCKET SERVER                         │
//! │                                                                  │
//! │  client ws/wss ──► WSBridge ──UDP──► WGEngine ──► TUN ──► kernel │
//! │                      │                  ▲                        │
//! │  client https ──► Login API ──► SessionController                │
//! │                                   │         │                    │
//! │                              IPAllocator  PeerManager ──► .conf  │
//! │                                             ▲                    │
//! │                                  Reaper ────┘                    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine owns the TUN device and the UDP endpoint exclusively. The
//! peer manager owns the peer set and mirrors it into the engine and the
//! on-disk WireGuard config. The allocator owns the durable user→address
//! map. The session controller borrows all three and owns none.

pub mod alloc;
pub mod api;
pub mod bridge;
pub mod config;
pub mod engine;
pub mod keys;
pub mod peers;
pub mod reaper;
pub mod session;
pub mod tun;
pub mod wgconfig;

use crate::alloc::IpAllocator;
use crate::api::ApiState;
use crate::bridge::WsBridge;
use crate::config::{Config, WgMode};
use crate::engine::{kernel::KernelBackend, userspace::UserspaceBackend};
use crate::engine::{DeviceConfig, WgBackend, WgEngine};
use crate::keys::KeyPair;
use crate::peers::PeerManager;
use crate::reaper::Reaper;
use crate::session::{FileUserStore, SessionController, SessionParams, UserStore};
use crate::wgconfig::{InterfaceSection, WgConfigDocument, WgConfigFile};
use ipnetwork::Ipv4Network;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Keys(#[from] keys::KeyError),
    #[error(transparent)]
    WgConfig(#[from] wgconfig::WgConfigError),
    #[error(transparent)]
    Engine(#[from] engine::EngineError),
    #[error(transparent)]
    Bridge(#[from] bridge::BridgeError),
    #[error(transparent)]
    Alloc(#[from] alloc::AllocError),
    #[error("user store error: {0}")]
    UserStore(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Exit code classes: 1 configuration, 2 privilege/resource, 3 store.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) | Error::Keys(_) | Error::WgConfig(_) => 1,
            Error::Engine(_) | Error::Bridge(_) | Error::Io(_) => 2,
            Error::Alloc(_) | Error::UserStore(_) => 3,
        }
    }
}

pub struct WireSocket {
    config: Config,
    engine: Arc<WgEngine>,
    sessions: Arc<SessionController>,
    allocator: Arc<IpAllocator>,
    peers: Arc<PeerManager>,
}

impl WireSocket {
    /// Assemble and start the dataplane: device up, state restored,
    /// leftover config-file peers adopted.
    pub async fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let wg = &config.wireguard;
        let config_file = WgConfigFile::new(&wg.config_dir, &wg.device_name);
        let existing = if config_file.exists() {
            Some(config_file.read()?)
        } else {
            None
        };

        let identity = resolve_identity(wg, existing.as_ref())?;
        let server_address = config.server_address();
        let interface = InterfaceSection {
            private_key: Some(identity.private_key.clone()),
            address: Some(
                Ipv4Network::new(server_address, wg.subnet.prefix())
                    .map_err(|e| config::ConfigError::Invalid(e.to_string()))?,
            ),
            listen_port: Some(wg.listen_port),
        };
        if existing.is_none() {
            // the generated private key must survive a crash between now
            // and the first peer mutation
            config_file.write(&interface, &[])?;
        }

        let backend: Box<dyn WgBackend> = match wg.mode {
            WgMode::Userspace => Box::new(UserspaceBackend::new()),
            WgMode::Kernel => Box::new(KernelBackend::new()),
        };
        let engine = Arc::new(WgEngine::new(backend));
        engine
            .configure(DeviceConfig {
                device_name: wg.device_name.clone(),
                private_key: identity.private_key.clone(),
                bind_addr: config.engine_bind_addr(),
                address: server_address,
                subnet: wg.subnet,
                mtu: wg.mtu,
            })
            .await?;

        std::fs::create_dir_all(&config.server.data_dir)?;
        let allocator = Arc::new(IpAllocator::open(
            wg.subnet,
            config.server.data_dir.join("allocations.json"),
        )?);

        let peers = Arc::new(PeerManager::new(
            Arc::clone(&engine),
            config_file,
            interface,
        ));
        if let Some(document) = existing {
            adopt_config_peers(&document, &allocator, &peers).await;
        }

        let users: Arc<dyn UserStore> = Arc::new(
            FileUserStore::open(config.server.data_dir.join("users.json"))
                .map_err(|e| Error::UserStore(e.to_string()))?,
        );
        let sessions = Arc::new(SessionController::new(
            users,
            Arc::clone(&allocator),
            Arc::clone(&peers),
            SessionParams {
                server_public_key: identity.public_key.clone(),
                endpoint: wg.endpoint.clone(),
                dns: wg.dns.clone(),
                extra_routes: wg.extra_routes.clone(),
                tunnel_url: config.tunnel.enabled.then(|| config.tunnel.public_url()),
            },
        ));

        tracing::info!(
            public_key = %identity.public_key,
            subnet = %wg.subnet,
            mode = ?wg.mode,
            "wiresocket ready"
        );

        Ok(Self {
            config,
            engine,
            sessions,
            allocator,
            peers,
        })
    }

    /// Run until a termination signal or a fatal task error, then drain.
    pub async fn run(self) -> Result<(), Error> {
        let (shutdown_tx, _) = watch::channel(false);

        let api_addr = self.config.server.address.clone();
        let api_state = ApiState {
            sessions: Arc::clone(&self.sessions),
        };
        let api_rx = shutdown_tx.subscribe();
        let mut api_task: JoinHandle<Result<(), Error>> = tokio::spawn(async move {
            api::serve(&api_addr, api_state, api_rx).await.map_err(Error::from)
        });

        let mut bridge_task: JoinHandle<Result<(), Error>> = if self.config.tunnel.enabled {
            let bridge = WsBridge::bind(&self.config.tunnel, self.config.engine_bind_addr()).await?;
            let rx = shutdown_tx.subscribe();
            tokio::spawn(async move { bridge.run(rx).await.map_err(Error::from) })
        } else {
            let mut rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let _ = rx.changed().await;
                Ok(())
            })
        };

        let mut reaper_task: JoinHandle<Result<(), Error>> = if self.config.peer_cleanup.enabled {
            let reaper = Reaper::new(
                Arc::clone(&self.engine),
                Arc::clone(&self.peers),
                Arc::clone(&self.allocator),
                Duration::from_secs(self.config.peer_cleanup.timeout),
                Duration::from_secs(self.config.peer_cleanup.interval),
            );
            let rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                reaper.run(rx).await;
                Ok(())
            })
        } else {
            let mut rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let _ = rx.changed().await;
                Ok(())
            })
        };

        #[derive(PartialEq)]
        enum Finished {
            None,
            Api,
            Bridge,
            Reaper,
        }

        let mut result = Ok(());
        let finished = tokio::select! {
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received");
                Finished::None
            }
            joined = &mut api_task => {
                result = flatten("control-plane", joined);
                Finished::Api
            }
            joined = &mut bridge_task => {
                result = flatten("tunnel bridge", joined);
                Finished::Bridge
            }
            joined = &mut reaper_task => {
                result = flatten("reaper", joined);
                Finished::Reaper
            }
        };

        let _ = shutdown_tx.send(true);
        let drain = async {
            if finished != Finished::Api {
                let _ = api_task.await;
            }
            if finished != Finished::Bridge {
                let _ = bridge_task.await;
            }
            if finished != Finished::Reaper {
                let _ = reaper_task.await;
            }
        };
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            tracing::warn!("tasks did not drain in time");
        }

        self.engine.close().await?;
        tracing::info!("wiresocket stopped");
        result
    }
}

fn flatten(task: &str, joined: Result<Result<(), Error>, tokio::task::JoinError>) -> Result<(), Error> {
    match joined {
        Ok(Ok(())) => {
            tracing::info!(task, "task exited");
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::error!(task, "task failed: {}", e);
            Err(e)
        }
        Err(e) => {
            tracing::error!(task, "task panicked: {}", e);
            Err(Error::Io(std::io::Error::other(e.to_string())))
        }
    }
}

/// Server identity precedence: explicit config key, then the key already in
/// the WireGuard config file, then a freshly generated pair. A persisted
/// private key is never regenerated.
fn resolve_identity(
    wg: &config::WireguardConfig,
    existing: Option<&WgConfigDocument>,
) -> Result<KeyPair, Error> {
    if !wg.private_key.is_empty() {
        let pair = KeyPair::from_private(&wg.private_key)?;
        if !wg.public_key.is_empty() && wg.public_key != pair.public_key {
            tracing::warn!("configured public_key does not match private_key, using derived key");
        }
        return Ok(pair);
    }
    if let Some(private_key) = existing.and_then(|doc| doc.interface.private_key.as_deref()) {
        tracing::info!("server identity loaded from wireguard config file");
        return Ok(KeyPair::from_private(private_key)?);
    }
    let pair = KeyPair::generate();
    tracing::info!(public_key = %pair.public_key, "generated new server identity");
    Ok(pair)
}

/// Re-install config-file peers whose address still belongs to a known
/// allocation; anything else is logged and dropped from the next rewrite.
async fn adopt_config_peers(
    document: &WgConfigDocument,
    allocator: &IpAllocator,
    peers: &PeerManager,
) -> usize {
    let mut adopted = 0;
    for peer in &document.peers {
        let single_host = match peer.allowed_ips.as_slice() {
            [net] if net.prefix() == 32 => Some(net.ip()),
            _ => None,
        };
        let Some(ip) = single_host else {
            tracing::warn!(public_key = %peer.public_key, "config peer without a /32 address dropped");
            continue;
        };
        if allocator.user_for_ip(ip).is_none() {
            tracing::warn!(public_key = %peer.public_key, %ip,
                "config peer has no matching allocation, dropped");
            continue;
        }
        match peers.upsert(&peer.public_key, ip).await {
            Ok(()) => {
                tracing::info!(public_key = %peer.public_key, %ip, "config peer adopted");
                adopted += 1;
            }
            Err(e) => tracing::warn!(public_key = %peer.public_key, "adoption failed: {}", e),
        }
    }
    adopted
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::MockBackend;
    use crate::wgconfig::PeerSection;
    use std::net::Ipv4Addr;

    #[test]
    fn identity_prefers_config_over_file() {
        let from_config = KeyPair::generate();
        let from_file = KeyPair::generate();
        let wg = config::WireguardConfig {
            private_key: from_config.private_key.clone(),
            ..Default::default()
        };
        let document = WgConfigDocument {
            interface: InterfaceSection {
                private_key: Some(from_file.private_key),
                ..Default::default()
            },
            peers: Vec::new(),
        };
        let identity = resolve_identity(&wg, Some(&document)).unwrap();
        assert_eq!(identity.public_key, from_config.public_key);
    }

    #[test]
    fn identity_falls_back_to_file_then_generates() {
        let from_file = KeyPair::generate();
        let wg = config::WireguardConfig::default();
        let document = WgConfigDocument {
            interface: InterfaceSection {
                private_key: Some(from_file.private_key.clone()),
                ..Default::default()
            },
            peers: Vec::new(),
        };
        let identity = resolve_identity(&wg, Some(&document)).unwrap();
        assert_eq!(identity.public_key, from_file.public_key);

        let generated = resolve_identity(&wg, None).unwrap();
        assert_ne!(generated.public_key, from_file.public_key);
    }

    #[tokio::test]
    async fn adoption_installs_only_allocated_peers() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(WgEngine::new(Box::<MockBackend>::default()));
        let allocator = Arc::new(
            IpAllocator::open("10.0.0.0/24".parse().unwrap(), dir.path().join("alloc.json"))
                .unwrap(),
        );
        let peers = Arc::new(PeerManager::new(
            Arc::clone(&engine),
            WgConfigFile::new(dir.path(), "wg0"),
            InterfaceSection::default(),
        ));

        let known = allocator.acquire("alice").unwrap();
        let known_key = KeyPair::generate().public_key;
        let stray_key = KeyPair::generate().public_key;
        let document = WgConfigDocument {
            interface: InterfaceSection::default(),
            peers: vec![
                PeerSection {
                    public_key: known_key.clone(),
                    allowed_ips: vec![known.into()],
                },
                PeerSection {
                    public_key: stray_key,
                    allowed_ips: vec![Ipv4Addr::new(10, 0, 0, 200).into()],
                },
            ],
        };

        let adopted = adopt_config_peers(&document, &allocator, &peers).await;
        assert_eq!(adopted, 1);
        let installed = engine.peer_stats().await.unwrap();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].public_key, known_key);
    }

    #[test]
    fn exit_codes_follow_error_class() {
        assert_eq!(
            Error::Config(config::ConfigError::Invalid("x".into())).exit_code(),
            1
        );
        assert_eq!(
            Error::Engine(engine::EngineError::PortBusy("51820".into())).exit_code(),
            2
        );
        assert_eq!(
            Error::Alloc(alloc::AllocError::Store("disk full".into())).exit_code(),
            3
        );
    }
}
