//! Stale peer reclamation
//!
//! WireGuard has no logout: a client that vanishes just stops handshaking.
//! The reaper sweeps the engine's peer stats on an interval and uninstalls
//! peers whose last handshake is older than the timeout, clearing the
//! allocation's key while keeping the address reserved for the next login.

use crate::alloc::IpAllocator;
use crate::engine::WgEngine;
use crate::peers::PeerManager;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;

pub struct Reaper {
    engine: Arc<WgEngine>,
    peers: Arc<PeerManager>,
    allocator: Arc<IpAllocator>,
    timeout: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        engine: Arc<WgEngine>,
        peers: Arc<PeerManager>,
        allocator: Arc<IpAllocator>,
        timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            peers,
            allocator,
            timeout,
            interval,
        }
    }

    /// Sweep forever. Nothing in here may take the process down; every
    /// failure is logged and the next tick tries again.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            timeout_secs = self.timeout.as_secs(),
            interval_secs = self.interval.as_secs(),
            "peer reaper started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            self.sweep().await;
        }
        tracing::info!("peer reaper stopped");
    }

    /// One pass. Returns how many peers were reclaimed.
    pub async fn sweep(&self) -> usize {
        let stats = match self.engine.peer_stats().await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!("reaper could not read peer stats: {}", e);
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut reaped = 0;
        for peer in stats {
            // a peer that never completed a handshake is older than any timeout
            let idle = match peer.last_handshake {
                None => true,
                Some(at) => now
                    .duration_since(at)
                    .map(|age| age > self.timeout)
                    .unwrap_or(false),
            };
            if !idle {
                continue;
            }

            tracing::info!(public_key = %peer.public_key, "reclaiming silent peer");
            if let Err(e) = self.peers.remove(&peer.public_key).await {
                tracing::warn!(public_key = %peer.public_key, "reaper remove failed: {}", e);
                continue;
            }
            match self.allocator.clear_public_key(&peer.public_key) {
                Ok(users) => {
                    for user in users {
                        tracing::debug!(user_id = %user, "allocation key cleared, address kept");
                    }
                }
                Err(e) => tracing::warn!("reaper could not update allocation: {}", e),
            }
            reaped += 1;
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::MockBackend;
    use crate::keys::KeyPair;
    use crate::wgconfig::{InterfaceSection, WgConfigFile};
    use std::net::Ipv4Addr;

    struct Fixture {
        reaper: Reaper,
        engine: Arc<WgEngine>,
        peers: Arc<PeerManager>,
        allocator: Arc<IpAllocator>,
        backend: Arc<MockBackend>,
        _dir: tempfile::TempDir,
    }

    fn fixture(timeout: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::default());
        let engine = Arc::new(WgEngine::new(Box::new(Arc::clone(&backend))));
        let peers = Arc::new(PeerManager::new(
            Arc::clone(&engine),
            WgConfigFile::new(dir.path(), "wg0"),
            InterfaceSection::default(),
        ));
        let allocator = Arc::new(
            IpAllocator::open("10.0.0.0/24".parse().unwrap(), dir.path().join("alloc.json"))
                .unwrap(),
        );
        let reaper = Reaper::new(
            Arc::clone(&engine),
            Arc::clone(&peers),
            Arc::clone(&allocator),
            timeout,
            Duration::from_secs(1),
        );
        Fixture {
            reaper,
            engine,
            peers,
            allocator,
            backend,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn silent_peer_is_reclaimed_and_address_kept() {
        let fx = fixture(Duration::from_secs(180));
        let key = KeyPair::generate().public_key;
        let ip = fx.allocator.acquire("alice").unwrap();
        fx.allocator.bind("alice", &key).unwrap();
        fx.peers.upsert(&key, ip).await.unwrap();
        fx.backend
            .set_last_handshake(&key, Some(SystemTime::now() - Duration::from_secs(600)));

        assert_eq!(fx.reaper.sweep().await, 1);

        assert!(fx.engine.peer_stats().await.unwrap().is_empty());
        let alloc = &fx.allocator.list()[0];
        assert_eq!(alloc.public_key, None);
        assert_eq!(alloc.ip, ip);
        assert_eq!(fx.allocator.acquire("alice").unwrap(), ip);
    }

    #[tokio::test]
    async fn peer_that_never_handshook_counts_as_idle() {
        let fx = fixture(Duration::from_secs(180));
        let key = KeyPair::generate().public_key;
        fx.peers.upsert(&key, Ipv4Addr::new(10, 0, 0, 2)).await.unwrap();

        assert_eq!(fx.reaper.sweep().await, 1);
        assert!(fx.engine.peer_stats().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fresh_peer_survives_the_sweep() {
        let fx = fixture(Duration::from_secs(180));
        let key = KeyPair::generate().public_key;
        fx.peers.upsert(&key, Ipv4Addr::new(10, 0, 0, 2)).await.unwrap();
        fx.backend
            .set_last_handshake(&key, Some(SystemTime::now() - Duration::from_secs(30)));

        assert_eq!(fx.reaper.sweep().await, 0);
        assert_eq!(fx.engine.peer_stats().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn background_loop_reclaims_within_interval() {
        let fx = fixture(Duration::from_secs(180));
        let key = KeyPair::generate().public_key;
        let ip = fx.allocator.acquire("alice").unwrap();
        fx.allocator.bind("alice", &key).unwrap();
        fx.peers.upsert(&key, ip).await.unwrap();
        fx.backend
            .set_last_handshake(&key, Some(SystemTime::now() - Duration::from_secs(600)));

        let engine = Arc::clone(&fx.engine);
        let (tx, rx) = watch::channel(false);
        let reaper = Reaper::new(
            engine.clone(),
            Arc::clone(&fx.peers),
            Arc::clone(&fx.allocator),
            Duration::from_secs(180),
            Duration::from_millis(50),
        );
        let task = tokio::spawn(reaper.run(rx));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = tx.send(true);
        let _ = task.await;

        assert!(engine.peer_stats().await.unwrap().is_empty());
    }
}
