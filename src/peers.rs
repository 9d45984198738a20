//! Peer management
//!
//! Owns the set of installed peers and keeps two views of it consistent:
//! the live engine peer table and the on-disk WireGuard config file.
//! Mutations serialize on one async mutex; rotation always removes the old
//! key before installing the new one so allowed-IP overlap is never hit.

use crate::engine::{EngineError, PeerConfig, PeerStatsEntry, WgEngine};
use crate::wgconfig::{InterfaceSection, PeerSection, WgConfigError, WgConfigFile};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("peer persistence error: {0}")]
    Persist(#[from] WgConfigError),
}

pub struct PeerManager {
    engine: Arc<WgEngine>,
    config_file: WgConfigFile,
    interface: InterfaceSection,
    /// ip → public key currently installed for it
    state: Mutex<HashMap<Ipv4Addr, String>>,
}

impl PeerManager {
    pub fn new(engine: Arc<WgEngine>, config_file: WgConfigFile, interface: InterfaceSection) -> Self {
        Self {
            engine,
            config_file,
            interface,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Install `public_key` as the peer owning `ip`, rotating out whatever
    /// key held the address before. Remove-then-add ordering is load-bearing:
    /// adding first would trip the engine's allowed-IP overlap rejection.
    pub async fn upsert(&self, public_key: &str, ip: Ipv4Addr) -> Result<(), PeerError> {
        let mut state = self.state.lock().await;

        if state.get(&ip).map(String::as_str) == Some(public_key) {
            return Ok(());
        }
        if let Some(previous) = state.remove(&ip) {
            tracing::info!(%ip, old_key = %previous, new_key = %public_key, "rotating peer key");
            self.engine.remove_peer(&previous).await?;
        }
        // the same key resurfacing on another address is stale state
        let stale: Vec<Ipv4Addr> = state
            .iter()
            .filter(|(_, key)| key.as_str() == public_key)
            .map(|(ip, _)| *ip)
            .collect();
        if !stale.is_empty() {
            self.engine.remove_peer(public_key).await?;
            for stale_ip in stale {
                state.remove(&stale_ip);
            }
        }

        self.engine
            .add_peer(PeerConfig::new(public_key, vec![ip.into()]))
            .await?;
        state.insert(ip, public_key.to_string());
        self.persist(&state)?;
        Ok(())
    }

    /// Uninstall a peer. Unknown keys are a no-op.
    pub async fn remove(&self, public_key: &str) -> Result<(), PeerError> {
        let mut state = self.state.lock().await;
        self.engine.remove_peer(public_key).await?;
        let before = state.len();
        state.retain(|_, key| key != public_key);
        if state.len() != before {
            self.persist(&state)?;
        }
        Ok(())
    }

    /// Read-through to the engine.
    pub async fn list(&self) -> Result<Vec<PeerStatsEntry>, PeerError> {
        Ok(self.engine.peer_stats().await?)
    }

    pub async fn installed_key_for(&self, ip: Ipv4Addr) -> Option<String> {
        self.state.lock().await.get(&ip).cloned()
    }

    fn persist(&self, state: &HashMap<Ipv4Addr, String>) -> Result<(), WgConfigError> {
        let mut peers: Vec<PeerSection> = state
            .iter()
            .map(|(ip, key)| PeerSection {
                public_key: key.clone(),
                allowed_ips: vec![(*ip).into()],
            })
            .collect();
        peers.sort_by_key(|peer| peer.allowed_ips.first().map(|net| net.ip()));
        self.config_file.write(&self.interface, &peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::MockBackend;
    use crate::keys::KeyPair;
    use crate::wgconfig;

    fn manager() -> (PeerManager, Arc<WgEngine>, tempfile::TempDir) {
        let engine = Arc::new(WgEngine::new(Box::<MockBackend>::default()));
        let dir = tempfile::tempdir().unwrap();
        let file = WgConfigFile::new(dir.path(), "wg0");
        let interface = InterfaceSection {
            private_key: Some(KeyPair::generate().private_key),
            address: Some("10.0.0.1/24".parse().unwrap()),
            listen_port: Some(51820),
        };
        let peers = PeerManager::new(Arc::clone(&engine), file, interface);
        (peers, engine, dir)
    }

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    #[tokio::test]
    async fn upsert_installs_peer_and_persists() {
        let (peers, engine, dir) = manager();
        let key = KeyPair::generate().public_key;
        peers.upsert(&key, ip(2)).await.unwrap();

        let stats = engine.peer_stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].public_key, key);

        let content = std::fs::read_to_string(dir.path().join("wg0.conf")).unwrap();
        let document = wgconfig::parse(&content).unwrap();
        assert_eq!(document.peers.len(), 1);
        assert_eq!(document.peers[0].public_key, key);
        assert_eq!(document.peers[0].allowed_ips, vec!["10.0.0.2/32".parse().unwrap()]);
    }

    #[tokio::test]
    async fn upsert_rotates_key_for_same_address() {
        let (peers, engine, _dir) = manager();
        let first = KeyPair::generate().public_key;
        let second = KeyPair::generate().public_key;

        peers.upsert(&first, ip(2)).await.unwrap();
        peers.upsert(&second, ip(2)).await.unwrap();

        let installed: Vec<String> = engine
            .peer_stats()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.public_key)
            .collect();
        assert_eq!(installed, vec![second]);
    }

    #[tokio::test]
    async fn upsert_same_key_same_address_is_noop() {
        let (peers, engine, _dir) = manager();
        let key = KeyPair::generate().public_key;
        peers.upsert(&key, ip(2)).await.unwrap();
        peers.upsert(&key, ip(2)).await.unwrap();
        assert_eq!(engine.peer_stats().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_moves_key_between_addresses() {
        let (peers, engine, _dir) = manager();
        let key = KeyPair::generate().public_key;
        peers.upsert(&key, ip(2)).await.unwrap();
        peers.upsert(&key, ip(9)).await.unwrap();

        let stats = engine.peer_stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(peers.installed_key_for(ip(9)).await.as_deref(), Some(key.as_str()));
        assert_eq!(peers.installed_key_for(ip(2)).await, None);
    }

    #[tokio::test]
    async fn remove_clears_engine_and_config() {
        let (peers, engine, dir) = manager();
        let key = KeyPair::generate().public_key;
        peers.upsert(&key, ip(2)).await.unwrap();
        peers.remove(&key).await.unwrap();

        assert!(engine.peer_stats().await.unwrap().is_empty());
        let content = std::fs::read_to_string(dir.path().join("wg0.conf")).unwrap();
        assert!(!content.contains(&key));
    }
}
