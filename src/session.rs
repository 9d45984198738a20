//! Login flow
//!
//! Turns a `(username, password, public_key)` tuple into a usable client
//! configuration: verify against the user store, pin an address, record the
//! key, install the peer, hand back the config. The peer is installed
//! before the response is produced, so a successful login is always ahead
//! of the first forwarded packet.

use crate::alloc::{AllocError, IpAllocator};
use crate::engine::EngineError;
use crate::keys;
use crate::peers::{PeerError, PeerManager};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ipnetwork::Ipv4Network;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account disabled")]
    Disabled,
    #[error("user store error: {0}")]
    Store(String),
}

/// Credential verification contract. A standalone node uses the file-backed
/// store below; a federated deployment plugs a remote verifier in here.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Validate credentials and return the opaque user id.
    async fn verify(&self, username: &str, password: &str) -> Result<String, AuthError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    id: String,
    username: String,
    /// base64(sha256(password))
    password_digest: String,
    #[serde(default)]
    disabled: bool,
}

/// JSON-file user database for standalone deployments.
pub struct FileUserStore {
    path: PathBuf,
    users: RwLock<Vec<UserRecord>>,
}

impl FileUserStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuthError> {
        let path = path.into();
        let users = if path.exists() {
            let content =
                std::fs::read_to_string(&path).map_err(|e| AuthError::Store(e.to_string()))?;
            serde_json::from_str(&content).map_err(|e| AuthError::Store(e.to_string()))?
        } else {
            tracing::warn!(path = %path.display(), "user store missing, starting empty");
            Vec::new()
        };
        Ok(Self {
            path,
            users: RwLock::new(users),
        })
    }

    /// Create or replace a user. The id is the username; the store is an
    /// operator-managed flat file, not a directory service.
    pub fn upsert_user(
        &self,
        username: &str,
        password: &str,
        disabled: bool,
    ) -> Result<(), AuthError> {
        let mut users = self.users.write();
        users.retain(|u| u.username != username);
        users.push(UserRecord {
            id: username.to_string(),
            username: username.to_string(),
            password_digest: digest(password),
            disabled,
        });
        let content = serde_json::to_string_pretty(&*users)
            .map_err(|e| AuthError::Store(e.to_string()))?;
        std::fs::write(&self.path, content).map_err(|e| AuthError::Store(e.to_string()))
    }
}

pub fn digest(password: &str) -> String {
    BASE64.encode(Sha256::digest(password.as_bytes()))
}

#[async_trait]
impl UserStore for FileUserStore {
    async fn verify(&self, username: &str, password: &str) -> Result<String, AuthError> {
        let users = self.users.read();
        let user = users
            .iter()
            .find(|u| u.username == username)
            .ok_or(AuthError::InvalidCredentials)?;
        if user.password_digest != digest(password) {
            return Err(AuthError::InvalidCredentials);
        }
        if user.disabled {
            return Err(AuthError::Disabled);
        }
        Ok(user.id.clone())
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account disabled")]
    Disabled,
    #[error("address pool exhausted")]
    PoolExhausted,
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// The document a client turns into its local WireGuard + tunnel setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub interface: ClientInterface,
    pub peer: ClientPeer,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInterface {
    pub address: String,
    pub dns: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientPeer {
    pub public_key: String,
    pub endpoint: String,
    pub allowed_ips: Vec<String>,
}

/// Everything the login response needs that is fixed at startup.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub server_public_key: String,
    pub endpoint: String,
    pub dns: Vec<Ipv4Addr>,
    pub extra_routes: Vec<Ipv4Network>,
    pub tunnel_url: Option<String>,
}

pub struct SessionController {
    users: Arc<dyn UserStore>,
    allocator: Arc<IpAllocator>,
    peers: Arc<PeerManager>,
    params: SessionParams,
}

impl SessionController {
    pub fn new(
        users: Arc<dyn UserStore>,
        allocator: Arc<IpAllocator>,
        peers: Arc<PeerManager>,
        params: SessionParams,
    ) -> Self {
        Self {
            users,
            allocator,
            peers,
            params,
        }
    }

    pub async fn login(
        &self,
        username: &str,
        password: &str,
        client_public_key: &str,
    ) -> Result<ClientConfig, SessionError> {
        keys::decode_key(client_public_key)
            .map_err(|e| SessionError::InvalidKey(e.to_string()))?;

        let user_id = self.users.verify(username, password).await.map_err(|e| match e {
            AuthError::InvalidCredentials => SessionError::InvalidCredentials,
            AuthError::Disabled => SessionError::Disabled,
            AuthError::Store(msg) => SessionError::Internal(msg),
        })?;

        let ip = self.allocator.acquire(&user_id).map_err(|e| match e {
            AllocError::PoolExhausted(subnet) => {
                tracing::warn!(%subnet, username, "address pool exhausted");
                SessionError::PoolExhausted
            }
            AllocError::Store(msg) => SessionError::Internal(msg),
        })?;
        self.allocator
            .bind(&user_id, client_public_key)
            .map_err(|e| SessionError::Internal(e.to_string()))?;

        self.peers
            .upsert(client_public_key, ip)
            .await
            .map_err(|e| match e {
                PeerError::Engine(EngineError::InvalidKey(msg)) => {
                    tracing::warn!(username, "rejected key: {}", msg);
                    SessionError::InvalidKey(msg)
                }
                PeerError::Engine(EngineError::DuplicatePeer(key)) => {
                    // the rotation in upsert is supposed to make this unreachable
                    tracing::error!(key, "duplicate peer leaked through rotation");
                    SessionError::Internal("duplicate peer".into())
                }
                other => SessionError::Internal(other.to_string()),
            })?;

        tracing::info!(username, %ip, "login complete, peer installed");

        let mut allowed_ips = vec!["0.0.0.0/0".to_string()];
        allowed_ips.extend(self.params.extra_routes.iter().map(|net| net.to_string()));

        Ok(ClientConfig {
            interface: ClientInterface {
                address: format!("{ip}/32"),
                dns: self.params.dns.clone(),
            },
            peer: ClientPeer {
                public_key: self.params.server_public_key.clone(),
                endpoint: self.params.endpoint.clone(),
                allowed_ips,
            },
            tunnel_url: self.params.tunnel_url.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::MockBackend;
    use crate::engine::WgEngine;
    use crate::keys::KeyPair;
    use crate::wgconfig::{InterfaceSection, WgConfigFile};

    struct Fixture {
        controller: SessionController,
        engine: Arc<WgEngine>,
        allocator: Arc<IpAllocator>,
        _dir: tempfile::TempDir,
    }

    fn fixture(subnet: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();

        let users = FileUserStore::open(dir.path().join("users.json")).unwrap();
        users.upsert_user("alice", "alice-pw", false).unwrap();
        users.upsert_user("bob", "bob-pw", false).unwrap();
        users.upsert_user("mallory", "mallory-pw", true).unwrap();

        let allocator = Arc::new(
            IpAllocator::open(subnet.parse().unwrap(), dir.path().join("allocations.json"))
                .unwrap(),
        );
        let engine = Arc::new(WgEngine::new(Box::<MockBackend>::default()));
        let server = KeyPair::generate();
        let peers = Arc::new(PeerManager::new(
            Arc::clone(&engine),
            WgConfigFile::new(dir.path(), "wg0"),
            InterfaceSection {
                private_key: Some(server.private_key.clone()),
                address: Some("10.0.0.1/24".parse().unwrap()),
                listen_port: Some(51820),
            },
        ));

        let controller = SessionController::new(
            Arc::new(users),
            Arc::clone(&allocator),
            peers,
            SessionParams {
                server_public_key: server.public_key,
                endpoint: "vpn.example.com:51820".into(),
                dns: vec![Ipv4Addr::new(1, 1, 1, 1)],
                extra_routes: Vec::new(),
                tunnel_url: Some("wss://vpn.example.com/".into()),
            },
        );
        Fixture {
            controller,
            engine,
            allocator,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn first_login_allocates_lowest_address() {
        let fx = fixture("10.0.0.0/24");
        let key = KeyPair::generate().public_key;
        let config = fx.controller.login("alice", "alice-pw", &key).await.unwrap();

        assert_eq!(config.interface.address, "10.0.0.2/32");
        assert_eq!(config.peer.allowed_ips, vec!["0.0.0.0/0"]);
        assert_eq!(config.tunnel_url.as_deref(), Some("wss://vpn.example.com/"));

        let peers = fx.engine.peer_stats().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].public_key, key);
    }

    #[tokio::test]
    async fn relogin_rotates_key_and_preserves_address() {
        let fx = fixture("10.0.0.0/24");
        let first = KeyPair::generate().public_key;
        let second = KeyPair::generate().public_key;

        let before = fx.controller.login("alice", "alice-pw", &first).await.unwrap();
        let after = fx.controller.login("alice", "alice-pw", &second).await.unwrap();
        assert_eq!(before.interface.address, after.interface.address);

        let installed: Vec<String> = fx
            .engine
            .peer_stats()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.public_key)
            .collect();
        assert_eq!(installed, vec![second]);
    }

    #[tokio::test]
    async fn second_user_gets_next_address() {
        let fx = fixture("10.0.0.0/24");
        fx.controller
            .login("alice", "alice-pw", &KeyPair::generate().public_key)
            .await
            .unwrap();
        let config = fx
            .controller
            .login("bob", "bob-pw", &KeyPair::generate().public_key)
            .await
            .unwrap();
        assert_eq!(config.interface.address, "10.0.0.3/32");
    }

    #[tokio::test]
    async fn exhausted_pool_surfaces_as_pool_exhausted() {
        let fx = fixture("10.0.0.0/30");
        fx.controller
            .login("alice", "alice-pw", &KeyPair::generate().public_key)
            .await
            .unwrap();
        let err = fx
            .controller
            .login("bob", "bob-pw", &KeyPair::generate().public_key)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::PoolExhausted));
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_are_indistinguishable() {
        let fx = fixture("10.0.0.0/24");
        let key = KeyPair::generate().public_key;
        assert!(matches!(
            fx.controller.login("alice", "wrong", &key).await.unwrap_err(),
            SessionError::InvalidCredentials
        ));
        assert!(matches!(
            fx.controller.login("nobody", "pw", &key).await.unwrap_err(),
            SessionError::InvalidCredentials
        ));
    }

    #[tokio::test]
    async fn disabled_account_is_rejected() {
        let fx = fixture("10.0.0.0/24");
        let err = fx
            .controller
            .login("mallory", "mallory-pw", &KeyPair::generate().public_key)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Disabled));
    }

    #[tokio::test]
    async fn malformed_client_key_is_rejected_before_allocation() {
        let fx = fixture("10.0.0.0/24");
        let err = fx
            .controller
            .login("alice", "alice-pw", "not-a-key")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidKey(_)));
        assert!(fx.allocator.list().is_empty());
    }

    #[tokio::test]
    async fn engine_and_allocations_stay_consistent() {
        let fx = fixture("10.0.0.0/24");
        for (user, pw) in [("alice", "alice-pw"), ("bob", "bob-pw")] {
            for _ in 0..3 {
                fx.controller
                    .login(user, pw, &KeyPair::generate().public_key)
                    .await
                    .unwrap();
            }
        }

        let allocations = fx.allocator.list();
        for peer in fx.engine.peer_stats().await.unwrap() {
            let matched = allocations
                .iter()
                .any(|a| a.public_key.as_deref() == Some(peer.public_key.as_str()));
            assert!(matched, "installed peer {} has no allocation", peer.public_key);
        }
    }
}
