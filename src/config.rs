//! Server configuration
//!
//! Loaded once at startup from a YAML document. Missing keys take the
//! defaults below; invalid YAML or an unusable subnet is fatal.

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub wireguard: WireguardConfig,
    pub tunnel: TunnelConfig,
    pub peer_cleanup: PeerCleanupConfig,
}

/// Control-plane HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the login/health API
    pub address: String,
    /// Directory holding the allocation map and user store
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8000".into(),
            data_dir: PathBuf::from("/var/lib/wiresocket"),
        }
    }
}

/// WireGuard device and identity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WireguardConfig {
    /// TUN interface name
    pub device_name: String,
    /// Backend selector
    pub mode: WgMode,
    /// UDP port the engine listens on
    pub listen_port: u16,
    /// Subnet clients are allocated from
    pub subnet: Ipv4Network,
    /// DNS servers pushed to clients
    pub dns: Vec<Ipv4Addr>,
    /// Public host:port advertised to clients for direct WireGuard
    pub endpoint: String,
    /// Server private key; generated on first run if empty
    pub private_key: String,
    /// Server public key; rederived from the private key when empty
    pub public_key: String,
    /// Device MTU
    pub mtu: u16,
    /// Directory holding the on-disk WireGuard config file
    pub config_dir: PathBuf,
    /// Extra routes pushed to clients besides the default route
    pub extra_routes: Vec<Ipv4Network>,
}

impl Default for WireguardConfig {
    fn default() -> Self {
        Self {
            device_name: "wg0".into(),
            mode: WgMode::Userspace,
            listen_port: 51820,
            subnet: "10.8.0.0/24".parse().expect("valid default subnet"),
            dns: vec![Ipv4Addr::new(1, 1, 1, 1)],
            endpoint: String::new(),
            private_key: String::new(),
            public_key: String::new(),
            mtu: 1420,
            config_dir: PathBuf::from("/etc/wireguard"),
            extra_routes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WgMode {
    Kernel,
    Userspace,
}

/// WebSocket tunnel bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub enabled: bool,
    pub listen_addr: String,
    /// URL path the bridge upgrades on
    pub path: String,
    /// Hostname used when constructing the tunnel URL returned to clients
    pub public_host: String,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:8443".into(),
            path: "/".into(),
            public_host: String::new(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl TunnelConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// The URL clients dial to reach the bridge.
    pub fn public_url(&self) -> String {
        let scheme = if self.tls_enabled() { "wss" } else { "ws" };
        format!("{}://{}{}", scheme, self.public_host, self.path)
    }
}

/// Stale peer reclamation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerCleanupConfig {
    pub enabled: bool,
    /// Seconds since last handshake before a peer is reclaimed
    pub timeout: u64,
    /// Sweep period in seconds
    pub interval: u64,
}

impl Default for PeerCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: 180,
            interval: 30,
        }
    }
}

impl Config {
    /// Load and validate a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wireguard.listen_port == 0 {
            return Err(ConfigError::Invalid("wireguard.listen_port must be set".into()));
        }
        if self.wireguard.subnet.prefix() > 30 {
            return Err(ConfigError::Invalid(format!(
                "wireguard.subnet {} has no assignable addresses",
                self.wireguard.subnet
            )));
        }
        if self.tunnel.enabled && !self.tunnel.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "tunnel.path must start with '/', got {:?}",
                self.tunnel.path
            )));
        }
        if self.tunnel.tls_cert.is_some() != self.tunnel.tls_key.is_some() {
            return Err(ConfigError::Invalid(
                "tunnel.tls_cert and tunnel.tls_key must be set together".into(),
            ));
        }
        Ok(())
    }

    /// The server's own address inside the subnet: the first usable host.
    pub fn server_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.wireguard.subnet.network()) + 1)
    }

    /// UDP address the engine binds; loopback-only when the bridge fronts it.
    pub fn engine_bind_addr(&self) -> std::net::SocketAddr {
        let ip: std::net::IpAddr = if self.tunnel.enabled {
            Ipv4Addr::LOCALHOST.into()
        } else {
            Ipv4Addr::UNSPECIFIED.into()
        };
        (ip, self.wireguard.listen_port).into()
    }
}
