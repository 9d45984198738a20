//! On-disk WireGuard configuration
//!
//! The standard INI format (`[Interface]` + `[Peer]` blocks) is treated as
//! an export of the peer manager's state: rewritten after every mutation,
//! read back once at startup to recover the server identity and re-adopt
//! peers. Edits made while the server runs are overwritten; restart after
//! hand-editing.

use ipnetwork::Ipv4Network;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WgConfigError {
    #[error("wireguard config i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wireguard config parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceSection {
    pub private_key: Option<String>,
    pub address: Option<Ipv4Network>,
    pub listen_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSection {
    pub public_key: String,
    pub allowed_ips: Vec<Ipv4Network>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WgConfigDocument {
    pub interface: InterfaceSection,
    pub peers: Vec<PeerSection>,
}

/// Handle on `<config_dir>/<device_name>.conf`.
pub struct WgConfigFile {
    path: PathBuf,
}

impl WgConfigFile {
    pub fn new(config_dir: impl AsRef<Path>, device_name: &str) -> Self {
        Self {
            path: config_dir.as_ref().join(format!("{device_name}.conf")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn read(&self) -> Result<WgConfigDocument, WgConfigError> {
        let content = std::fs::read_to_string(&self.path)?;
        parse(&content)
    }

    /// Atomic rewrite: temp file in the same directory, then rename. The
    /// file carries the private key, so 0600 on the file and 0700 on the
    /// directory.
    pub fn write(
        &self,
        interface: &InterfaceSection,
        peers: &[PeerSection],
    ) -> Result<(), WgConfigError> {
        if let Some(dir) = self.path.parent() {
            create_private_dir(dir)?;
        }

        let content = render(interface, peers);
        let tmp = self.path.with_extension("conf.tmp");
        std::fs::write(&tmp, content)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if !dir.exists() {
        std::fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

pub fn render(interface: &InterfaceSection, peers: &[PeerSection]) -> String {
    let mut out = String::from("[Interface]\n");
    if let Some(key) = &interface.private_key {
        out.push_str(&format!("PrivateKey = {key}\n"));
    }
    if let Some(address) = interface.address {
        out.push_str(&format!("Address = {address}\n"));
    }
    if let Some(port) = interface.listen_port {
        out.push_str(&format!("ListenPort = {port}\n"));
    }
    for peer in peers {
        let allowed = peer
            .allowed_ips
            .iter()
            .map(|net| net.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&format!(
            "\n[Peer]\nPublicKey = {}\nAllowedIPs = {}\n",
            peer.public_key, allowed
        ));
    }
    out
}

pub fn parse(content: &str) -> Result<WgConfigDocument, WgConfigError> {
    #[derive(PartialEq)]
    enum Section {
        None,
        Interface,
        Peer,
    }

    let mut document = WgConfigDocument::default();
    let mut section = Section::None;
    let mut current_peer: Option<PeerSection> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match line {
            "[Interface]" => {
                if let Some(peer) = current_peer.take() {
                    document.peers.push(peer);
                }
                section = Section::Interface;
                continue;
            }
            "[Peer]" => {
                if let Some(peer) = current_peer.take() {
                    document.peers.push(peer);
                }
                current_peer = Some(PeerSection {
                    public_key: String::new(),
                    allowed_ips: Vec::new(),
                });
                section = Section::Peer;
                continue;
            }
            _ => {}
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(WgConfigError::Parse(format!("malformed line: {line}")));
        };
        let (key, value) = (key.trim(), value.trim());

        match section {
            Section::Interface => match key {
                "PrivateKey" => document.interface.private_key = Some(value.to_string()),
                "Address" => {
                    document.interface.address = Some(
                        value
                            .parse()
                            .map_err(|e| WgConfigError::Parse(format!("Address: {e}")))?,
                    )
                }
                "ListenPort" => {
                    document.interface.listen_port = Some(
                        value
                            .parse()
                            .map_err(|e| WgConfigError::Parse(format!("ListenPort: {e}")))?,
                    )
                }
                _ => {}
            },
            Section::Peer => {
                let Some(peer) = current_peer.as_mut() else {
                    continue;
                };
                match key {
                    "PublicKey" => peer.public_key = value.to_string(),
                    "AllowedIPs" => {
                        for entry in value.split(',') {
                            let entry = entry.trim();
                            // IPv6 entries are outside this deployment's scope
                            if entry.contains(':') {
                                continue;
                            }
                            peer.allowed_ips.push(
                                entry
                                    .parse()
                                    .map_err(|e| WgConfigError::Parse(format!("AllowedIPs: {e}")))?,
                            );
                        }
                    }
                    _ => {}
                }
            }
            Section::None => {
                return Err(WgConfigError::Parse(format!(
                    "directive outside any section: {line}"
                )))
            }
        }
    }
    if let Some(peer) = current_peer.take() {
        document.peers.push(peer);
    }

    document.peers.retain(|peer| {
        if peer.public_key.is_empty() {
            tracing::warn!("peer block without PublicKey dropped");
            false
        } else {
            true
        }
    });
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interface() -> InterfaceSection {
        InterfaceSection {
            private_key: Some("PRIVKEY=".into()),
            address: Some("10.0.0.1/24".parse().unwrap()),
            listen_port: Some(51820),
        }
    }

    #[test]
    fn render_parse_round_trip() {
        let peers = vec![
            PeerSection {
                public_key: "PEER1=".into(),
                allowed_ips: vec!["10.0.0.2/32".parse().unwrap()],
            },
            PeerSection {
                public_key: "PEER2=".into(),
                allowed_ips: vec!["10.0.0.3/32".parse().unwrap()],
            },
        ];
        let document = parse(&render(&interface(), &peers)).unwrap();
        assert_eq!(document.interface, interface());
        assert_eq!(document.peers, peers);
    }

    #[test]
    fn parse_tolerates_comments_and_unknown_keys() {
        let content = "\
# managed file
[Interface]
PrivateKey = PRIVKEY=
Address = 10.0.0.1/24
ListenPort = 51820
MTU = 1420

[Peer]
PublicKey = PEER1=
AllowedIPs = 10.0.0.2/32, fd00::2/128
PersistentKeepalive = 25
";
        let document = parse(content).unwrap();
        assert_eq!(document.interface.listen_port, Some(51820));
        assert_eq!(document.peers.len(), 1);
        assert_eq!(document.peers[0].allowed_ips.len(), 1);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse("PrivateKey = x\n").is_err());
        assert!(parse("[Interface]\nnot a directive\n").is_err());
    }

    #[test]
    fn write_is_atomic_and_private() {
        let dir = tempfile::tempdir().unwrap();
        let file = WgConfigFile::new(dir.path().join("wireguard"), "wg0");
        file.write(&interface(), &[]).unwrap();
        assert!(file.exists());
        assert!(!file.path().with_extension("conf.tmp").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(file.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
            let dir_mode = std::fs::metadata(dir.path().join("wireguard"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(dir_mode & 0o777, 0o700);
        }

        let document = file.read().unwrap();
        assert_eq!(document.interface, interface());
    }
}
