//! Kernel-module backend
//!
//! Drives the in-kernel WireGuard implementation through the `ip` and `wg`
//! command-line tools. Peer statistics come from `wg show <dev> dump`.

use super::{DeviceConfig, EngineError, PeerConfig, PeerStatsEntry, WgBackend};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::process::Output;
use std::time::{Duration, UNIX_EPOCH};
use tokio::process::Command;

pub struct KernelBackend {
    device: Mutex<Option<String>>,
}

impl KernelBackend {
    pub fn new() -> Self {
        Self {
            device: Mutex::new(None),
        }
    }

    fn device_name(&self) -> Result<String, EngineError> {
        self.device
            .lock()
            .clone()
            .ok_or_else(|| EngineError::Device("engine not configured".into()))
    }
}

impl Default for KernelBackend {
    fn default() -> Self {
        Self::new()
    }
}

async fn run(program: &str, args: &[&str]) -> Result<Output, EngineError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| EngineError::Device(format!("{program}: {e}")))?;
    if !output.status.success() {
        return Err(EngineError::Device(format!(
            "{program} {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output)
}

#[async_trait]
impl WgBackend for KernelBackend {
    async fn configure(&self, config: &DeviceConfig) -> Result<(), EngineError> {
        let name = &config.device_name;

        // tolerate a device left over from a previous run
        let _ = Command::new("ip")
            .args(["link", "add", "dev", name, "type", "wireguard"])
            .output()
            .await;

        // the private key goes through a 0600 temp file, never argv
        let key_file = std::env::temp_dir().join(format!("{name}.key"));
        tokio::fs::write(&key_file, &config.private_key)
            .await
            .map_err(|e| EngineError::Device(e.to_string()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&key_file, std::fs::Permissions::from_mode(0o600));
        }

        let port = config.bind_addr.port().to_string();
        let key_path = key_file.to_string_lossy().to_string();
        let set_result = run(
            "wg",
            &[
                "set",
                name,
                "private-key",
                &key_path,
                "listen-port",
                &port,
            ],
        )
        .await;
        let _ = tokio::fs::remove_file(&key_file).await;
        set_result.map_err(|e| match e {
            EngineError::Device(msg) if msg.contains("Address already in use") => {
                EngineError::PortBusy(port.clone())
            }
            other => other,
        })?;

        let address = format!("{}/{}", config.address, config.subnet.prefix());
        run("ip", &["address", "replace", &address, "dev", name]).await?;
        let mtu = config.mtu.to_string();
        run("ip", &["link", "set", "mtu", &mtu, "up", "dev", name]).await?;

        tracing::info!(device = name, address, "kernel WireGuard device up");
        *self.device.lock() = Some(name.clone());
        Ok(())
    }

    async fn install_peer(&self, peer: &PeerConfig) -> Result<(), EngineError> {
        let device = self.device_name()?;
        let allowed = peer
            .allowed_ips
            .iter()
            .map(|net| net.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let keepalive = peer.persistent_keepalive.to_string();
        run(
            "wg",
            &[
                "set",
                &device,
                "peer",
                &peer.public_key,
                "allowed-ips",
                &allowed,
                "persistent-keepalive",
                &keepalive,
            ],
        )
        .await?;
        Ok(())
    }

    async fn uninstall_peer(&self, public_key: &str) -> Result<(), EngineError> {
        let device = self.device_name()?;
        run("wg", &["set", &device, "peer", public_key, "remove"]).await?;
        Ok(())
    }

    async fn peer_stats(&self) -> Result<Vec<PeerStatsEntry>, EngineError> {
        let device = self.device_name()?;
        let output = run("wg", &["show", &device, "dump"]).await?;
        Ok(parse_dump(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn close(&self) -> Result<(), EngineError> {
        let device = self.device.lock().take();
        if let Some(device) = device {
            run("ip", &["link", "delete", "dev", &device]).await?;
            tracing::info!(device, "kernel WireGuard device removed");
        }
        Ok(())
    }
}

/// Parse `wg show <dev> dump`. The first line describes the interface, each
/// following line a peer: pubkey, psk, endpoint, allowed-ips,
/// latest-handshake (epoch seconds), rx, tx, keepalive.
fn parse_dump(dump: &str) -> Vec<PeerStatsEntry> {
    dump.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 7 {
                return None;
            }
            let handshake_epoch: u64 = fields[4].parse().ok()?;
            Some(PeerStatsEntry {
                public_key: fields[0].to_string(),
                endpoint: fields[2].parse::<SocketAddr>().ok(),
                last_handshake: (handshake_epoch > 0)
                    .then(|| UNIX_EPOCH + Duration::from_secs(handshake_epoch)),
                rx_bytes: fields[5].parse().unwrap_or(0),
                tx_bytes: fields[6].parse().unwrap_or(0),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wg_dump() {
        let dump = "privkey\tpubkey\t51820\toff\n\
            AbCpub1=\t(none)\t203.0.113.5:41000\t10.0.0.2/32\t1722500000\t1024\t2048\t25\n\
            AbCpub2=\t(none)\t(none)\t10.0.0.3/32\t0\t0\t0\t25\n";
        let peers = parse_dump(dump);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].public_key, "AbCpub1=");
        assert_eq!(
            peers[0].endpoint,
            Some("203.0.113.5:41000".parse().unwrap())
        );
        assert_eq!(
            peers[0].last_handshake,
            Some(UNIX_EPOCH + Duration::from_secs(1722500000))
        );
        assert_eq!(peers[0].rx_bytes, 1024);
        assert_eq!(peers[0].tx_bytes, 2048);
        assert_eq!(peers[1].last_handshake, None);
        assert_eq!(peers[1].endpoint, None);
    }

    #[test]
    fn ignores_malformed_lines() {
        assert!(parse_dump("interface line only\n").is_empty());
        assert!(parse_dump("a\tb\nshort\tline\n").is_empty());
    }
}
