//! TUN interface shim
//!
//! Creates the virtual interface the userspace engine reads plaintext IP
//! packets from, and installs the subnet route pointing at it.

use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use thiserror::Error;
use tokio::io::{ReadHalf, WriteHalf};

pub type TunReader = ReadHalf<tun::AsyncDevice>;
pub type TunWriter = WriteHalf<tun::AsyncDevice>;

#[derive(Debug, Error)]
pub enum TunError {
    #[error("failed to create TUN device: {0}")]
    Create(#[from] tun::Error),
    #[error("failed to install route: {0}")]
    Route(String),
}

/// Create the TUN interface, bring it up and split it into async halves.
pub fn create(
    name: &str,
    address: Ipv4Addr,
    subnet: Ipv4Network,
    mtu: u16,
) -> Result<(TunReader, TunWriter), TunError> {
    let mut config = tun::Configuration::default();
    config
        .name(name)
        .address(address)
        .netmask(subnet.mask())
        .mtu(mtu as i32)
        .up();

    #[cfg(target_os = "linux")]
    config.platform(|platform| {
        platform.packet_information(false);
    });

    let device = tun::create_as_async(&config)?;
    tracing::info!(device = name, %address, mtu, "TUN interface up");

    install_subnet_route(name, subnet)?;

    Ok(tokio::io::split(device))
}

/// Route the VPN subnet through the TUN interface so replies from the host
/// reach the engine. `replace` tolerates a route left over from a previous run.
#[cfg(target_os = "linux")]
fn install_subnet_route(name: &str, subnet: Ipv4Network) -> Result<(), TunError> {
    let output = std::process::Command::new("ip")
        .args(["route", "replace", &subnet.to_string(), "dev", name])
        .output()
        .map_err(|e| TunError::Route(e.to_string()))?;

    if !output.status.success() {
        return Err(TunError::Route(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    tracing::info!(%subnet, device = name, "subnet route installed");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn install_subnet_route(_name: &str, _subnet: Ipv4Network) -> Result<(), TunError> {
    Ok(())
}

/// Extract the IPv4 destination of a raw IP packet, if it is one.
pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < 20 || packet[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}
