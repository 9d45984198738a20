//! IP address allocation
//!
//! Assigns each user exactly one address out of the configured subnet and
//! remembers the assignment across restarts. The network address, the
//! server's own address (first usable host) and the broadcast address are
//! never handed out.

use ipnetwork::Ipv4Network;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("address pool {0} exhausted")]
    PoolExhausted(Ipv4Network),
    #[error("allocation store error: {0}")]
    Store(String),
}

/// A durable user → address binding. The public key tracks the key most
/// recently seen at login; the reaper clears it while keeping the address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub user_id: String,
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub public_key: Option<String>,
}

pub struct IpAllocator {
    subnet: Ipv4Network,
    path: PathBuf,
    state: Mutex<HashMap<String, Allocation>>,
}

impl IpAllocator {
    /// Open the allocator, restoring any persisted allocations. Entries
    /// outside the current subnet's assignable range are dropped with a
    /// warning (the subnet was reconfigured underneath them).
    pub fn open(subnet: Ipv4Network, path: impl Into<PathBuf>) -> Result<Self, AllocError> {
        let path = path.into();
        let mut state = HashMap::new();

        if path.exists() {
            let content =
                std::fs::read_to_string(&path).map_err(|e| AllocError::Store(e.to_string()))?;
            let stored: Vec<Allocation> =
                serde_json::from_str(&content).map_err(|e| AllocError::Store(e.to_string()))?;
            for alloc in stored {
                if assignable(subnet, alloc.ip) {
                    state.insert(alloc.user_id.clone(), alloc);
                } else {
                    tracing::warn!(user_id = %alloc.user_id, ip = %alloc.ip,
                        "stored allocation outside subnet, dropped");
                }
            }
            tracing::info!(count = state.len(), "allocations restored");
        }

        Ok(Self {
            subnet,
            path,
            state: Mutex::new(state),
        })
    }

    /// Return the user's address, assigning the numerically smallest free
    /// one on first call.
    pub fn acquire(&self, user_id: &str) -> Result<Ipv4Addr, AllocError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.get(user_id) {
            return Ok(existing.ip);
        }

        let used: BTreeSet<u32> = state.values().map(|a| u32::from(a.ip)).collect();
        let first = u32::from(self.subnet.network()) + 2;
        let last = u32::from(self.subnet.broadcast()) - 1;
        let ip = (first..=last)
            .find(|candidate| !used.contains(candidate))
            .map(Ipv4Addr::from)
            .ok_or(AllocError::PoolExhausted(self.subnet))?;

        state.insert(
            user_id.to_string(),
            Allocation {
                user_id: user_id.to_string(),
                ip,
                public_key: None,
            },
        );
        self.persist(&state)?;
        tracing::info!(user_id, %ip, "address assigned");
        Ok(ip)
    }

    /// Drop the user's allocation entirely. Absent users are fine.
    pub fn release(&self, user_id: &str) -> Result<(), AllocError> {
        let mut state = self.state.lock();
        if state.remove(user_id).is_some() {
            self.persist(&state)?;
            tracing::info!(user_id, "allocation released");
        }
        Ok(())
    }

    /// Record the public key observed for this user's latest login.
    pub fn bind(&self, user_id: &str, public_key: &str) -> Result<(), AllocError> {
        let mut state = self.state.lock();
        if let Some(alloc) = state.get_mut(user_id) {
            alloc.public_key = Some(public_key.to_string());
            self.persist(&state)?;
        }
        Ok(())
    }

    /// Clear the stored key wherever it matches, keeping the address
    /// reserved. Returns the affected user ids.
    pub fn clear_public_key(&self, public_key: &str) -> Result<Vec<String>, AllocError> {
        let mut state = self.state.lock();
        let mut cleared = Vec::new();
        for alloc in state.values_mut() {
            if alloc.public_key.as_deref() == Some(public_key) {
                alloc.public_key = None;
                cleared.push(alloc.user_id.clone());
            }
        }
        if !cleared.is_empty() {
            self.persist(&state)?;
        }
        Ok(cleared)
    }

    pub fn list(&self) -> Vec<Allocation> {
        self.state.lock().values().cloned().collect()
    }

    pub fn user_for_ip(&self, ip: Ipv4Addr) -> Option<String> {
        self.state
            .lock()
            .values()
            .find(|a| a.ip == ip)
            .map(|a| a.user_id.clone())
    }

    /// Atomic rewrite: the temp file lands next to the target so the rename
    /// stays on one filesystem.
    fn persist(&self, state: &HashMap<String, Allocation>) -> Result<(), AllocError> {
        let mut allocations: Vec<&Allocation> = state.values().collect();
        allocations.sort_by_key(|a| a.ip);
        let content = serde_json::to_string_pretty(&allocations)
            .map_err(|e| AllocError::Store(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(|e| AllocError::Store(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| AllocError::Store(e.to_string()))
    }
}

fn assignable(subnet: Ipv4Network, ip: Ipv4Addr) -> bool {
    let value = u32::from(ip);
    value >= u32::from(subnet.network()) + 2 && value < u32::from(subnet.broadcast())
}
