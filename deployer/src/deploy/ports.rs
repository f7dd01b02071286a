//! Local port allocation for deployed applications

use std::collections::HashMap;
use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;
use std::sync::Mutex;

use tracing::debug;

use crate::errors::DeployerError;
use crate::models::deployment::{DeploymentKey, DeploymentRecord};

/// Hands out one port per deployment key.
///
/// A key keeps the port it was given for as long as the allocator lives, and
/// a port recorded on a key's previous run is reused for the next one.
#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    assigned: Mutex<HashMap<DeploymentKey, u16>>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            assigned: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve the ports of persisted records so new keys never collide with them
    pub fn seed<'a>(&self, records: impl IntoIterator<Item = &'a DeploymentRecord>) {
        let mut assigned = self.lock();
        for record in records {
            let Some(port) = record.port else { continue };
            if let Ok(key) = DeploymentKey::new(record.template_id.clone(), record.tenant_id.clone()) {
                assigned.insert(key, port);
            }
        }
    }

    /// Port for `key`: the one already assigned, the one on its previous
    /// record, or the first free port in range.
    pub fn resolve(&self, key: &DeploymentKey, previous: Option<&DeploymentRecord>) -> Result<u16, DeployerError> {
        let mut assigned = self.lock();

        if let Some(port) = assigned.get(key) {
            return Ok(*port);
        }

        if let Some(port) = previous.and_then(|r| r.port) {
            let taken = assigned.iter().any(|(k, p)| *p == port && k != key);
            if !taken {
                assigned.insert(key.clone(), port);
                return Ok(port);
            }
        }

        for port in self.range.clone() {
            if assigned.values().any(|p| *p == port) {
                continue;
            }
            if !is_bindable(port) {
                debug!("Port {} is in use, skipping", port);
                continue;
            }
            assigned.insert(key.clone(), port);
            return Ok(port);
        }

        Err(DeployerError::PortsExhausted(format!(
            "{}-{}",
            self.range.start(),
            self.range.end()
        )))
    }

    /// Port currently assigned to `key`
    pub fn get(&self, key: &DeploymentKey) -> Option<u16> {
        self.lock().get(key).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DeploymentKey, u16>> {
        self.assigned.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
