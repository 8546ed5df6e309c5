//! Annuaire d'hôtes : adresses et identifiants BMC, disponibilité des hôtes.

use std::collections::HashMap;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::models::{HostAddress, HostId};

pub trait HostDirectory: Send {
    fn lookup(&self, host_id: HostId) -> Option<HostAddress>;
    fn activate_host(&mut self, host_id: HostId, timestamp: OffsetDateTime, reason: &str);
    fn deactivate_host(&mut self, host_id: HostId, timestamp: OffsetDateTime, reason: &str);
}

/// Annuaire statique issu de la configuration YAML
pub struct ConfigDirectory {
    hosts: HashMap<HostId, HostAddress>,
    unavailable: HashMap<HostId, OffsetDateTime>,
}

impl ConfigDirectory {
    pub fn new(hosts: HashMap<HostId, HostAddress>) -> Self {
        Self {
            hosts,
            unavailable: HashMap::new(),
        }
    }

    /// Hôtes déclarés indisponibles et depuis quand
    pub fn unavailable_since(&self, host_id: HostId) -> Option<OffsetDateTime> {
        self.unavailable.get(&host_id).copied()
    }
}

impl HostDirectory for ConfigDirectory {
    fn lookup(&self, host_id: HostId) -> Option<HostAddress> {
        self.hosts.get(&host_id).cloned()
    }

    fn activate_host(&mut self, host_id: HostId, _timestamp: OffsetDateTime, reason: &str) {
        if self.unavailable.remove(&host_id).is_some() {
            info!(host_id, reason, "IPMI host available again");
        }
    }

    fn deactivate_host(&mut self, host_id: HostId, timestamp: OffsetDateTime, reason: &str) {
        self.unavailable.entry(host_id).or_insert(timestamp);
        warn!(host_id, reason, "IPMI host unavailable");
    }
}
