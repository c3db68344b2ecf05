//! Registry of known hosts and the authoritative flag.
//!
//! Records are kept in first-seen order and never removed. At most one
//! record is authoritative; [`Registry::promote`] is the only way to set the
//! flag and it clears every other record in the same step.

use serde::{Deserialize, Serialize};

/// A host the orchestrator has been asked to target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    /// Host address, used both to reach its agent and as the NAT target.
    pub address: String,

    /// Whether this host is believed to serve the live workload.
    pub authoritative: bool,
}

impl HostRecord {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            authoritative: false,
        }
    }
}

/// Ordered host registry.
#[derive(Debug, Default)]
pub struct Registry {
    hosts: Vec<HostRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a record by exact address.
    pub fn get(&self, address: &str) -> Option<&HostRecord> {
        self.hosts.iter().find(|h| h.address == address)
    }

    /// Look up a record, creating a non-authoritative one if absent.
    pub fn get_or_insert(&mut self, address: &str) -> HostRecord {
        if let Some(record) = self.get(address) {
            return record.clone();
        }
        let record = HostRecord::new(address);
        self.hosts.push(record.clone());
        record
    }

    /// The authoritative record, if any. The first match wins.
    pub fn authoritative(&self) -> Option<&HostRecord> {
        self.hosts.iter().find(|h| h.authoritative)
    }

    /// Make `address` the only authoritative record.
    ///
    /// Returns false, changing nothing, if the address is unknown.
    pub fn promote(&mut self, address: &str) -> bool {
        if self.get(address).is_none() {
            return false;
        }
        for host in &mut self.hosts {
            host.authoritative = host.address == address;
        }
        true
    }

    /// Clear every authoritative flag.
    pub fn clear_authority(&mut self) {
        for host in &mut self.hosts {
            host.authoritative = false;
        }
    }

    /// Snapshot of all records in first-seen order.
    pub fn records(&self) -> Vec<HostRecord> {
        self.hosts.clone()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.hosts.iter().map(|h| h.address.clone()).collect()
    }
}
