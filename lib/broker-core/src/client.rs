//! Client registry gating the out-of-band telemetry path

use crate::Identity;
use std::collections::BTreeSet;
use tracing::debug;

/// Set of client identities seen on the client socket, plus the broker's
/// own externally reachable callback address
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: BTreeSet<Identity>,
    distribute: Option<(String, u16)>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a client identity. Returns true on first sight.
    pub fn add(&mut self, identity: Identity) -> bool {
        if self.clients.contains(&identity) {
            return false;
        }
        debug!("New client: {}", identity);
        self.clients.insert(identity)
    }

    pub fn remove(&mut self, identity: &Identity) -> bool {
        self.clients.remove(identity)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.clients.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Set the address injected into forwarded requests
    pub fn set_distribute_address(&mut self, ipaddr: impl Into<String>, port: u16) {
        self.distribute = Some((ipaddr.into(), port));
    }

    /// The broker's callback address, if a distribute socket is configured
    pub fn distribute_address(&self) -> Option<(&str, u16)> {
        self.distribute
            .as_ref()
            .map(|(ip, port)| (ip.as_str(), *port))
    }
}
