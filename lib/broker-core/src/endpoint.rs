//! Endpoint management
use chrono::{DateTime, Utc};
use std::fmt;

/// Opaque transport address of a peer (a ROUTER identity frame)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity(Vec<u8>);

impl Identity {
    pub fn new(raw: impl Into<Vec<u8>>) -> Self {
        Self(raw.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<&[u8]> for Identity {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl fmt::Display for Identity {
    // Printable identities as text, binary ones as hex
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) if text.chars().all(|c| c.is_ascii_graphic()) => f.write_str(text),
            _ => write!(f, "0x{}", hex::encode(&self.0)),
        }
    }
}

/// Liveness state of an endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointStatus {
    Disabled,
    Alive,
}

/// One registered worker instance of a service
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub identity: Identity,
    pub status: EndpointStatus,
    /// Requests assigned by balanced allocation; reset with the pool
    pub load: u32,
    /// Entities pinned by sticky allocation; never reset
    pub entities: u32,
    /// Capacity hint announced at registration
    pub capacity_hint: u32,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Endpoint {
    pub fn new(identity: Identity, capacity_hint: u32) -> Self {
        let now = Utc::now();
        Self {
            identity,
            status: EndpointStatus::Alive,
            load: 0,
            // Workers report how many entities they already serve
            entities: capacity_hint,
            capacity_hint,
            registered_at: now,
            last_seen: now,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status == EndpointStatus::Alive
    }
}
