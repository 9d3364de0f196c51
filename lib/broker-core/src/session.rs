//! Sticky per-entity routing sessions
//!
//! A session binds one entity id to a master endpoint and, for redundant
//! services, a slave endpoint. Slots hold endpoint identities; liveness is
//! always checked against the registry, so a deregistered endpoint simply
//! stops being live.

use crate::{CoreError, EndpointRegistry, Identity, Result};
use tracing::{debug, warn};

/// One allocated endpoint of a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSlot {
    pub identity: Identity,
}

impl SessionSlot {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }
}

/// Master (and optional slave) assignment for one entity
#[derive(Clone, Debug)]
pub struct RoutingSession {
    pub entity_id: String,
    pub master: Option<SessionSlot>,
    pub slave: Option<SessionSlot>,
}

impl RoutingSession {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            master: None,
            slave: None,
        }
    }

    fn live_slot<'a>(
        slot: &'a Option<SessionSlot>,
        registry: &EndpointRegistry,
        service: &str,
    ) -> Option<&'a Identity> {
        slot.as_ref()
            .map(|s| &s.identity)
            .filter(|id| registry.is_alive(service, id))
    }

    /// Make sure the session has a live master (and a live slave when
    /// `redundant` is set), allocating from `registry` as needed.
    ///
    /// Fails only when no master can be found. A missing slave is not an
    /// error; the session then runs without mirroring.
    pub fn ensure_live_allocation(
        &mut self,
        registry: &mut EndpointRegistry,
        service: &str,
        redundant: bool,
    ) -> Result<()> {
        let master_live = Self::live_slot(&self.master, registry, service).cloned();
        let slave_live = if redundant {
            Self::live_slot(&self.slave, registry, service).cloned()
        } else {
            None
        };

        match (master_live, slave_live) {
            (Some(_), Some(_)) => Ok(()),
            (Some(master), None) => {
                if redundant {
                    self.slave = registry
                        .allocate_excluding(service, Some(&master))
                        .ok()
                        .map(SessionSlot::new);
                    if let Some(slave) = &self.slave {
                        debug!("Entity {} slave -> {}", self.entity_id, slave.identity);
                    }
                }
                Ok(())
            }
            (None, Some(slave)) => {
                match registry.allocate_excluding(service, Some(&slave)) {
                    Ok(master) => {
                        debug!("Entity {} master -> {}", self.entity_id, master);
                        self.master = Some(SessionSlot::new(master));
                    }
                    Err(_) => {
                        // No other endpoint: the slave takes over
                        warn!(
                            "Entity {} promoting slave {} to master",
                            self.entity_id, slave
                        );
                        self.master = self.slave.take();
                    }
                }
                Ok(())
            }
            (None, None) => {
                let master = registry.allocate_excluding(service, None).map_err(|e| {
                    CoreError::NotFound(format!(
                        "no endpoint for entity {} of {}: {}",
                        self.entity_id, service, e
                    ))
                })?;
                debug!("Entity {} master -> {}", self.entity_id, master);
                self.slave = if redundant {
                    registry
                        .allocate_excluding(service, Some(&master))
                        .ok()
                        .map(SessionSlot::new)
                } else {
                    None
                };
                self.master = Some(SessionSlot::new(master));
                Ok(())
            }
        }
    }

    pub fn master_identity(&self) -> Option<&Identity> {
        self.master.as_ref().map(|s| &s.identity)
    }

    pub fn slave_identity(&self) -> Option<&Identity> {
        self.slave.as_ref().map(|s| &s.identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EndpointStatus;
    use broker_api::ServiceSettings;
    use std::collections::BTreeMap;

    fn registry(ids: &[&str]) -> EndpointRegistry {
        let mut catalog = BTreeMap::new();
        catalog.insert("snapshot".to_string(), ServiceSettings::default());
        let mut registry = EndpointRegistry::new(catalog);
        for id in ids {
            registry.add_endpoint("snapshot", Identity::from(*id), 0).unwrap();
        }
        registry
    }

    #[test]
    fn test_allocates_master_and_slave() {
        let mut registry = registry(&["W1", "W2"]);
        let mut session = RoutingSession::new("ABC123");
        session
            .ensure_live_allocation(&mut registry, "snapshot", true)
            .unwrap();
        assert_eq!(session.master_identity(), Some(&Identity::from("W1")));
        assert_eq!(session.slave_identity(), Some(&Identity::from("W2")));

        // Sticky: nothing changes on the second call
        session
            .ensure_live_allocation(&mut registry, "snapshot", true)
            .unwrap();
        assert_eq!(session.master_identity(), Some(&Identity::from("W1")));
        assert_eq!(session.slave_identity(), Some(&Identity::from("W2")));
    }

    #[test]
    fn test_single_endpoint_has_no_slave() {
        let mut registry = registry(&["W1"]);
        let mut session = RoutingSession::new("ABC123");
        session
            .ensure_live_allocation(&mut registry, "snapshot", true)
            .unwrap();
        assert_eq!(session.master_identity(), Some(&Identity::from("W1")));
        assert_eq!(session.slave_identity(), None);
    }

    #[test]
    fn test_non_redundant_never_allocates_slave() {
        let mut registry = registry(&["W1", "W2"]);
        let mut session = RoutingSession::new("ABC123");
        session
            .ensure_live_allocation(&mut registry, "snapshot", false)
            .unwrap();
        assert_eq!(session.master_identity(), Some(&Identity::from("W1")));
        assert_eq!(session.slave_identity(), None);
    }

    #[test]
    fn test_no_endpoints_fails() {
        let mut registry = registry(&[]);
        let mut session = RoutingSession::new("ABC123");
        assert!(matches!(
            session.ensure_live_allocation(&mut registry, "snapshot", true),
            Err(CoreError::NotFound(_))
        ));
        assert!(session.master.is_none());
    }

    #[test]
    fn test_slave_promoted_when_master_lost() {
        let mut registry = registry(&["W1", "W2"]);
        let mut session = RoutingSession::new("ABC123");
        session
            .ensure_live_allocation(&mut registry, "snapshot", true)
            .unwrap();

        registry
            .remove_endpoint("snapshot", &Identity::from("W1"))
            .unwrap();
        session
            .ensure_live_allocation(&mut registry, "snapshot", true)
            .unwrap();
        assert_eq!(session.master_identity(), Some(&Identity::from("W2")));
        assert_eq!(session.slave_identity(), None);
    }

    #[test]
    fn test_master_replaced_when_spare_exists() {
        let mut registry = registry(&["W1", "W2", "W3"]);
        let mut session = RoutingSession::new("ABC123");
        session
            .ensure_live_allocation(&mut registry, "snapshot", true)
            .unwrap();

        registry
            .set_status("snapshot", &Identity::from("W1"), EndpointStatus::Disabled)
            .unwrap();
        session
            .ensure_live_allocation(&mut registry, "snapshot", true)
            .unwrap();
        assert_eq!(session.master_identity(), Some(&Identity::from("W3")));
        assert_eq!(session.slave_identity(), Some(&Identity::from("W2")));
    }

    #[test]
    fn test_master_and_slave_never_coincide() {
        let ids = ["W1", "W2", "W3"];
        let mut registry = registry(&ids);
        let mut session = RoutingSession::new("ABC123");

        // Knock endpoints out and back in a fixed rotation, re-checking the
        // session after each change
        for round in 0..12 {
            let victim = Identity::from(ids[round % ids.len()]);
            let status = if round % 2 == 0 {
                EndpointStatus::Disabled
            } else {
                EndpointStatus::Alive
            };
            registry.set_status("snapshot", &victim, status).unwrap();

            session
                .ensure_live_allocation(&mut registry, "snapshot", true)
                .unwrap();
            if let (Some(master), Some(slave)) = (session.master_identity(), session.slave_identity()) {
                assert_ne!(master, slave, "round {}", round);
            }
        }
    }
}
