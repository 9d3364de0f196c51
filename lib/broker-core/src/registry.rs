//! Endpoint registry for worker services and their allocation policies

use crate::{CoreError, Endpoint, EndpointStatus, Identity, Result};
use broker_api::ServiceSettings;
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// EndpointRegistry owns every registered worker endpoint, grouped by
/// service name
pub struct EndpointRegistry {
    // Services allowed to register, with their settings
    catalog: BTreeMap<String, ServiceSettings>,
    services: BTreeMap<String, ServiceItem>,
}

/// A named service and its live endpoints
#[derive(Clone, Debug)]
pub struct ServiceItem {
    pub name: String,
    pub max_load: u32,
    /// liveness x interval; computed from configuration but not enforced
    pub expiry: Duration,
    // Registration order; ties in allocation go to the earliest
    endpoints: Vec<Endpoint>,
}

impl ServiceItem {
    fn new(name: &str, settings: &ServiceSettings) -> Self {
        Self {
            name: name.to_string(),
            max_load: settings.max_count,
            expiry: settings.keepalive.expiry(),
            endpoints: Vec::new(),
        }
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    pub fn endpoint(&self, identity: &Identity) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.identity == *identity)
    }

    fn endpoint_mut(&mut self, identity: &Identity) -> Option<&mut Endpoint> {
        self.endpoints.iter_mut().find(|e| e.identity == *identity)
    }

    fn position(&self, identity: &Identity) -> Option<usize> {
        self.endpoints.iter().position(|e| e.identity == *identity)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Pick the live endpoint with the smallest load and count one
    /// assignment against it. Once the chosen endpoint reaches `max_load`,
    /// every endpoint of the service is reset to zero.
    pub fn allocate_least_loaded(&mut self) -> Option<Identity> {
        let max_load = self.max_load;
        let endpoint = self
            .endpoints
            .iter_mut()
            .filter(|e| e.is_alive())
            // min_by_key keeps the first of equal loads
            .min_by_key(|e| e.load)?;
        endpoint.load = endpoint.load.saturating_add(1);
        let reached = endpoint.load >= max_load;
        let chosen = endpoint.identity.clone();

        if reached {
            debug!(
                "Service {} endpoint {} reached max load {}, resetting pool",
                self.name, chosen, max_load
            );
            for endpoint in self.endpoints.iter_mut() {
                endpoint.load = 0;
            }
        }

        Some(chosen)
    }

    /// Pick the live endpoint with the fewest assigned entities, skipping
    /// `excluded` and any endpoint already at `max_load`. Entity counters
    /// are never reset.
    pub fn allocate_excluding(&mut self, excluded: Option<&Identity>) -> Option<Identity> {
        let max_load = self.max_load;
        let endpoint = self
            .endpoints
            .iter_mut()
            .filter(|e| e.is_alive())
            .filter(|e| e.entities < max_load)
            .filter(|e| Some(&e.identity) != excluded)
            .min_by_key(|e| e.entities)?;
        endpoint.entities += 1;
        Some(endpoint.identity.clone())
    }
}

impl EndpointRegistry {
    /// Create a registry accepting the services listed in `catalog`
    pub fn new(catalog: BTreeMap<String, ServiceSettings>) -> Self {
        Self {
            catalog,
            services: BTreeMap::new(),
        }
    }

    /// Register an endpoint. Re-registering an existing identity is a no-op.
    pub fn add_endpoint(
        &mut self,
        service: &str,
        identity: Identity,
        capacity_hint: u32,
    ) -> Result<&Endpoint> {
        if service.is_empty() || identity.is_empty() {
            return Err(CoreError::InvalidArgument(
                "service name and identity must not be empty".to_string(),
            ));
        }

        if !self.services.contains_key(service) {
            let settings = self
                .catalog
                .get(service)
                .ok_or_else(|| CoreError::NotFound(format!("service {} not configured", service)))?;
            let item = ServiceItem::new(service, settings);
            debug!(
                "Created service {} (max load {}, expiry {:?})",
                service, item.max_load, item.expiry
            );
            self.services.insert(service.to_string(), item);
        }

        let item = self
            .services
            .get_mut(service)
            .ok_or_else(|| CoreError::Internal(format!("service {} vanished", service)))?;

        let index = match item.position(&identity) {
            Some(index) => {
                debug!("Endpoint {} already registered for {}", identity, service);
                index
            }
            None => {
                info!("Registered endpoint {} for service {}", identity, service);
                item.endpoints.push(Endpoint::new(identity, capacity_hint));
                item.endpoints.len() - 1
            }
        };
        Ok(&item.endpoints[index])
    }

    /// Look up a single endpoint
    pub fn find_endpoint(&self, service: &str, identity: &Identity) -> Option<&Endpoint> {
        self.services.get(service)?.endpoint(identity)
    }

    /// Whether the endpoint exists and is alive
    pub fn is_alive(&self, service: &str, identity: &Identity) -> bool {
        self.find_endpoint(service, identity)
            .map(Endpoint::is_alive)
            .unwrap_or(false)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceItem> {
        self.services.get(name)
    }

    /// Balanced allocation for one request
    pub fn allocate_least_loaded(&mut self, service: &str) -> Result<Identity> {
        let item = self.service_mut(service)?;
        item.allocate_least_loaded()
            .ok_or_else(|| CoreError::NotFound(format!("no live endpoint for {}", service)))
    }

    /// Sticky allocation for one entity, never returning `excluded`
    pub fn allocate_excluding(
        &mut self,
        service: &str,
        excluded: Option<&Identity>,
    ) -> Result<Identity> {
        let item = self.service_mut(service)?;
        item.allocate_excluding(excluded)
            .ok_or_else(|| CoreError::NotFound(format!("no allocatable endpoint for {}", service)))
    }

    /// Record a heartbeat from an endpoint
    pub fn touch(&mut self, service: &str, identity: &Identity) -> Result<()> {
        let endpoint = self
            .service_mut(service)?
            .endpoint_mut(identity)
            .ok_or_else(|| CoreError::NotFound(format!("endpoint {}", identity)))?;
        endpoint.last_seen = Utc::now();
        Ok(())
    }

    /// Change the liveness state of an endpoint
    pub fn set_status(
        &mut self,
        service: &str,
        identity: &Identity,
        status: EndpointStatus,
    ) -> Result<()> {
        let endpoint = self
            .service_mut(service)?
            .endpoint_mut(identity)
            .ok_or_else(|| CoreError::NotFound(format!("endpoint {}", identity)))?;
        endpoint.status = status;
        Ok(())
    }

    /// Deregister one endpoint
    pub fn remove_endpoint(&mut self, service: &str, identity: &Identity) -> Result<Endpoint> {
        let item = self.service_mut(service)?;
        let index = item
            .position(identity)
            .ok_or_else(|| CoreError::NotFound(format!("endpoint {}", identity)))?;
        let endpoint = item.endpoints.remove(index);
        info!("Deregistered endpoint {} from service {}", identity, service);
        Ok(endpoint)
    }

    /// Tear down a service and all of its endpoints
    pub fn remove_service(&mut self, service: &str) -> Result<ServiceItem> {
        let item = self
            .services
            .remove(service)
            .ok_or_else(|| CoreError::NotFound(format!("service {}", service)))?;
        info!("Removed service {} ({} endpoints)", service, item.len());
        Ok(item)
    }

    /// Number of services with at least one registration
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Number of endpoints registered for a service
    pub fn endpoint_count(&self, service: &str) -> usize {
        self.services.get(service).map(ServiceItem::len).unwrap_or(0)
    }

    /// Number of endpoints across all services
    pub fn endpoint_total(&self) -> usize {
        self.services.values().map(ServiceItem::len).sum()
    }

    fn service_mut(&mut self, service: &str) -> Result<&mut ServiceItem> {
        self.services
            .get_mut(service)
            .ok_or_else(|| CoreError::NotFound(format!("service {}", service)))
    }
}
