//! Route table mapping a URL segment to service bindings

use crate::{CoreError, Result, RoutingSession};
use broker_api::{RouteRuleConfig, ServiceType};
use std::collections::BTreeMap;
use tracing::debug;

/// Binding of a route to one service, with its sticky sessions
#[derive(Clone, Debug)]
pub struct ServiceBinding {
    pub name: String,
    pub service_type: ServiceType,
    pub keyword: Option<String>,
    pub rewrite_on_dispatch: bool,
    sessions: BTreeMap<String, RoutingSession>,
}

impl ServiceBinding {
    pub fn new(
        name: impl Into<String>,
        service_type: ServiceType,
        keyword: Option<String>,
        rewrite_on_dispatch: bool,
    ) -> Self {
        Self {
            name: name.into(),
            service_type,
            keyword,
            rewrite_on_dispatch,
            sessions: BTreeMap::new(),
        }
    }

    pub fn is_forward(&self) -> bool {
        self.service_type.is_forward()
    }

    /// Bindings the hosting application handles itself (none, internal, all)
    pub fn is_internal(&self) -> bool {
        self.service_type.is_internal()
    }

    /// Whether requests are pinned per entity rather than balanced per request
    pub fn is_sticky(&self) -> bool {
        self.keyword.is_some()
    }

    /// Find or create the session for an entity
    pub fn session_mut(&mut self, entity_id: &str) -> &mut RoutingSession {
        if !self.sessions.contains_key(entity_id) {
            debug!("New session {} on service {}", entity_id, self.name);
        }
        self.sessions
            .entry(entity_id.to_string())
            .or_insert_with(|| RoutingSession::new(entity_id))
    }

    pub fn session(&self, entity_id: &str) -> Option<&RoutingSession> {
        self.sessions.get(entity_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// All bindings sharing one URL segment
#[derive(Clone, Debug)]
pub struct RouteRule {
    pub url_name: String,
    pub bindings: Vec<ServiceBinding>,
}

impl RouteRule {
    /// Number of bindings the hosting application must handle
    pub fn internal_count(&self) -> usize {
        self.bindings.iter().filter(|b| b.is_internal()).count()
    }
}

/// Route table keyed by URL segment
#[derive(Clone, Debug, Default)]
pub struct RouteTable {
    rules: BTreeMap<String, RouteRule>,
}

impl RouteTable {
    /// Build the table from configuration. Rules sharing a `url-name` are
    /// merged in configuration order.
    pub fn from_rules(rules: &[RouteRuleConfig]) -> Self {
        let mut table = Self::default();
        for rule in rules {
            let binding = ServiceBinding::new(
                rule.service.name.clone(),
                rule.service.service_type,
                rule.service.keyword.clone(),
                rule.service.rewrite_on_dispatch(),
            );
            table
                .rules
                .entry(rule.url_name.clone())
                .or_insert_with(|| RouteRule {
                    url_name: rule.url_name.clone(),
                    bindings: Vec::new(),
                })
                .bindings
                .push(binding);
        }
        debug!("Route table built with {} rules", table.rules.len());
        table
    }

    pub fn lookup(&self, url_name: &str) -> Result<&RouteRule> {
        self.rules
            .get(url_name)
            .ok_or_else(|| CoreError::NotFound(format!("route {}", url_name)))
    }

    pub fn lookup_mut(&mut self, url_name: &str) -> Result<&mut RouteRule> {
        self.rules
            .get_mut(url_name)
            .ok_or_else(|| CoreError::NotFound(format!("route {}", url_name)))
    }

    pub fn rules(&self) -> impl Iterator<Item = &RouteRule> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_api::ServiceBindingConfig;

    fn rule(url: &str, name: &str, service_type: ServiceType, keyword: Option<&str>) -> RouteRuleConfig {
        RouteRuleConfig {
            url_name: url.to_string(),
            service: ServiceBindingConfig {
                name: name.to_string(),
                service_type,
                keyword: keyword.map(str::to_string),
                inter_change: 0,
            },
        }
    }

    #[test]
    fn test_rules_merge_by_url_name() {
        let table = RouteTable::from_rules(&[
            rule("/update", "snapshot", ServiceType::Forward, Some("vid")),
            rule("/update", "history", ServiceType::All, Some("vid")),
            rule("/map", "map", ServiceType::Internal, None),
        ]);
        assert_eq!(table.len(), 2);

        let update = table.lookup("/update").unwrap();
        let names: Vec<&str> = update.bindings.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["snapshot", "history"]);
        assert_eq!(update.internal_count(), 1);
        assert_eq!(table.lookup("/map").unwrap().internal_count(), 1);
    }

    #[test]
    fn test_unknown_segment_is_not_found() {
        let table = RouteTable::from_rules(&[rule("/update", "snapshot", ServiceType::Forward, Some("vid"))]);
        assert!(matches!(table.lookup("/nope"), Err(CoreError::NotFound(_))));
        assert!(matches!(table.lookup("/upd"), Err(CoreError::NotFound(_))));
    }

    #[test]
    fn test_sessions_created_lazily() {
        let mut binding = ServiceBinding::new("snapshot", ServiceType::Forward, Some("vid".to_string()), false);
        assert!(binding.is_sticky());
        assert!(binding.is_forward());
        assert!(!binding.is_internal());
        assert!(binding.session("ABC123").is_none());

        binding.session_mut("ABC123");
        binding.session_mut("ABC123");
        binding.session_mut("XYZ");
        assert_eq!(binding.session_count(), 2);
        assert_eq!(binding.session("ABC123").unwrap().entity_id, "ABC123");
    }
}
