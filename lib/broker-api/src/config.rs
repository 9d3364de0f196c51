//! Broker configuration document

use crate::{ConfigError, Result, RouteRuleConfig, ServiceSettings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// Environment variable overriding the advertised distribute address
pub const POD_IP_ENV: &str = "POD_IP";

/// Top-level broker configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct BrokerConfig {
    /// Name this broker registers under when it is itself a worker upstream
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Mirror every sticky dispatch to a slave endpoint
    #[serde(default)]
    pub redundant: bool,

    /// Client-facing socket
    #[serde(default = "default_client_socket")]
    pub client: SocketConfig,

    /// Worker-facing socket
    #[serde(default = "default_worker_socket")]
    pub worker: SocketConfig,

    /// Telemetry socket and advertised callback address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribute: Option<DistributeConfig>,

    /// Send a REGISTER control frame upstream on the client socket at start
    #[serde(default)]
    pub upstream_registration: bool,

    /// Route rules, evaluated by `url-name`
    #[serde(default)]
    pub route_rules: Vec<RouteRuleConfig>,

    /// Services that may register worker endpoints
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSettings>,
}

/// Socket pattern; routers bind, dealers connect
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SocketKind {
    #[default]
    Router,
    Dealer,
}

/// One transport socket
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct SocketConfig {
    pub uri: String,
    #[serde(default)]
    pub kind: SocketKind,
}

impl SocketConfig {
    pub fn new(uri: impl Into<String>, kind: SocketKind) -> Self {
        Self {
            uri: uri.into(),
            kind,
        }
    }

    /// Whether the socket is bound (router) rather than connected (dealer)
    pub fn binds(&self) -> bool {
        self.kind == SocketKind::Router
    }
}

/// Telemetry socket plus the externally reachable address injected into
/// every forwarded request
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct DistributeConfig {
    #[serde(default = "default_distribute_uri")]
    pub uri: String,
    #[serde(default)]
    pub kind: SocketKind,
    #[serde(default = "default_distribute_ipaddr")]
    pub ipaddr: String,
    #[serde(default = "default_distribute_port")]
    pub port: u16,
}

impl Default for DistributeConfig {
    fn default() -> Self {
        Self {
            uri: default_distribute_uri(),
            kind: SocketKind::Router,
            ipaddr: default_distribute_ipaddr(),
            port: default_distribute_port(),
        }
    }
}

impl DistributeConfig {
    pub fn socket(&self) -> SocketConfig {
        SocketConfig::new(self.uri.clone(), self.kind)
    }
}

impl BrokerConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(doc: &str) -> Result<Self> {
        let mut config: BrokerConfig = serde_yaml::from_str(doc)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Load, apply environment overrides and validate a YAML file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let doc = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&doc)?;
        config.apply_env();
        debug!("Loaded broker configuration from {}", path.display());
        Ok(config)
    }

    /// Apply environment overrides (POD_IP replaces the distribute address)
    pub fn apply_env(&mut self) {
        if let Ok(ip) = std::env::var(POD_IP_ENV) {
            self.override_distribute_ip(ip);
        }
    }

    fn override_distribute_ip(&mut self, ip: String) {
        if ip.is_empty() {
            return;
        }
        if let Some(distribute) = self.distribute.as_mut() {
            debug!("Distribute address overridden to {}", ip);
            distribute.ipaddr = ip;
        }
    }

    /// Settings for a service, if it is configured
    pub fn service(&self, name: &str) -> Option<&ServiceSettings> {
        self.services.get(name)
    }

    fn normalize(&mut self) {
        for rule in &mut self.route_rules {
            if !rule.url_name.starts_with('/') {
                rule.url_name.insert(0, '/');
            }
        }

        // Duplicate (url-name, service) pairs: first one wins
        let mut seen = std::collections::BTreeSet::new();
        self.route_rules.retain(|rule| {
            let fresh = seen.insert((rule.url_name.clone(), rule.service.name.clone()));
            if !fresh {
                warn!(
                    "Ignoring duplicate route rule {} -> {}",
                    rule.url_name, rule.service.name
                );
            }
            fresh
        });
    }

    fn validate(&self) -> Result<()> {
        if self.route_rules.is_empty() {
            return Err(ConfigError::Invalid("no route rules configured".to_string()));
        }
        if self.client.uri.is_empty() || self.worker.uri.is_empty() {
            return Err(ConfigError::Invalid(
                "client and worker socket URIs must not be empty".to_string(),
            ));
        }
        if self.upstream_registration && self.client.kind != SocketKind::Dealer {
            return Err(ConfigError::Invalid(
                "upstream-registration needs a dealer client socket".to_string(),
            ));
        }
        if let Some(distribute) = &self.distribute {
            if distribute.uri.is_empty() {
                return Err(ConfigError::Invalid(
                    "distribute socket URI must not be empty".to_string(),
                ));
            }
        }
        for rule in &self.route_rules {
            if rule.url_name.len() < 2 {
                return Err(ConfigError::Invalid("empty route rule url-name".to_string()));
            }
            // Requests are matched on their first path segment only
            if rule.url_name[1..].contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "route rule url-name {} spans more than one path segment",
                    rule.url_name
                )));
            }
            if rule.service.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "route rule {} has no service name",
                    rule.url_name
                )));
            }
            if rule.service.service_type.is_forward()
                && rule.service.rewrite_on_dispatch()
                && rule.service.keyword.is_none()
            {
                return Err(ConfigError::Invalid(format!(
                    "route rule {} rewrites without a keyword",
                    rule.url_name
                )));
            }
        }
        Ok(())
    }
}

fn default_service_name() -> String {
    "edge-broker".to_string()
}

fn default_client_socket() -> SocketConfig {
    SocketConfig::new("tcp://*:5555", SocketKind::Router)
}

fn default_worker_socket() -> SocketConfig {
    SocketConfig::new("tcp://*:5556", SocketKind::Router)
}

fn default_distribute_uri() -> String {
    "tcp://*:6000".to_string()
}

fn default_distribute_ipaddr() -> String {
    "localhost".to_string()
}

fn default_distribute_port() -> u16 {
    6000
}
