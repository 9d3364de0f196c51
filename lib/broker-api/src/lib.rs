//! Edge broker configuration types
//!
//! This library defines the configuration surface of the edge broker:
//! - BrokerConfig: socket endpoints, redundancy and upstream registration
//! - RouteRuleConfig: URL segment to service binding rules
//! - ServiceSettings: per-service load ceiling and keepalive parameters

pub mod config;
pub mod error;
pub mod route_rule;
pub mod service;

pub use config::{BrokerConfig, DistributeConfig, SocketConfig, SocketKind};
pub use error::{ConfigError, Result};
pub use route_rule::{RouteRuleConfig, ServiceBindingConfig, ServiceType};
pub use service::{KeepaliveConfig, ServiceSettings};
