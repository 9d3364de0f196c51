use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-service settings read when the first worker of a service registers
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceSettings {
    /// Load ceiling per endpoint (requests for balanced services,
    /// entities for sticky services)
    #[serde(default = "default_max_count", alias = "max-vehicle-count")]
    pub max_count: u32,

    /// Heartbeat parameters
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            max_count: default_max_count(),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

/// Heartbeat interval and the number of missed beats tolerated
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct KeepaliveConfig {
    /// Heartbeat interval in milliseconds
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Missed heartbeats before an endpoint is considered expired
    #[serde(default = "default_liveness")]
    pub liveness: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            liveness: default_liveness(),
        }
    }
}

impl KeepaliveConfig {
    /// Expiry window: liveness x interval
    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.liveness.saturating_mul(self.interval))
    }
}

fn default_max_count() -> u32 {
    10000
}

fn default_interval() -> u64 {
    2500
}

fn default_liveness() -> u64 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = ServiceSettings::default();
        assert_eq!(settings.max_count, 10000);
        assert_eq!(settings.keepalive.expiry(), Duration::from_millis(7500));
    }

    #[test]
    fn test_max_vehicle_count_alias() {
        let settings: ServiceSettings =
            serde_yaml::from_str("max-vehicle-count: 42\nkeepalive:\n  interval: 1000\n").unwrap();
        assert_eq!(settings.max_count, 42);
        assert_eq!(settings.keepalive.liveness, 3);
        assert_eq!(settings.keepalive.expiry(), Duration::from_millis(3000));
    }
}
