use serde::{Deserialize, Serialize};

/// RouteRuleConfig maps the first path segment of a request URL to a
/// service binding. Several rules may share one `url-name`; each contributes
/// one binding to the same route.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct RouteRuleConfig {
    /// Path segment to match (e.g. "/update")
    pub url_name: String,

    /// Service this rule dispatches to
    pub service: ServiceBindingConfig,
}

/// Binding of a route to one named service
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceBindingConfig {
    /// Name of the service (must appear under `services` to accept workers)
    pub name: String,

    /// How the broker treats the binding
    #[serde(default, rename = "type")]
    pub service_type: ServiceType,

    /// Query parameter carrying the entity id for sticky sessions.
    /// Bindings without a keyword are balanced per request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,

    /// Non-zero when the entity token must be translated before dispatch
    #[serde(default, rename = "inter_change")]
    pub inter_change: u32,
}

impl ServiceBindingConfig {
    /// Whether the keyword value is rewritten through the key resolver
    pub fn rewrite_on_dispatch(&self) -> bool {
        self.inter_change != 0
    }
}

/// Service type of a binding
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// Neither forwarded nor handled internally (counted as internal)
    #[default]
    None,
    /// Handled by the hosting application
    Internal,
    /// Forwarded to registered worker endpoints
    Forward,
    /// Forwarded and handled internally
    All,
}

impl ServiceType {
    pub fn is_forward(self) -> bool {
        matches!(self, ServiceType::Forward | ServiceType::All)
    }

    /// Anything but a pure forward is also seen by the hosting application
    pub fn is_internal(self) -> bool {
        self != ServiceType::Forward
    }
}
