//! Core routing state of the edge broker
//!
//! This library provides:
//! - Endpoint registry with least-loaded and exclusion-aware allocation
//! - Client registry gating out-of-band telemetry delivery
//! - Route table and sticky per-entity routing sessions
//! - Request URI parsing with side-channel query handling

pub mod client;
pub mod endpoint;
pub mod error;
pub mod registry;
pub mod route;
pub mod session;
pub mod uri;

pub use client::ClientRegistry;
pub use endpoint::{Endpoint, EndpointStatus, Identity};
pub use error::{CoreError, Result};
pub use registry::{EndpointRegistry, ServiceItem};
pub use route::{RouteRule, RouteTable, ServiceBinding};
pub use session::{RoutingSession, SessionSlot};
pub use uri::RequestUri;
