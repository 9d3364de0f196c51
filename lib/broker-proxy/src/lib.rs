//! ZeroMQ-style request broker: wire codecs, routing and the run loop
pub mod arbitrator;
pub mod broker;
pub mod facade;
pub mod metrics;
pub mod resolver;
pub mod wire;

pub use arbitrator::Arbitrator;
pub use broker::{
    ApplicationHandler, Broker, BrokerStats, Dispatcher, Outbox, RouteOutcome, RouteStats,
    RoutingCallback, SocketRole, WorkerTarget,
};
pub use facade::{BrokerFacade, ChannelPeer, ChannelTransport, Transport};
pub use metrics::BrokerMetrics;
pub use resolver::{KeyResolver, VehicleDirectory, VehicleRecord};
pub use wire::{ContentHeader, Envelope, Multipart, RegisterInfo, ServiceMsgType};
