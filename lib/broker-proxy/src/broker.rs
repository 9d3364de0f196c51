//! Broker: classifies inbound messages by socket, rewrites request
//! envelopes and queues outbound traffic
//!
//! The broker never touches a socket itself. Every send is queued in the
//! [`Outbox`] and flushed by the facade after the handler returns, so one
//! inbound message is fully processed before the next is read.

use crate::metrics::BrokerMetrics;
use crate::wire::{
    decode_control_header, decode_reply, encode_control_header, Envelope, Multipart, RegisterInfo,
    ServiceMsgType, ROLE_MASTER, ROLE_SLAVE,
};
use broker_api::{SocketConfig, SocketKind};
use broker_core::{ClientRegistry, CoreError, Identity, RequestUri, Result};
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use tracing::{debug, info, warn};

pub const QUERY_CLIENT_IDENTITY: &str = "cli_identity";
pub const QUERY_ISSUED_IPADDR: &str = "issued_ipaddr";
pub const QUERY_ISSUED_PORT: &str = "issued_port";
pub const QUERY_START_TIME: &str = "start_time";
pub const QUERY_PROCESSING_TIME: &str = "processing-time";
// Older telemetry senders echo the identity under this key
const QUERY_LEGACY_IDENTITY: &str = "identity";

/// Socket a message arrived on or is sent to
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketRole {
    Client,
    Worker,
    Distribute,
}

impl SocketRole {
    pub fn as_str(self) -> &'static str {
        match self {
            SocketRole::Client => "client",
            SocketRole::Worker => "worker",
            SocketRole::Distribute => "distribute",
        }
    }
}

impl fmt::Display for SocketRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoints a request is sent to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerTarget {
    pub master: Identity,
    pub slave: Option<Identity>,
    /// Prefix MASTER/SLAVE role frames
    pub tagged: bool,
}

impl WorkerTarget {
    /// Plain dispatch to one endpoint
    pub fn single(master: Identity) -> Self {
        Self {
            master,
            slave: None,
            tagged: false,
        }
    }

    /// Role-tagged dispatch, mirrored to `slave` when present
    pub fn redundant(master: Identity, slave: Option<Identity>) -> Self {
        Self {
            master,
            slave,
            tagged: true,
        }
    }
}

/// Sending side handed to the routing callback
pub trait Dispatcher {
    /// Send `msg` to the target's master endpoint (and its slave, if any)
    fn forward_to_worker(&mut self, service: &str, msg: &Multipart, target: &WorkerTarget);

    /// Send a pre-addressed control reply on the worker socket
    fn reply_to_worker(&mut self, msg: Multipart);
}

/// Queue of outbound messages
pub struct Outbox {
    queue: VecDeque<(SocketRole, Multipart)>,
    metrics: BrokerMetrics,
}

impl Outbox {
    pub fn new(metrics: BrokerMetrics) -> Self {
        Self {
            queue: VecDeque::new(),
            metrics,
        }
    }

    pub fn push(&mut self, role: SocketRole, msg: Multipart) {
        self.queue.push_back((role, msg));
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (SocketRole, Multipart)> + '_ {
        self.queue.drain(..)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Dispatcher for Outbox {
    fn forward_to_worker(&mut self, service: &str, msg: &Multipart, target: &WorkerTarget) {
        let mut primary = msg.clone();
        if target.tagged {
            primary.push_front(Bytes::from_static(ROLE_MASTER));
        }
        primary.push_front(Bytes::copy_from_slice(target.master.as_bytes()));
        debug!("Dispatching {} request to {}", service, target.master);
        self.metrics
            .dispatch_total
            .with_label_values(&[service, "master"])
            .inc();
        self.push(SocketRole::Worker, primary);

        if let Some(slave) = &target.slave {
            // The mirror gets its own buffers
            let mut mirror = msg.deep_copy();
            mirror.push_front(Bytes::from_static(ROLE_SLAVE));
            mirror.push_front(Bytes::copy_from_slice(slave.as_bytes()));
            debug!("Mirroring {} request to {}", service, slave);
            self.metrics
                .dispatch_total
                .with_label_values(&[service, "slave"])
                .inc();
            self.push(SocketRole::Worker, mirror);
        }
    }

    fn reply_to_worker(&mut self, msg: Multipart) {
        self.push(SocketRole::Worker, msg);
    }
}

/// Result of routing one request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Bindings the request was dispatched to
    pub forwarded: usize,
    /// Matched bindings the hosting application must handle
    pub internal: usize,
}

/// Routing state summary
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RouteStats {
    pub rules: usize,
    pub services: usize,
    pub endpoints: usize,
    pub sessions: usize,
}

/// Routing decision installed into the broker
pub trait RoutingCallback: Send {
    /// Route a client request whose envelope carries `uri`
    fn route(
        &mut self,
        dispatcher: &mut dyn Dispatcher,
        msg: &Multipart,
        uri: &RequestUri,
    ) -> Result<RouteOutcome>;

    /// Handle a worker control message (`[identity][empty][header][payload...]`)
    fn service_request(&mut self, dispatcher: &mut dyn Dispatcher, msg: Multipart)
        -> Result<RouteOutcome>;

    fn stats(&self) -> RouteStats;
}

/// Receives every message the broker could not fully handle
pub trait ApplicationHandler: Send {
    fn on_message(&mut self, role: SocketRole, msg: &Multipart);
}

/// Broker state summary, logged periodically
#[derive(Clone, Debug, Serialize)]
pub struct BrokerStats {
    pub clients: usize,
    pub pending: usize,
    pub routes: RouteStats,
}

/// Thread-confined message broker
pub struct Broker {
    sockets: BTreeMap<SocketRole, SocketConfig>,
    clients: ClientRegistry,
    outbox: Outbox,
    router: Option<Box<dyn RoutingCallback>>,
    app: Option<Box<dyn ApplicationHandler>>,
    metrics: BrokerMetrics,
}

impl Broker {
    pub fn new(metrics: BrokerMetrics) -> Self {
        Self {
            sockets: BTreeMap::new(),
            clients: ClientRegistry::new(),
            outbox: Outbox::new(metrics.clone()),
            router: None,
            app: None,
            metrics,
        }
    }

    /// Set the client and worker sockets. Repeating the call with the same
    /// sockets is a no-op.
    pub fn configure(&mut self, client: SocketConfig, worker: SocketConfig) -> Result<()> {
        if client.uri.is_empty() || worker.uri.is_empty() {
            return Err(CoreError::InvalidArgument(
                "client and worker uri must not be empty".to_string(),
            ));
        }

        match (
            self.sockets.get(&SocketRole::Client),
            self.sockets.get(&SocketRole::Worker),
        ) {
            (Some(c), Some(w)) if *c == client && *w == worker => return Ok(()),
            (None, None) => {}
            _ => {
                return Err(CoreError::AlreadyExists(
                    "broker sockets already configured".to_string(),
                ))
            }
        }

        info!(
            "Broker sockets: client {} ({:?}), worker {} ({:?})",
            client.uri, client.kind, worker.uri, worker.kind
        );
        self.sockets.insert(SocketRole::Client, client);
        self.sockets.insert(SocketRole::Worker, worker);
        Ok(())
    }

    /// Add the telemetry socket and the callback address advertised in
    /// every forwarded request
    pub fn set_distribute_info(&mut self, socket: SocketConfig, ipaddr: &str, port: u16) -> Result<()> {
        if socket.uri.is_empty() {
            return Err(CoreError::InvalidArgument(
                "distribute uri must not be empty".to_string(),
            ));
        }
        if let Some(existing) = self.sockets.get(&SocketRole::Distribute) {
            if *existing != socket {
                return Err(CoreError::AlreadyExists(
                    "distribute socket already configured".to_string(),
                ));
            }
        }

        info!(
            "Broker distribute socket {} advertised as {}:{}",
            socket.uri, ipaddr, port
        );
        self.sockets.insert(SocketRole::Distribute, socket);
        self.clients.set_distribute_address(ipaddr, port);
        Ok(())
    }

    pub fn socket(&self, role: SocketRole) -> Option<&SocketConfig> {
        self.sockets.get(&role)
    }

    pub fn sockets(&self) -> impl Iterator<Item = (SocketRole, &SocketConfig)> {
        self.sockets.iter().map(|(role, socket)| (*role, socket))
    }

    /// Install the routing callback, returning the previous one
    pub fn set_routing_callback(
        &mut self,
        router: Box<dyn RoutingCallback>,
    ) -> Option<Box<dyn RoutingCallback>> {
        self.router.replace(router)
    }

    /// Install the application fallback handler, returning the previous one
    pub fn set_application_handler(
        &mut self,
        app: Box<dyn ApplicationHandler>,
    ) -> Option<Box<dyn ApplicationHandler>> {
        self.app.replace(app)
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn metrics(&self) -> &BrokerMetrics {
        &self.metrics
    }

    /// Handle one inbound message. Returns false when the message was handed
    /// to the application handler instead of being fully routed.
    pub fn on_message(&mut self, role: SocketRole, msg: Multipart) -> bool {
        self.metrics
            .messages_total
            .with_label_values(&[role.as_str()])
            .inc();

        let raw = msg.clone();
        let result = match role {
            SocketRole::Client => self.forward_from_client(msg),
            SocketRole::Worker => self.forward_from_worker(msg),
            SocketRole::Distribute => self.relay_telemetry(msg).map(|_| RouteOutcome::default()),
        };

        match result {
            Ok(outcome) if outcome.internal == 0 => true,
            Ok(outcome) => {
                debug!(
                    "{} message matched {} internal services",
                    role, outcome.internal
                );
                self.fall_back(role, &raw, "internal");
                false
            }
            Err(e) => {
                warn!("{} message not routed: {}", role, e);
                self.fall_back(role, &raw, e.kind());
                false
            }
        }
    }

    fn fall_back(&mut self, role: SocketRole, raw: &Multipart, reason: &str) {
        self.metrics
            .fallback_total
            .with_label_values(&[reason])
            .inc();
        match self.app.as_mut() {
            Some(app) => app.on_message(role, raw),
            None => debug!("No application handler, dropping {} message", role),
        }
    }

    /// Record the client, stamp the request URI with callback metadata and
    /// route it
    pub fn forward_from_client(&mut self, mut msg: Multipart) -> Result<RouteOutcome> {
        if !self.sockets.contains_key(&SocketRole::Worker) {
            return Err(CoreError::Unavailable("broker not configured".to_string()));
        }
        let identity = msg
            .identity()
            .ok_or_else(|| CoreError::Malformed("empty client message".to_string()))?;
        if identity.is_empty() {
            self.handle_upstream_control(&msg)?;
            return Ok(RouteOutcome::default());
        }
        self.clients.add(identity.clone());

        let index = msg
            .body_start()
            .ok_or_else(|| CoreError::Malformed("client message without body".to_string()))?;
        let mut envelope = Envelope::decode(&msg.frames()[index])?;
        let mut uri = envelope.request_uri()?;

        if let Some((ipaddr, port)) = self.clients.distribute_address() {
            uri.add_query_bytes(QUERY_CLIENT_IDENTITY, identity.as_bytes())?;
            uri.add_query(QUERY_ISSUED_IPADDR, ipaddr)?;
            uri.add_query(QUERY_ISSUED_PORT, &port.to_string())?;
            uri.add_query(QUERY_START_TIME, &Utc::now().timestamp_millis().to_string())?;
            envelope.set_uri(&uri);
            msg.set_frame(index, envelope.encode()?)?;
        }

        let router = self
            .router
            .as_mut()
            .ok_or_else(|| CoreError::Unavailable("no routing callback".to_string()))?;
        router.route(&mut self.outbox, &msg, &uri)
    }

    /// Relay a telemetry message to the client named in its URI, adding the
    /// elapsed processing time. Unknown clients are rejected.
    pub fn relay_telemetry(&mut self, mut msg: Multipart) -> Result<()> {
        if !self.sockets.contains_key(&SocketRole::Distribute) {
            return Err(CoreError::Unavailable(
                "distribute socket not configured".to_string(),
            ));
        }
        let index = msg
            .body_start()
            .ok_or_else(|| CoreError::Malformed("telemetry message without body".to_string()))?;
        let mut envelope = Envelope::decode(&msg.frames()[index])?;
        let mut uri = envelope.request_uri()?;

        let identity = uri
            .query_bytes(QUERY_CLIENT_IDENTITY)
            .or_else(|| uri.query_bytes(QUERY_LEGACY_IDENTITY))
            .map(Identity::new)
            .filter(|id| !id.is_empty());
        let identity = match identity {
            Some(id) if self.clients.contains(&id) => id,
            other => {
                self.metrics
                    .telemetry_total
                    .with_label_values(&["rejected"])
                    .inc();
                return Err(CoreError::NotFound(format!(
                    "telemetry for unknown client {}",
                    other.map(|id| id.to_string()).unwrap_or_default()
                )));
            }
        };

        match uri
            .query_value(QUERY_START_TIME)
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|start| Utc::now().timestamp_millis().checked_sub(start))
        {
            Some(elapsed) => {
                let elapsed = elapsed.max(0);
                uri.add_query(QUERY_PROCESSING_TIME, &elapsed.to_string())?;
                self.metrics.processing_time_ms.observe(elapsed as f64);
                envelope.set_uri(&uri);
                msg.set_frame(index, envelope.encode()?)?;
            }
            None => debug!("Telemetry for {} carries no usable start time", identity),
        }

        msg.set_frame(0, identity.as_bytes().to_vec())?;
        self.metrics
            .telemetry_total
            .with_label_values(&["relayed"])
            .inc();
        self.outbox.push(SocketRole::Client, msg);
        Ok(())
    }

    /// Forward a request to a worker endpoint
    pub fn forward_to_worker(&mut self, service: &str, msg: &Multipart, target: &WorkerTarget) {
        self.outbox.forward_to_worker(service, msg, target);
    }

    /// Handle a message from the worker socket: control frames go to the
    /// routing callback, anything else is a reply already addressed to a
    /// client
    pub fn forward_from_worker(&mut self, msg: Multipart) -> Result<RouteOutcome> {
        if msg.len() < 2 {
            return Err(CoreError::Malformed(format!(
                "worker message with {} frames",
                msg.len()
            )));
        }

        if msg.frames()[1].is_empty() {
            let router = self
                .router
                .as_mut()
                .ok_or_else(|| CoreError::Unavailable("no routing callback".to_string()))?;
            return router.service_request(&mut self.outbox, msg);
        }

        // [worker][client][empty][reply...]
        self.outbox.push(SocketRole::Client, msg.tail(1));
        Ok(RouteOutcome::default())
    }

    /// Register this broker as a worker of an upstream broker reached
    /// through the (dealer) client socket
    pub fn register_upstream(&mut self, service_name: &str) -> Result<()> {
        let client = self
            .sockets
            .get(&SocketRole::Client)
            .ok_or_else(|| CoreError::Unavailable("broker not configured".to_string()))?;
        if client.kind != SocketKind::Dealer {
            return Err(CoreError::InvalidArgument(
                "upstream registration needs a dealer client socket".to_string(),
            ));
        }
        if service_name.is_empty() {
            return Err(CoreError::InvalidArgument("empty service name".to_string()));
        }

        let mut msg = Multipart::new();
        msg.push(Bytes::new());
        msg.push(encode_control_header(ServiceMsgType::Register));
        msg.push(RegisterInfo::new(service_name, 0).encode());
        info!("Registering upstream as {} via {}", service_name, client.uri);
        self.outbox.push(SocketRole::Client, msg);
        Ok(())
    }

    // [empty][header][payload] arriving on a dealer client socket
    fn handle_upstream_control(&mut self, msg: &Multipart) -> Result<()> {
        let header = msg
            .frame(1)
            .ok_or_else(|| CoreError::Malformed("upstream control without header".to_string()))?;
        match decode_control_header(header)? {
            ServiceMsgType::Reply => {
                let result = msg
                    .frame(2)
                    .map(|f| decode_reply(f))
                    .transpose()?
                    .unwrap_or_default();
                if result == 0 {
                    info!("Upstream registration acknowledged");
                } else {
                    warn!("Upstream registration rejected with {}", result);
                }
            }
            other => debug!("Ignoring upstream control message {:?}", other),
        }
        Ok(())
    }

    /// Take every queued outbound message
    pub fn take_outbound(&mut self) -> Vec<(SocketRole, Multipart)> {
        self.outbox.drain().collect()
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            clients: self.clients.len(),
            pending: self.outbox.len(),
            routes: self.router.as_ref().map(|r| r.stats()).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{encode_reply, ContentHeader};
    use std::sync::{Arc, Mutex};

    /// Routes everything to W1 and records what it saw
    #[derive(Default)]
    struct RecordingRouter {
        uris: Arc<Mutex<Vec<String>>>,
        internal: usize,
    }

    impl RoutingCallback for RecordingRouter {
        fn route(
            &mut self,
            dispatcher: &mut dyn Dispatcher,
            msg: &Multipart,
            uri: &RequestUri,
        ) -> Result<RouteOutcome> {
            self.uris.lock().unwrap().push(uri.to_string());
            dispatcher.forward_to_worker("svc", msg, &WorkerTarget::single(Identity::from("W1")));
            Ok(RouteOutcome {
                forwarded: 1,
                internal: self.internal,
            })
        }

        fn service_request(
            &mut self,
            _dispatcher: &mut dyn Dispatcher,
            _msg: Multipart,
        ) -> Result<RouteOutcome> {
            Err(CoreError::NotFound("no route".to_string()))
        }

        fn stats(&self) -> RouteStats {
            RouteStats::default()
        }
    }

    #[derive(Default)]
    struct CollectingApp {
        seen: Arc<Mutex<Vec<(SocketRole, Multipart)>>>,
    }

    impl ApplicationHandler for CollectingApp {
        fn on_message(&mut self, role: SocketRole, msg: &Multipart) {
            self.seen.lock().unwrap().push((role, msg.clone()));
        }
    }

    fn envelope_frame(uri: &str) -> Bytes {
        Envelope::new(uri, ContentHeader::default(), Bytes::from_static(b"body"))
            .encode()
            .unwrap()
    }

    fn client_msg(identity: &str, uri: &str) -> Multipart {
        let mut msg = Multipart::new();
        msg.push(identity.as_bytes().to_vec());
        msg.push(Bytes::new());
        msg.push(envelope_frame(uri));
        msg
    }

    fn broker() -> Broker {
        let mut broker = Broker::new(BrokerMetrics::new().unwrap());
        broker
            .configure(
                SocketConfig::new("tcp://*:5555", SocketKind::Router),
                SocketConfig::new("tcp://*:5556", SocketKind::Router),
            )
            .unwrap();
        broker
    }

    fn uri_of(msg: &Multipart, index: usize) -> RequestUri {
        Envelope::decode(&msg.frames()[index])
            .unwrap()
            .request_uri()
            .unwrap()
    }

    #[test]
    fn test_configure_validation_and_idempotence() {
        let mut broker = Broker::new(BrokerMetrics::new().unwrap());
        let client = SocketConfig::new("tcp://*:5555", SocketKind::Router);
        let worker = SocketConfig::new("tcp://*:5556", SocketKind::Router);

        assert!(matches!(
            broker.configure(SocketConfig::new("", SocketKind::Router), worker.clone()),
            Err(CoreError::InvalidArgument(_))
        ));
        broker.configure(client.clone(), worker.clone()).unwrap();
        broker.configure(client.clone(), worker).unwrap();
        assert!(matches!(
            broker.configure(client, SocketConfig::new("tcp://*:7000", SocketKind::Router)),
            Err(CoreError::AlreadyExists(_))
        ));
        assert_eq!(broker.sockets().count(), 2);
    }

    #[test]
    fn test_unconfigured_broker_falls_back() {
        let mut broker = Broker::new(BrokerMetrics::new().unwrap());
        let app = CollectingApp::default();
        let seen = app.seen.clone();
        broker.set_application_handler(Box::new(app));

        let msg = client_msg("C1", "ztcp://host/update?vid=1");
        assert!(!broker.on_message(SocketRole::Client, msg.clone()));
        assert_eq!(seen.lock().unwrap()[0], (SocketRole::Client, msg));
        assert!(broker.take_outbound().is_empty());
    }

    #[test]
    fn test_client_request_is_stamped_when_distributing() {
        let mut broker = broker();
        broker
            .set_distribute_info(SocketConfig::new("tcp://*:6000", SocketKind::Router), "10.0.0.4", 6000)
            .unwrap();
        let router = RecordingRouter::default();
        let uris = router.uris.clone();
        broker.set_routing_callback(Box::new(router));

        assert!(broker.on_message(SocketRole::Client, client_msg("C1", "ztcp://host/update?vid=1")));
        assert!(broker.clients().contains(&Identity::from("C1")));

        let out = broker.take_outbound();
        assert_eq!(out.len(), 1);
        let (role, sent) = &out[0];
        assert_eq!(*role, SocketRole::Worker);
        assert_eq!(sent.frames()[0].as_ref(), b"W1");
        assert_eq!(sent.frames()[1].as_ref(), b"C1");

        let uri = uri_of(sent, 3);
        assert_eq!(uri.query_value("vid").as_deref(), Some("1"));
        assert_eq!(uri.query_value(QUERY_CLIENT_IDENTITY).as_deref(), Some("C1"));
        assert_eq!(uri.query_value(QUERY_ISSUED_IPADDR).as_deref(), Some("10.0.0.4"));
        assert_eq!(uri.query_value(QUERY_ISSUED_PORT).as_deref(), Some("6000"));
        assert!(uri.query_value(QUERY_START_TIME).is_some());
        assert_eq!(uris.lock().unwrap()[0], uri.to_string());

        // Payload after the content header survives the rewrite
        let envelope = Envelope::decode(&sent.frames()[3]).unwrap();
        assert_eq!(envelope.payload.as_ref(), b"body");
    }

    #[test]
    fn test_client_request_untouched_without_distribute() {
        let mut broker = broker();
        broker.set_routing_callback(Box::new(RecordingRouter::default()));
        assert!(broker.on_message(SocketRole::Client, client_msg("C1", "ztcp://host/update?vid=1")));

        let out = broker.take_outbound();
        assert_eq!(uri_of(&out[0].1, 3).to_string(), "ztcp://host/update?vid=1");
    }

    #[test]
    fn test_internal_services_reach_application() {
        let mut broker = broker();
        broker.set_routing_callback(Box::new(RecordingRouter {
            internal: 1,
            ..Default::default()
        }));
        let app = CollectingApp::default();
        let seen = app.seen.clone();
        broker.set_application_handler(Box::new(app));

        let msg = client_msg("C1", "ztcp://host/update?vid=1");
        assert!(!broker.on_message(SocketRole::Client, msg.clone()));
        // The application sees the unmodified message
        assert_eq!(seen.lock().unwrap()[0].1, msg);
        assert_eq!(broker.take_outbound().len(), 1);
    }

    #[test]
    fn test_worker_reply_relayed_to_client() {
        let mut broker = broker();
        let mut reply = Multipart::new();
        reply.push(Bytes::from_static(b"W1"));
        reply.push(Bytes::from_static(b"C1"));
        reply.push(Bytes::new());
        reply.push(Bytes::from_static(b"result"));

        assert!(broker.on_message(SocketRole::Worker, reply));
        let out = broker.take_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, SocketRole::Client);
        let frames: Vec<&[u8]> = out[0].1.frames().iter().map(|f| f.as_ref()).collect();
        assert_eq!(frames, vec![&b"C1"[..], &b""[..], &b"result"[..]]);
    }

    #[test]
    fn test_worker_message_too_short() {
        let mut broker = broker();
        let mut msg = Multipart::new();
        msg.push(Bytes::from_static(b"W1"));
        assert!(matches!(
            broker.forward_from_worker(msg),
            Err(CoreError::Malformed(_))
        ));
    }

    #[test]
    fn test_telemetry_relay() {
        let mut broker = broker();
        broker
            .set_distribute_info(SocketConfig::new("tcp://*:6000", SocketKind::Router), "10.0.0.4", 6000)
            .unwrap();
        broker.set_routing_callback(Box::new(RecordingRouter::default()));
        broker.on_message(SocketRole::Client, client_msg("C1", "ztcp://host/update?vid=1"));
        broker.take_outbound();

        let start = Utc::now().timestamp_millis() - 40;
        let uri = format!("ztcp://host/update?cli_identity=C1&start_time={}", start);
        assert!(broker.on_message(SocketRole::Distribute, client_msg("S9", &uri)));

        let out = broker.take_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, SocketRole::Client);
        assert_eq!(out[0].1.frames()[0].as_ref(), b"C1");
        let relayed = uri_of(&out[0].1, 2);
        let elapsed: i64 = relayed
            .query_value(QUERY_PROCESSING_TIME)
            .unwrap()
            .parse()
            .unwrap();
        assert!(elapsed >= 40);
    }

    #[test]
    fn test_telemetry_with_out_of_range_start_time() {
        let mut broker = broker();
        broker
            .set_distribute_info(SocketConfig::new("tcp://*:6000", SocketKind::Router), "h", 6000)
            .unwrap();
        broker.set_routing_callback(Box::new(RecordingRouter::default()));
        broker.on_message(SocketRole::Client, client_msg("C1", "ztcp://host/update"));
        broker.take_outbound();

        let uri = format!("ztcp://host/update?cli_identity=C1&start_time={}", i64::MIN);
        assert!(broker.on_message(SocketRole::Distribute, client_msg("S9", &uri)));

        // Relayed without a processing time
        let out = broker.take_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.frames()[0].as_ref(), b"C1");
        assert!(uri_of(&out[0].1, 2).query_value(QUERY_PROCESSING_TIME).is_none());
    }

    #[test]
    fn test_telemetry_accepts_legacy_identity_key() {
        let mut broker = broker();
        broker
            .set_distribute_info(SocketConfig::new("tcp://*:6000", SocketKind::Router), "h", 6000)
            .unwrap();
        broker.set_routing_callback(Box::new(RecordingRouter::default()));
        broker.on_message(SocketRole::Client, client_msg("C1", "ztcp://host/update"));
        broker.take_outbound();

        broker
            .relay_telemetry(client_msg("S9", "ztcp://host/update?identity=C1"))
            .unwrap();
        assert_eq!(broker.take_outbound()[0].1.frames()[0].as_ref(), b"C1");
    }

    #[test]
    fn test_telemetry_for_unknown_client_is_rejected() {
        let mut broker = broker();
        broker
            .set_distribute_info(SocketConfig::new("tcp://*:6000", SocketKind::Router), "h", 6000)
            .unwrap();

        let msg = client_msg("S9", "ztcp://host/update?cli_identity=C404&start_time=1");
        assert!(matches!(
            broker.relay_telemetry(msg.clone()),
            Err(CoreError::NotFound(_))
        ));
        assert!(!broker.on_message(SocketRole::Distribute, msg));
        assert!(broker.take_outbound().is_empty());
    }

    #[test]
    fn test_redundant_dispatch_tags_and_copies() {
        let mut broker = broker();
        let msg = client_msg("C1", "ztcp://host/update?vid=1");
        let target = WorkerTarget::redundant(Identity::from("W1"), Some(Identity::from("W2")));
        broker.forward_to_worker("snapshot", &msg, &target);

        let out = broker.take_outbound();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].1.frames()[0].as_ref(), b"W1");
        assert_eq!(out[0].1.frames()[1].as_ref(), ROLE_MASTER);
        assert_eq!(out[1].1.frames()[0].as_ref(), b"W2");
        assert_eq!(out[1].1.frames()[1].as_ref(), ROLE_SLAVE);
        assert_eq!(out[0].1.tail(2), msg);
        assert_eq!(out[1].1.tail(2), msg);
        assert_ne!(out[1].1.frames()[4].as_ptr(), msg.frames()[2].as_ptr());
    }

    #[test]
    fn test_upstream_registration() {
        let mut broker = Broker::new(BrokerMetrics::new().unwrap());
        broker
            .configure(
                SocketConfig::new("tcp://lb:5556", SocketKind::Dealer),
                SocketConfig::new("tcp://*:5557", SocketKind::Router),
            )
            .unwrap();
        broker.register_upstream("indexing-service").unwrap();

        let out = broker.take_outbound();
        assert_eq!(out[0].0, SocketRole::Client);
        let frames = out[0].1.frames();
        assert!(frames[0].is_empty());
        assert_eq!(decode_control_header(&frames[1]).unwrap(), ServiceMsgType::Register);
        assert_eq!(
            RegisterInfo::decode(&frames[2]).unwrap(),
            RegisterInfo::new("indexing-service", 0)
        );

        // The acknowledgement is consumed, not routed
        let mut ack = Multipart::new();
        ack.push(Bytes::new());
        ack.push(encode_control_header(ServiceMsgType::Reply));
        ack.push(encode_reply(0));
        assert!(broker.on_message(SocketRole::Client, ack));
        assert!(broker.take_outbound().is_empty());
    }

    #[test]
    fn test_upstream_registration_needs_dealer() {
        let mut broker = broker();
        assert!(matches!(
            broker.register_upstream("indexing-service"),
            Err(CoreError::InvalidArgument(_))
        ));
    }
}
