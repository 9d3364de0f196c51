//! Arbitrator: routing decisions and the worker control protocol
//!
//! Owns the route table, the endpoint registry and the sticky sessions of
//! every binding. One request may fan out to several services; a failure on
//! one binding is logged and does not stop the others.

use crate::broker::{Broker, Dispatcher, RouteOutcome, RouteStats, RoutingCallback, WorkerTarget};
use crate::metrics::BrokerMetrics;
use crate::resolver::KeyResolver;
use crate::wire::{
    decode_control_header, encode_control_header, encode_reply, Envelope, Multipart, RegisterInfo,
    ServiceMsgType,
};
use broker_api::BrokerConfig;
use broker_core::{
    CoreError, EndpointRegistry, Identity, RequestUri, Result, RouteTable, ServiceBinding,
};
use tracing::{debug, info, warn};

pub struct Arbitrator {
    routes: RouteTable,
    registry: EndpointRegistry,
    resolver: Option<Box<dyn KeyResolver>>,
    redundant: bool,
    metrics: BrokerMetrics,
}

impl Arbitrator {
    pub fn from_config(config: &BrokerConfig, metrics: BrokerMetrics) -> Self {
        let routes = RouteTable::from_rules(&config.route_rules);
        info!(
            "Loaded {} routes for {} services (redundant: {})",
            routes.len(),
            config.services.len(),
            config.redundant
        );
        Self {
            routes,
            registry: EndpointRegistry::new(config.services.clone()),
            resolver: None,
            redundant: config.redundant,
            metrics,
        }
    }

    /// Set the resolver used by rewriting bindings
    pub fn with_resolver(mut self, resolver: Box<dyn KeyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Configure the broker's sockets from `config` and install this
    /// arbitrator as its routing callback
    pub fn install(self, broker: &mut Broker, config: &BrokerConfig) -> Result<()> {
        broker.configure(config.client.clone(), config.worker.clone())?;
        if let Some(distribute) = &config.distribute {
            broker.set_distribute_info(distribute.socket(), &distribute.ipaddr, distribute.port)?;
        }
        broker.set_routing_callback(Box::new(self));
        if config.upstream_registration {
            broker.register_upstream(&config.service_name)?;
        }
        Ok(())
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut EndpointRegistry {
        &mut self.registry
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    fn handle_register(&mut self, worker: &Identity, info: &RegisterInfo) -> Result<()> {
        self.registry
            .add_endpoint(&info.service_name, worker.clone(), info.capacity_hint)?;
        self.metrics
            .registrations_total
            .with_label_values(&[&info.service_name])
            .inc();
        Ok(())
    }
}

// Allocate for one binding and dispatch. Ok(false) means the request does
// not carry the binding's keyword and the binding was skipped.
fn dispatch_binding(
    registry: &mut EndpointRegistry,
    resolver: Option<&dyn KeyResolver>,
    redundant: bool,
    binding: &mut ServiceBinding,
    dispatcher: &mut dyn Dispatcher,
    msg: &Multipart,
    uri: &RequestUri,
) -> Result<bool> {
    let service = binding.name.clone();

    let (target, keyword) = match binding.keyword.clone() {
        None => (
            WorkerTarget::single(registry.allocate_least_loaded(&service)?),
            None,
        ),
        Some(keyword) => {
            let entity = match uri.query_value(&keyword).filter(|v| !v.is_empty()) {
                Some(entity) => entity,
                None => {
                    debug!("Request for {} has no {}", service, keyword);
                    return Ok(false);
                }
            };
            let session = binding.session_mut(&entity);
            session.ensure_live_allocation(registry, &service, redundant)?;
            let master = session
                .master_identity()
                .cloned()
                .ok_or_else(|| CoreError::Internal(format!("session {} has no master", entity)))?;
            let target = if redundant {
                WorkerTarget::redundant(master, session.slave_identity().cloned())
            } else {
                WorkerTarget::single(master)
            };
            (target, Some(keyword))
        }
    };

    match keyword.filter(|_| binding.rewrite_on_dispatch) {
        Some(keyword) => {
            let resolver = resolver.ok_or_else(|| {
                CoreError::Unavailable(format!("no key resolver for {}", service))
            })?;
            let rewritten = rewrite_entity(msg, &keyword, resolver)?;
            dispatcher.forward_to_worker(&service, &rewritten, &target);
        }
        None => dispatcher.forward_to_worker(&service, msg, &target),
    }
    Ok(true)
}

// Copy `msg` with the keyword's token replaced by the resolved key
fn rewrite_entity(msg: &Multipart, keyword: &str, resolver: &dyn KeyResolver) -> Result<Multipart> {
    let mut copy = msg.deep_copy();
    let index = copy
        .body_start()
        .ok_or_else(|| CoreError::Malformed("request without body".to_string()))?;
    let mut envelope = Envelope::decode(&copy.frames()[index])?;
    let mut uri = envelope.request_uri()?;
    let token = uri
        .query_value(keyword)
        .ok_or_else(|| CoreError::NotFound(format!("query parameter {}", keyword)))?;
    let key = resolver.resolve(&token)?;
    uri.change_query(keyword, &key)?;
    envelope.set_uri(&uri);
    copy.set_frame(index, envelope.encode()?)?;
    Ok(copy)
}

impl RoutingCallback for Arbitrator {
    fn route(
        &mut self,
        dispatcher: &mut dyn Dispatcher,
        msg: &Multipart,
        uri: &RequestUri,
    ) -> Result<RouteOutcome> {
        let url_name = uri
            .url_name()
            .ok_or_else(|| CoreError::InvalidArgument(format!("no route segment in {}", uri)))?;
        let rule = self.routes.lookup_mut(url_name)?;

        let mut outcome = RouteOutcome {
            forwarded: 0,
            internal: rule.internal_count(),
        };
        for binding in rule.bindings.iter_mut().filter(|b| b.is_forward()) {
            let name = binding.name.clone();
            match dispatch_binding(
                &mut self.registry,
                self.resolver.as_deref(),
                self.redundant,
                binding,
                dispatcher,
                msg,
                uri,
            ) {
                Ok(true) => outcome.forwarded += 1,
                Ok(false) => {}
                Err(e) => warn!("Dispatch of {} to {} failed: {}", url_name, name, e),
            }
        }

        debug!(
            "Routed {}: {} forwarded, {} internal",
            url_name, outcome.forwarded, outcome.internal
        );
        Ok(outcome)
    }

    fn service_request(
        &mut self,
        dispatcher: &mut dyn Dispatcher,
        mut msg: Multipart,
    ) -> Result<RouteOutcome> {
        let worker = msg
            .identity()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CoreError::InvalidArgument("control message without identity".to_string()))?;
        let index = msg
            .body_start()
            .ok_or_else(|| CoreError::Malformed("control message without header".to_string()))?;
        let msg_type = decode_control_header(&msg.frames()[index])?;

        match msg_type {
            ServiceMsgType::Request => {
                msg.remove(index)?;
                let frame = msg
                    .frame(index)
                    .ok_or_else(|| CoreError::Malformed("request without envelope".to_string()))?;
                let uri = Envelope::decode(frame)?.request_uri()?;
                debug!("Worker {} requests {}", worker, uri);
                self.route(dispatcher, &msg, &uri)
            }
            ServiceMsgType::Register | ServiceMsgType::Deregister => {
                let frame = msg
                    .frame(index + 1)
                    .ok_or_else(|| CoreError::Malformed("control message without info".to_string()))?;
                let info = RegisterInfo::decode(frame)?;
                let result = if msg_type == ServiceMsgType::Register {
                    self.handle_register(&worker, &info)
                } else {
                    self.registry
                        .remove_endpoint(&info.service_name, &worker)
                        .map(|_| ())
                };
                if let Err(e) = &result {
                    warn!(
                        "{:?} of {} for {} failed: {}",
                        msg_type, worker, info.service_name, e
                    );
                }

                // Acknowledge on the frames that carried the request
                let code = result.as_ref().map(|_| 0).unwrap_or_else(CoreError::code);
                msg.set_frame(index, encode_control_header(ServiceMsgType::Reply))?;
                msg.set_frame(index + 1, encode_reply(code))?;
                msg.truncate(index + 2);
                dispatcher.reply_to_worker(msg);
                Ok(RouteOutcome::default())
            }
            ServiceMsgType::Heartbeat => {
                let frame = msg
                    .frame(index + 1)
                    .ok_or_else(|| CoreError::Malformed("heartbeat without info".to_string()))?;
                let info = RegisterInfo::decode(frame)?;
                self.registry.touch(&info.service_name, &worker)?;
                debug!("Heartbeat from {} for {}", worker, info.service_name);
                Ok(RouteOutcome::default())
            }
            other => Err(CoreError::InvalidArgument(format!(
                "unsupported control message {:?}",
                other
            ))),
        }
    }

    fn stats(&self) -> RouteStats {
        RouteStats {
            rules: self.routes.len(),
            services: self.registry.service_count(),
            endpoints: self.registry.endpoint_total(),
            sessions: self
                .routes
                .rules()
                .flat_map(|rule| rule.bindings.iter())
                .map(ServiceBinding::session_count)
                .sum(),
        }
    }
}
