use anyhow::{Context, Result};
use broker_api::BrokerConfig;
use broker_proxy::{
    ApplicationHandler, Arbitrator, Broker, BrokerFacade, BrokerMetrics, Multipart, SocketRole,
    VehicleDirectory,
};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

mod transport;

use transport::ZmqTransport;

/// Path of the YAML configuration document
const CONFIG_ENV: &str = "EDGE_BROKER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "edge-broker.yaml";
/// Set to 1 for JSON log lines
const LOG_JSON_ENV: &str = "EDGE_BROKER_LOG_JSON";

/// Internal services are handled by the hosting service; the standalone
/// daemon only records them
struct InternalServiceLog;

impl ApplicationHandler for InternalServiceLog {
    fn on_message(&mut self, role: SocketRole, msg: &Multipart) {
        debug!("Unrouted {} message with {} frames", role, msg.len());
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_JSON_ENV).map(|v| v == "1").unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting edge-broker...");

    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = match BrokerConfig::from_path(&path) {
        Ok(config) => config,
        Err(e) => {
            error!("Cannot load configuration: {}", e);
            return Err(e).with_context(|| format!("loading {}", path));
        }
    };
    info!(
        "Configuration loaded from {} ({} route rules)",
        path,
        config.route_rules.len()
    );

    let metrics = BrokerMetrics::new()?;
    let mut broker = Broker::new(metrics.clone());
    broker.set_application_handler(Box::new(InternalServiceLog));
    Arbitrator::from_config(&config, metrics.clone())
        .with_resolver(Box::new(VehicleDirectory::new()))
        .install(&mut broker, &config)?;
    info!("Arbitrator installed");

    let sockets = broker
        .sockets()
        .map(|(role, socket)| (role, socket.clone()))
        .collect();
    let transport = ZmqTransport::open(sockets).await?;

    let mut facade = BrokerFacade::new(broker, transport);
    facade
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    info!("Broker stopped, exiting...");
    debug!("Final metrics:\n{}", metrics.gather()?);
    Ok(())
}
