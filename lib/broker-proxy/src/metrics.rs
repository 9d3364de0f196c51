//! Prometheus metrics for the broker

use anyhow::Result;
use prometheus::{CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus metrics collector for broker traffic
#[derive(Clone)]
pub struct BrokerMetrics {
    /// Inbound messages by socket
    pub messages_total: CounterVec,
    /// Messages sent to worker endpoints by service and role
    pub dispatch_total: CounterVec,
    /// Messages handed to the application handler by reason
    pub fallback_total: CounterVec,
    /// Worker registrations by service
    pub registrations_total: CounterVec,
    /// Telemetry relays by outcome
    pub telemetry_total: CounterVec,
    /// Relayed end-to-end processing time in milliseconds
    pub processing_time_ms: Histogram,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl BrokerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let messages_total = CounterVec::new(
            Opts::new("broker_messages_total", "Inbound messages by socket"),
            &["socket"],
        )?;

        let dispatch_total = CounterVec::new(
            Opts::new("broker_dispatch_total", "Messages dispatched to worker endpoints"),
            &["service", "role"],
        )?;

        let fallback_total = CounterVec::new(
            Opts::new(
                "broker_fallback_total",
                "Messages delivered to the application handler",
            ),
            &["reason"],
        )?;

        let registrations_total = CounterVec::new(
            Opts::new("broker_registrations_total", "Worker endpoint registrations"),
            &["service"],
        )?;

        let telemetry_total = CounterVec::new(
            Opts::new("broker_telemetry_total", "Telemetry relays by outcome"),
            &["outcome"],
        )?;

        let processing_time_ms = Histogram::with_opts(
            HistogramOpts::new(
                "broker_processing_time_ms",
                "End-to-end processing time reported through telemetry",
            )
            .buckets(vec![
                1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
            ]),
        )?;

        registry.register(Box::new(messages_total.clone()))?;
        registry.register(Box::new(dispatch_total.clone()))?;
        registry.register(Box::new(fallback_total.clone()))?;
        registry.register(Box::new(registrations_total.clone()))?;
        registry.register(Box::new(telemetry_total.clone()))?;
        registry.register(Box::new(processing_time_ms.clone()))?;

        Ok(Self {
            messages_total,
            dispatch_total,
            fallback_total,
            registrations_total,
            telemetry_total,
            processing_time_ms,
            registry,
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
