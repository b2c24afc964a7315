use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use log::info;
use parking_lot::Mutex;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tokio::{net::TcpListener, sync::watch, time::Instant};

use crate::record::FlowRecord;

const FLOW_LABELS: [&str; 7] = [
    "namespace",
    "name",
    "source",
    "destination",
    "protocol",
    "port",
    "direction",
];
const CONNECTION_LABELS: [&str; 6] = [
    "namespace",
    "name",
    "source",
    "destination",
    "protocol",
    "port",
];

/// Flow and pipeline metrics held in a registry owned by this value.
pub struct Metrics {
    registry: Registry,
    bytes: IntCounterVec,
    packets: IntCounterVec,
    /// Emitted records per connection label set since the series was created.
    connections: IntGaugeVec,
    duration: HistogramVec,
    pub dropped_records: IntCounter,
    pub suppressed_records: IntCounter,
    pub reaped_flows: IntCounter,
    pub tracked_flows: IntGauge,
    /// Last update per flow label set, for retiring idle series.
    series: Mutex<HashMap<[String; 7], Instant>>,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let bytes = IntCounterVec::new(
            Opts::new("netlog_network_bytes_total", "Total number of bytes transferred"),
            &FLOW_LABELS,
        )?;
        let packets = IntCounterVec::new(
            Opts::new("netlog_network_packets_total", "Total number of packets"),
            &FLOW_LABELS,
        )?;
        let connections = IntGaugeVec::new(
            Opts::new("netlog_network_connections_active", "Number of active connections"),
            &CONNECTION_LABELS,
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "netlog_network_connection_duration_seconds",
                "Duration of network connections in seconds",
            ),
            &CONNECTION_LABELS,
        )?;
        let dropped_records = IntCounter::new(
            "netlog_dropped_records_total",
            "Flow records dropped because the emission queue was full",
        )?;
        let suppressed_records = IntCounter::new(
            "netlog_suppressed_records_total",
            "Matured flow records without a resolved namespace",
        )?;
        let reaped_flows = IntCounter::new(
            "netlog_reaped_flows_total",
            "Flows evicted after going idle before maturing",
        )?;
        let tracked_flows = IntGauge::new("netlog_tracked_flows", "Flows currently aggregated")?;

        registry.register(Box::new(bytes.clone()))?;
        registry.register(Box::new(packets.clone()))?;
        registry.register(Box::new(connections.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(dropped_records.clone()))?;
        registry.register(Box::new(suppressed_records.clone()))?;
        registry.register(Box::new(reaped_flows.clone()))?;
        registry.register(Box::new(tracked_flows.clone()))?;

        Ok(Self {
            registry,
            bytes,
            packets,
            connections,
            duration,
            dropped_records,
            suppressed_records,
            reaped_flows,
            tracked_flows,
            series: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Records an emitted flow. Unattributed flows are never exported.
    pub fn observe(&self, record: &FlowRecord) {
        if !record.is_attributed() {
            return;
        }
        let labels = flow_labels(record);
        let values: Vec<&str> = labels.iter().map(String::as_str).collect();

        self.bytes.with_label_values(&values).inc_by(record.total_bytes);
        self.packets.with_label_values(&values).inc_by(record.packets);
        let connection = &values[..CONNECTION_LABELS.len()];
        self.connections.with_label_values(connection).inc();
        self.duration
            .with_label_values(connection)
            .observe(record.duration().as_secs_f64());

        self.series.lock().insert(labels, Instant::now());
    }

    /// Removes flow series that have not been updated within `max_age`.
    pub fn retire_idle(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut series = self.series.lock();
        let idle: Vec<[String; 7]> = series
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > max_age)
            .map(|(labels, _)| labels.clone())
            .collect();

        for labels in &idle {
            let values: Vec<&str> = labels.iter().map(String::as_str).collect();
            let _ = self.bytes.remove_label_values(&values);
            let _ = self.packets.remove_label_values(&values);
            let connection = &values[..CONNECTION_LABELS.len()];
            // Connection series are shared by both directions of a label set.
            let still_used = series.keys().any(|other| {
                !idle.contains(other) && other[..CONNECTION_LABELS.len()] == labels[..CONNECTION_LABELS.len()]
            });
            if !still_used {
                let _ = self.connections.remove_label_values(connection);
                let _ = self.duration.remove_label_values(connection);
            }
            series.remove(labels);
        }
        idle.len()
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("failed to encode metrics")?;
        String::from_utf8(buffer).context("metrics exposition is not UTF-8")
    }
}

fn flow_labels(record: &FlowRecord) -> [String; 7] {
    [
        record.namespace.clone(),
        record.name.clone(),
        record.source.to_string(),
        record.destination.to_string(),
        record.protocol.to_string(),
        record.port.to_string(),
        record.direction.as_str().to_string(),
    ]
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Response {
    match metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")).into_response(),
    }
}

pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))
}

/// Serves `/metrics` on `listener` until the shutdown signal fires.
pub async fn serve(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("serving metrics on http://{addr}/metrics");
    }
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("metrics server failed")
}
