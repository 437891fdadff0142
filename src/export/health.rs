use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::bridge::table::AggregationTable;

const NAMESPACE: &str = "tsbridge";

/// Prometheus metrics for bridge health and observability.
///
/// All metrics use the "tsbridge" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    bound: parking_lot::Mutex<Option<SocketAddr>>,

    // === Ingestion ===
    /// Total MQTT messages received.
    pub messages_received: Counter,
    /// Messages by classified channel.
    pub messages_by_channel: CounterVec,
    /// Messages whose topic matched no configured pattern.
    pub messages_unrecognized: Counter,
    /// Payload decode failures by reason.
    pub decode_errors: CounterVec,
    /// Field values dropped because the field is not configured.
    pub unknown_fields: Counter,
    /// Alert increments applied to counters.
    pub alerts_counted: Counter,
    /// Reset signals applied.
    pub resets: Counter,
    /// Scheduling hints by effect (advanced/unchanged/deferred).
    pub hints: CounterVec,
    /// Number of (user, room) keys tracked.
    pub keys_tracked: Gauge,
    /// Whether the MQTT connection is up (1=yes, 0=no).
    pub mqtt_connected: Gauge,

    // === Publishing ===
    /// Flushes by outcome.
    pub flushes: CounterVec,
    /// Flushes currently in flight.
    pub flushes_in_flight: Gauge,
    /// Flush duration including the credential lookup and sink request.
    pub flush_duration: Histogram,
    /// Credential lookups by result (cached/found/not_found/error).
    pub credential_lookups: CounterVec,
    /// Catalog API requests by endpoint and status.
    pub catalog_requests_total: CounterVec,
    /// Catalog request duration by endpoint.
    pub catalog_request_duration: HistogramVec,

    // === Lifecycle ===
    /// Startup duration by phase.
    pub agent_start_duration: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Ingestion ===
        let messages_received = Counter::with_opts(
            Opts::new("messages_received_total", "Total MQTT messages received.")
                .namespace(NAMESPACE),
        )?;
        let messages_by_channel = CounterVec::new(
            Opts::new(
                "messages_by_channel_total",
                "Classified messages by channel category.",
            )
            .namespace(NAMESPACE),
            &["channel"],
        )?;
        let messages_unrecognized = Counter::with_opts(
            Opts::new(
                "messages_unrecognized_total",
                "Messages whose topic matched no configured pattern.",
            )
            .namespace(NAMESPACE),
        )?;
        let decode_errors = CounterVec::new(
            Opts::new("decode_errors_total", "Payload decode failures by reason.")
                .namespace(NAMESPACE),
            &["reason"],
        )?;
        let unknown_fields = Counter::with_opts(
            Opts::new(
                "unknown_fields_total",
                "Field values dropped because the field is not configured.",
            )
            .namespace(NAMESPACE),
        )?;
        let alerts_counted = Counter::with_opts(
            Opts::new("alerts_counted_total", "Alert increments applied.").namespace(NAMESPACE),
        )?;
        let resets = Counter::with_opts(
            Opts::new("resets_total", "Counter reset signals applied.").namespace(NAMESPACE),
        )?;
        let hints = CounterVec::new(
            Opts::new("hints_total", "Scheduling hints by effect.").namespace(NAMESPACE),
            &["effect"],
        )?;
        let keys_tracked = Gauge::with_opts(
            Opts::new("keys_tracked", "Number of (user, room) keys tracked.").namespace(NAMESPACE),
        )?;
        let mqtt_connected = Gauge::with_opts(
            Opts::new(
                "mqtt_connected",
                "Whether the MQTT connection is up (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;

        // === Publishing ===
        let flushes = CounterVec::new(
            Opts::new("flushes_total", "Flushes by outcome.").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let flushes_in_flight = Gauge::with_opts(
            Opts::new("flushes_in_flight", "Flushes currently in flight.").namespace(NAMESPACE),
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Time to resolve credentials and write one record.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;
        let credential_lookups = CounterVec::new(
            Opts::new("credential_lookups_total", "Credential lookups by result.")
                .namespace(NAMESPACE),
            &["result"],
        )?;
        let catalog_requests_total = CounterVec::new(
            Opts::new(
                "catalog_requests_total",
                "Total catalog API requests by endpoint and status.",
            )
            .namespace(NAMESPACE),
            &["endpoint", "status"],
        )?;
        let catalog_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "catalog_request_duration_seconds",
                "Catalog API request duration by endpoint.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["endpoint"],
        )?;

        // === Lifecycle ===
        let agent_start_duration = GaugeVec::new(
            Opts::new(
                "agent_start_duration_seconds",
                "Duration of startup phases.",
            )
            .namespace(NAMESPACE),
            &["phase"],
        )?;

        // Register all metrics with the custom registry.
        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_by_channel.clone()))?;
        registry.register(Box::new(messages_unrecognized.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(unknown_fields.clone()))?;
        registry.register(Box::new(alerts_counted.clone()))?;
        registry.register(Box::new(resets.clone()))?;
        registry.register(Box::new(hints.clone()))?;
        registry.register(Box::new(keys_tracked.clone()))?;
        registry.register(Box::new(mqtt_connected.clone()))?;

        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(flushes_in_flight.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(credential_lookups.clone()))?;
        registry.register(Box::new(catalog_requests_total.clone()))?;
        registry.register(Box::new(catalog_request_duration.clone()))?;

        registry.register(Box::new(agent_start_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            bound: parking_lot::Mutex::new(None),
            messages_received,
            messages_by_channel,
            messages_unrecognized,
            decode_errors,
            unknown_fields,
            alerts_counted,
            resets,
            hints,
            keys_tracked,
            mqtt_connected,
            flushes,
            flushes_in_flight,
            flush_duration,
            credential_lookups,
            catalog_requests_total,
            catalog_request_duration,
            agent_start_duration,
        })
    }

    /// Starts the HTTP server serving /metrics, /healthz, and /state.
    pub async fn start(&self, table: Option<Arc<AggregationTable>>) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
            table,
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .route("/state", get(state_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;
        *self.bound.lock() = Some(local_addr);

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Address the server is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
    table: Option<Arc<AggregationTable>>,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /state - JSON snapshot of every tracked key.
async fn state_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.table {
        Some(table) => (StatusCode::OK, Json(table.snapshot_all(Instant::now()))).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "bridge not running").into_response(),
    }
}
