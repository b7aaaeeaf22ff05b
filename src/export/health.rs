use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for agent health and observability.
///
/// All metrics use the "flowmon" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Poll cycle ===
    /// Total completed poll cycles.
    pub polls_total: Counter,
    /// Wall time of one complete poll cycle.
    pub poll_duration: Histogram,
    /// Flows observed in the most recent snapshot.
    pub connections_observed: Gauge,
    /// Flows currently tracked (live + stale).
    pub connections_tracked: Gauge,
    /// Total flows closed after exhausting the poll grace period.
    pub connections_closed: Counter,

    // === Attribution ===
    /// Flows without an owning identity after the latest cycle.
    pub connections_unattributed: Gauge,
    /// Total recycled-pid detections.
    pub pid_reuse_detections: Counter,
    /// Total processes discovered to have exited.
    pub process_exits: Counter,
    /// Entries currently held by the identity cache.
    pub identity_cache_size: Gauge,
    /// Total identity cache evictions under capacity pressure.
    pub identity_cache_evictions: Counter,

    // === Samples & rollups ===
    /// Total per-interval sample batches emitted.
    pub sample_batches_emitted: Counter,
    /// Total duplicate sample windows skipped by rollup lanes.
    pub rollup_duplicates_skipped: Counter,

    // === Store ===
    /// Rows successfully written, by table family.
    pub store_rows_written: CounterVec,
    /// Batches dropped after exhausting write retries.
    pub store_batches_dropped: Counter,
    /// Store write latency, successful attempts only.
    pub store_write_duration: Histogram,

    // === Publisher ===
    /// Total change events produced.
    pub events_published: Counter,
    /// Active change-event subscribers.
    pub subscribers: Gauge,

    // === Trace source ===
    /// Trace records for flows unknown to the tracker.
    pub trace_records_unmatched: Counter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let polls_total = Counter::with_opts(
            Opts::new("polls_total", "Total completed poll cycles.").namespace("flowmon"),
        )?;
        let poll_duration = Histogram::with_opts(
            HistogramOpts::new("poll_duration_seconds", "Wall time of one poll cycle.")
                .namespace("flowmon")
                .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let connections_observed = Gauge::with_opts(
            Opts::new(
                "connections_observed",
                "Flows observed in the most recent snapshot.",
            )
            .namespace("flowmon"),
        )?;
        let connections_tracked = Gauge::with_opts(
            Opts::new("connections_tracked", "Flows currently tracked.").namespace("flowmon"),
        )?;
        let connections_closed = Counter::with_opts(
            Opts::new(
                "connections_closed_total",
                "Flows closed after exhausting the poll grace period.",
            )
            .namespace("flowmon"),
        )?;

        let connections_unattributed = Gauge::with_opts(
            Opts::new(
                "connections_unattributed",
                "Flows without an owning identity after the latest cycle.",
            )
            .namespace("flowmon"),
        )?;
        let pid_reuse_detections = Counter::with_opts(
            Opts::new(
                "pid_reuse_detections_total",
                "Recycled-pid detections by the attribution guard.",
            )
            .namespace("flowmon"),
        )?;
        let process_exits = Counter::with_opts(
            Opts::new(
                "process_exits_total",
                "Processes discovered to have exited while owning flows.",
            )
            .namespace("flowmon"),
        )?;
        let identity_cache_size = Gauge::with_opts(
            Opts::new(
                "identity_cache_size",
                "Entries currently held by the identity cache.",
            )
            .namespace("flowmon"),
        )?;
        let identity_cache_evictions = Counter::with_opts(
            Opts::new(
                "identity_cache_evictions_total",
                "Identity cache evictions under capacity pressure.",
            )
            .namespace("flowmon"),
        )?;

        let sample_batches_emitted = Counter::with_opts(
            Opts::new(
                "sample_batches_emitted_total",
                "Per-interval sample batches emitted.",
            )
            .namespace("flowmon"),
        )?;
        let rollup_duplicates_skipped = Counter::with_opts(
            Opts::new(
                "rollup_duplicates_skipped_total",
                "Duplicate sample windows skipped by rollup lanes.",
            )
            .namespace("flowmon"),
        )?;

        let store_rows_written = CounterVec::new(
            Opts::new(
                "store_rows_written_total",
                "Rows successfully written, by table family.",
            )
            .namespace("flowmon"),
            &["family"],
        )?;
        let store_batches_dropped = Counter::with_opts(
            Opts::new(
                "store_batches_dropped_total",
                "Batches dropped after exhausting write retries.",
            )
            .namespace("flowmon"),
        )?;
        let store_write_duration = Histogram::with_opts(
            HistogramOpts::new(
                "store_write_duration_seconds",
                "Store write latency, successful attempts only.",
            )
            .namespace("flowmon")
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        let events_published = Counter::with_opts(
            Opts::new("events_published_total", "Change events produced.").namespace("flowmon"),
        )?;
        let subscribers = Gauge::with_opts(
            Opts::new("subscribers", "Active change-event subscribers.").namespace("flowmon"),
        )?;

        let trace_records_unmatched = Counter::with_opts(
            Opts::new(
                "trace_records_unmatched_total",
                "Trace records for flows unknown to the tracker.",
            )
            .namespace("flowmon"),
        )?;

        registry.register(Box::new(polls_total.clone()))?;
        registry.register(Box::new(poll_duration.clone()))?;
        registry.register(Box::new(connections_observed.clone()))?;
        registry.register(Box::new(connections_tracked.clone()))?;
        registry.register(Box::new(connections_closed.clone()))?;
        registry.register(Box::new(connections_unattributed.clone()))?;
        registry.register(Box::new(pid_reuse_detections.clone()))?;
        registry.register(Box::new(process_exits.clone()))?;
        registry.register(Box::new(identity_cache_size.clone()))?;
        registry.register(Box::new(identity_cache_evictions.clone()))?;
        registry.register(Box::new(sample_batches_emitted.clone()))?;
        registry.register(Box::new(rollup_duplicates_skipped.clone()))?;
        registry.register(Box::new(store_rows_written.clone()))?;
        registry.register(Box::new(store_batches_dropped.clone()))?;
        registry.register(Box::new(store_write_duration.clone()))?;
        registry.register(Box::new(events_published.clone()))?;
        registry.register(Box::new(subscribers.clone()))?;
        registry.register(Box::new(trace_records_unmatched.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            polls_total,
            poll_duration,
            connections_observed,
            connections_tracked,
            connections_closed,
            connections_unattributed,
            pid_reuse_detections,
            process_exits,
            identity_cache_size,
            identity_cache_evictions,
            sample_batches_emitted,
            rollup_duplicates_skipped,
            store_rows_written,
            store_batches_dropped,
            store_write_duration,
            events_published,
            subscribers,
            trace_records_unmatched,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
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

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

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
