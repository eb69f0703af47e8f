/// Metrics - Prometheus instrumentation
///
/// One registry for the whole service, gauges for watermarks and tips,
/// counters for pipeline throughput, histograms for RPC and commit latency.
/// Served on the metrics listener together with /healthz.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Standard latency buckets for histograms (seconds)
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ------------------------------------------------------------------
    // Pipeline progress & throughput
    // ------------------------------------------------------------------

    /// Blocks persisted, by ingester ("forward", "history")
    pub static ref BLOCKS_PERSISTED: IntCounterVec = IntCounterVec::new(
        Opts::new("flowdex_blocks_persisted_total", "Blocks persisted by ingester"),
        &["ingester"]
    ).unwrap();

    /// Transactions persisted, by ingester
    pub static ref TRANSACTIONS_PERSISTED: IntCounterVec = IntCounterVec::new(
        Opts::new("flowdex_transactions_persisted_total", "Transactions persisted by ingester"),
        &["ingester"]
    ).unwrap();

    /// Events persisted, by ingester
    pub static ref EVENTS_PERSISTED: IntCounterVec = IntCounterVec::new(
        Opts::new("flowdex_events_persisted_total", "Events persisted by ingester"),
        &["ingester"]
    ).unwrap();

    /// Windows that failed and were retried, by ingester
    pub static ref WINDOWS_FAILED: IntCounterVec = IntCounterVec::new(
        Opts::new("flowdex_windows_failed_total", "Fetch windows that failed"),
        &["ingester"]
    ).unwrap();

    /// Chain tip height as reported by the live pool
    pub static ref CHAIN_TIP_HEIGHT: IntGauge = IntGauge::new(
        "flowdex_chain_tip_height",
        "Latest chain tip height reported by the live node pool"
    ).unwrap();

    /// Checkpoint heights, by worker name
    pub static ref CHECKPOINT_HEIGHT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("flowdex_checkpoint_height", "Checkpoint last_height by worker"),
        &["worker"]
    ).unwrap();

    // ------------------------------------------------------------------
    // Latency histograms
    // ------------------------------------------------------------------

    /// RPC call duration
    /// Labels: method, outcome (ok, or the error kind)
    pub static ref RPC_CALL_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("flowdex_rpc_call_duration_seconds", "Access node call latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["method", "outcome"]
    ).unwrap();

    /// Window commit duration (one batch-writer transaction)
    pub static ref WINDOW_COMMIT_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("flowdex_window_commit_duration_seconds", "Batch writer commit latency")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    /// Full fetch duration for one height
    pub static ref FETCH_HEIGHT_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("flowdex_fetch_height_duration_seconds", "Per-height fetch latency")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    // ------------------------------------------------------------------
    // RPC / node pool health
    // ------------------------------------------------------------------

    /// Endpoint cooldowns entered, by endpoint
    pub static ref ENDPOINT_COOLDOWNS: IntCounterVec = IntCounterVec::new(
        Opts::new("flowdex_endpoint_cooldowns_total", "Times an endpoint entered cooldown"),
        &["endpoint"]
    ).unwrap();

    /// Fallback tier switches, by tier ("modern_per_item", "raw_batched", "raw_per_item")
    pub static ref FETCH_FALLBACKS: IntCounterVec = IntCounterVec::new(
        Opts::new("flowdex_fetch_fallbacks_total", "Fallback fetch tier activations"),
        &["tier"]
    ).unwrap();

    /// NUL bytes stripped from strings bound for text columns
    pub static ref SANITIZER_NUL_STRIPS: IntCounter = IntCounter::new(
        "flowdex_sanitizer_nul_strips_total",
        "Strings that had NUL bytes stripped before persistence"
    ).unwrap();

    /// Reorg rollbacks executed
    pub static ref REORG_ROLLBACKS: IntCounter = IntCounter::new(
        "flowdex_reorg_rollbacks_total",
        "Bounded reorg rollbacks executed by the forward ingester"
    ).unwrap();

    // ------------------------------------------------------------------
    // Derivation scheduler
    // ------------------------------------------------------------------

    /// Lease transitions, by worker type and new status
    pub static ref LEASE_TRANSITIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("flowdex_lease_transitions_total", "Lease state transitions"),
        &["worker_type", "status"]
    ).unwrap();

    /// Committer watermark, by worker type
    pub static ref DERIVATION_WATERMARK: IntGaugeVec = IntGaugeVec::new(
        Opts::new("flowdex_derivation_watermark", "Committer watermark by derivation kind"),
        &["worker_type"]
    ).unwrap();
}

/// Register every metric with the global registry. Call once at startup;
/// re-registration errors are ignored so tests can call it freely.
pub fn register_all() {
    let _ = REGISTRY.register(Box::new(BLOCKS_PERSISTED.clone()));
    let _ = REGISTRY.register(Box::new(TRANSACTIONS_PERSISTED.clone()));
    let _ = REGISTRY.register(Box::new(EVENTS_PERSISTED.clone()));
    let _ = REGISTRY.register(Box::new(WINDOWS_FAILED.clone()));
    let _ = REGISTRY.register(Box::new(CHAIN_TIP_HEIGHT.clone()));
    let _ = REGISTRY.register(Box::new(CHECKPOINT_HEIGHT.clone()));
    let _ = REGISTRY.register(Box::new(RPC_CALL_DURATION.clone()));
    let _ = REGISTRY.register(Box::new(WINDOW_COMMIT_DURATION.clone()));
    let _ = REGISTRY.register(Box::new(FETCH_HEIGHT_DURATION.clone()));
    let _ = REGISTRY.register(Box::new(ENDPOINT_COOLDOWNS.clone()));
    let _ = REGISTRY.register(Box::new(FETCH_FALLBACKS.clone()));
    let _ = REGISTRY.register(Box::new(SANITIZER_NUL_STRIPS.clone()));
    let _ = REGISTRY.register(Box::new(REORG_ROLLBACKS.clone()));
    let _ = REGISTRY.register(Box::new(LEASE_TRANSITIONS.clone()));
    let _ = REGISTRY.register(Box::new(DERIVATION_WATERMARK.clone()));
}

/// Render the registry in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Serve /metrics and /healthz until cancelled. /healthz reports the tip
/// and every checkpoint watermark so freshness is observable per worker.
pub async fn serve(
    addr: &str,
    store: std::sync::Arc<dyn crate::store::Store>,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<(), crate::error::IndexError> {
    use axum::{routing::get, Extension, Router};

    async fn metrics_handler() -> String {
        gather()
    }

    async fn healthz_handler(
        Extension(store): Extension<std::sync::Arc<dyn crate::store::Store>>,
    ) -> axum::Json<serde_json::Value> {
        let watermarks = match store.watermarks().await {
            Ok(rows) => rows
                .into_iter()
                .map(|c| (c.worker_name, serde_json::json!(c.last_height)))
                .collect::<serde_json::Map<_, _>>(),
            Err(_) => serde_json::Map::new(),
        };
        axum::Json(serde_json::json!({
            "status": "ok",
            "chain_tip": CHAIN_TIP_HEIGHT.get(),
            "watermarks": watermarks,
        }))
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .layer(Extension(store));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| crate::error::IndexError::Config(format!("binding metrics listener: {}", e)))?;
    tracing::info!(addr, "metrics listener started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| crate::error::IndexError::Config(format!("metrics server: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_gather() {
        register_all();
        BLOCKS_PERSISTED.with_label_values(&["forward"]).inc_by(3);
        let text = gather();
        assert!(text.contains("flowdex_blocks_persisted_total"));
    }

    #[test]
    fn test_register_all_is_idempotent() {
        register_all();
        register_all();
    }
}
