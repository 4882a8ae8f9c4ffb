//! Prometheus metrics and the probe server.
//!
//! Serves `/healthz`, `/readyz` and `/metrics` on the probe address.

use crate::reconciler::ReconcileOutcome;
use axum::{Router, extract::State, http::StatusCode, routing::get};
use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Controller metrics, registered in a private registry.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    replica_writes: IntCounterVec,
    reconcile_duration: Histogram,
}

impl Metrics {
    /// Creates and registers all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new("role_cloner_reconciliations_total", "Reconciliation passes by result"),
            &["result"],
        )?;
        let replica_writes = IntCounterVec::new(
            Opts::new("role_cloner_replica_writes_total", "Replica writes by operation"),
            &["operation"],
        )?;
        let reconcile_duration = Histogram::with_opts(HistogramOpts::new(
            "role_cloner_reconcile_duration_seconds",
            "Duration of reconciliation passes",
        ))?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(replica_writes.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            replica_writes,
            reconcile_duration,
        })
    }

    /// Records a successful pass.
    pub fn record_success(&self, outcome: &ReconcileOutcome, elapsed: Duration) {
        self.reconciliations.with_label_values(&["success"]).inc();
        self.reconcile_duration.observe(elapsed.as_secs_f64());
        for (operation, count) in [
            ("create", outcome.created),
            ("update", outcome.updated),
            ("delete", outcome.deleted),
        ] {
            if count > 0 {
                self.replica_writes
                    .with_label_values(&[operation])
                    .inc_by(count as u64);
            }
        }
    }

    /// Records a failed pass.
    pub fn record_error(&self, elapsed: Duration) {
        self.reconciliations.with_label_values(&["error"]).inc();
        self.reconcile_duration.observe(elapsed.as_secs_f64());
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

/// State shared by the probe handlers.
#[derive(Debug, Clone)]
pub struct ProbeState {
    metrics: Arc<Metrics>,
    ready: Arc<AtomicBool>,
}

impl ProbeState {
    /// Creates probe state that reports not ready.
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Marks the controller as ready to serve.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Whether `/readyz` reports ready.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Builds the probe router.
pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn readyz(State(state): State<ProbeState>) -> (StatusCode, &'static str) {
    if state.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(state): State<ProbeState>) -> (StatusCode, String) {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Serves the probe router on `addr` until the process exits.
pub async fn serve(addr: SocketAddr, state: ProbeState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Probe server listening on {}", addr);
    axum::serve(listener, router(state)).await
}
