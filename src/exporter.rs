// ============================================================================
// METRICS EXPORTER
// ============================================================================
// Read-only view of the cache for scrapers:
// - Prometheus registry refreshed from latest()/summary() at scrape time
// - axum HTTP server: /metrics, /health, /summary, /latest
// - graceful shutdown on the engine's stop signal
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use parking_lot::Mutex;
use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry as PrometheusRegistry, TextEncoder,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::{CacheSummary, MetricsCache};
use crate::error::{MonitorError, MonitorResult};
use crate::scheduler::{FailureCount, SchedulerStats};
use crate::types::CompositeRecord;
use crate::ENGINE_VERSION;

// ----------------------------------------------------------------------------
// Prometheus Exporter
// ----------------------------------------------------------------------------

pub struct PrometheusExporter {
    registry: PrometheusRegistry,
    cache: Arc<MetricsCache>,
    stats: Arc<SchedulerStats>,
    metric_value: GaugeVec,
    alert_active: IntGaugeVec,
    cache_records: IntGauge,
    cache_oldest: Gauge,
    cache_newest: Gauge,
    // counters mirror the scheduler's monotonic totals
    sampler_failures: IntCounterVec,
    cycles_completed: IntCounter,
    // reset-then-set must not interleave between concurrent scrapes
    render_lock: Mutex<()>,
}

impl PrometheusExporter {
    pub fn new(cache: Arc<MetricsCache>, stats: Arc<SchedulerStats>) -> MonitorResult<Self> {
        let registry = PrometheusRegistry::new();

        let metric_value = GaugeVec::new(
            Opts::new("dvpn_metric_value", "Latest sampled value per domain and metric"),
            &["domain", "metric"],
        )
        .map_err(prom_err)?;
        let alert_active = IntGaugeVec::new(
            Opts::new("dvpn_alert_active", "Alerts raised by the latest collection cycle"),
            &["domain", "metric", "level"],
        )
        .map_err(prom_err)?;
        let cache_records = IntGauge::new("dvpn_cache_records", "Composite records retained")
            .map_err(prom_err)?;
        let cache_oldest = Gauge::new(
            "dvpn_cache_oldest_timestamp_seconds",
            "Timestamp of the oldest retained record",
        )
        .map_err(prom_err)?;
        let cache_newest = Gauge::new(
            "dvpn_cache_newest_timestamp_seconds",
            "Timestamp of the newest retained record",
        )
        .map_err(prom_err)?;
        let sampler_failures = IntCounterVec::new(
            Opts::new("dvpn_sampler_failures_total", "Sampling failures per domain and kind"),
            &["domain", "kind"],
        )
        .map_err(prom_err)?;
        let cycles_completed = IntCounter::new("dvpn_cycles_completed_total", "Collection cycles completed")
            .map_err(prom_err)?;

        registry.register(Box::new(metric_value.clone())).map_err(prom_err)?;
        registry.register(Box::new(alert_active.clone())).map_err(prom_err)?;
        registry.register(Box::new(cache_records.clone())).map_err(prom_err)?;
        registry.register(Box::new(cache_oldest.clone())).map_err(prom_err)?;
        registry.register(Box::new(cache_newest.clone())).map_err(prom_err)?;
        registry.register(Box::new(sampler_failures.clone())).map_err(prom_err)?;
        registry.register(Box::new(cycles_completed.clone())).map_err(prom_err)?;

        Ok(Self {
            registry,
            cache,
            stats,
            metric_value,
            alert_active,
            cache_records,
            cache_oldest,
            cache_newest,
            sampler_failures,
            cycles_completed,
            render_lock: Mutex::new(()),
        })
    }

    /// Refresh every gauge and encode the registry in the text format.
    pub fn render(&self) -> MonitorResult<String> {
        let _guard = self.render_lock.lock();

        // Label sets from an older record must not linger
        self.metric_value.reset();
        self.alert_active.reset();
        if let Some(latest) = self.cache.latest() {
            for (domain, snapshot) in latest.by_domain() {
                for (metric, value) in snapshot.fields() {
                    self.metric_value
                        .with_label_values(&[domain.as_str(), metric.as_str()])
                        .set(*value);
                }
            }
            for alert in latest.alerts() {
                self.alert_active
                    .with_label_values(&[alert.domain.as_str(), alert.metric.as_str(), alert.level.as_str()])
                    .set(1);
            }
        }

        let summary = self.cache.summary();
        self.cache_records.set(summary.count as i64);
        self.cache_oldest
            .set(summary.oldest_timestamp.map_or(0.0, |t| t.as_secs_f64()));
        self.cache_newest
            .set(summary.newest_timestamp.map_or(0.0, |t| t.as_secs_f64()));

        self.sampler_failures.reset();
        for failure in self.stats.failures().snapshot() {
            self.sampler_failures
                .with_label_values(&[failure.domain.as_str(), failure.kind.as_str()])
                .inc_by(failure.count);
        }
        self.cycles_completed.reset();
        self.cycles_completed.inc_by(self.stats.cycles_completed());

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prom_err)?;
        String::from_utf8(buffer).map_err(|e| MonitorError::exporter(e.to_string()))
    }

    pub fn summary(&self) -> SummaryResponse {
        SummaryResponse {
            cache: self.cache.summary(),
            retention_secs: self.cache.retention_window().as_secs(),
            cycles_completed: self.stats.cycles_completed(),
            failures: self.stats.failures().snapshot(),
        }
    }

    pub fn latest(&self) -> Option<Arc<CompositeRecord>> {
        self.cache.latest()
    }
}

impl std::fmt::Debug for PrometheusExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusExporter")
            .field("cache", &self.cache.summary())
            .finish_non_exhaustive()
    }
}

fn prom_err(e: prometheus::Error) -> MonitorError {
    MonitorError::exporter(e.to_string())
}

// ----------------------------------------------------------------------------
// HTTP Endpoints
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Body of `GET /summary`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub cache: CacheSummary,
    pub retention_secs: u64,
    pub cycles_completed: u64,
    pub failures: Vec<FailureCount>,
}

pub fn router(exporter: Arc<PrometheusExporter>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/summary", get(summary_handler))
        .route("/latest", get(latest_handler))
        .with_state(exporter)
}

async fn metrics_handler(State(exporter): State<Arc<PrometheusExporter>>) -> Response {
    match exporter.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: ENGINE_VERSION.into(),
    })
}

async fn summary_handler(State(exporter): State<Arc<PrometheusExporter>>) -> Json<SummaryResponse> {
    Json(exporter.summary())
}

async fn latest_handler(
    State(exporter): State<Arc<PrometheusExporter>>,
) -> Result<Json<Arc<CompositeRecord>>, StatusCode> {
    exporter.latest().map(Json).ok_or(StatusCode::NOT_FOUND)
}

/// Serve the exporter on `addr` until `cancel` fires.
pub async fn serve(
    exporter: Arc<PrometheusExporter>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> MonitorResult<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| MonitorError::exporter(format!("bind {}: {}", addr, e)))?;

    info!(target: "dvpn::exporter", %addr, "Metrics exporter listening");

    axum::serve(listener, router(exporter))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!(target: "dvpn::exporter", "Metrics exporter stopped");
    Ok(())
}
