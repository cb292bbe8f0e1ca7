// ============================================================================
// MONITOR ENGINE
// ============================================================================
// Owns the process-wide pieces and runs them under one stop signal:
// - Arc<MetricsCache> and Arc<ThresholdTable> shared explicitly
// - scheduler, eviction task and exporter as separate tasks
// - SIGINT/SIGTERM trigger the same stop path as stop()
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregator::Aggregator;
use crate::alerts::{AlertSink, ThresholdTable, TracingAlertSink};
use crate::cache::{run_eviction_loop, MetricsCache};
use crate::config::MonitorConfig;
use crate::error::{MonitorError, MonitorResult};
use crate::exporter::{self, PrometheusExporter};
use crate::samplers::{build_samplers, Sampler};
use crate::scheduler::{CollectionScheduler, DomainRegistration, SchedulerStats};
use crate::types::Timestamp;
use crate::{ENGINE_FULL_NAME, ENGINE_VERSION};

pub struct MonitorEngine {
    config: MonitorConfig,
    cache: Arc<MetricsCache>,
    thresholds: Arc<ThresholdTable>,
    stats: Arc<SchedulerStats>,
    exporter: Option<Arc<PrometheusExporter>>,
    // taken by run()
    scheduler: Mutex<Option<CollectionScheduler>>,
    shutdown: CancellationToken,
    start_time: Timestamp,
}

impl MonitorEngine {
    /// Build an engine with the host samplers enabled in `config`.
    pub fn from_config(config: MonitorConfig) -> MonitorResult<Self> {
        let samplers = build_samplers(&config.samplers);
        Self::with_samplers(config, samplers, Arc::new(TracingAlertSink))
    }

    /// Build an engine around caller-provided samplers and alert sink.
    pub fn with_samplers(
        config: MonitorConfig,
        samplers: Vec<Arc<dyn Sampler>>,
        sink: Arc<dyn AlertSink>,
    ) -> MonitorResult<Self> {
        config.validate()?;

        let cache = Arc::new(MetricsCache::new(config.engine.retention_window));
        let thresholds = Arc::new(config.threshold_table()?);
        let aggregator = Arc::new(Aggregator::new(cache.clone(), thresholds.clone(), sink));

        let mut scheduler = CollectionScheduler::new(aggregator, config.engine.collection_interval)
            .with_cycle_timeout(config.engine.cycle_timeout)
            .with_shutdown_timeout(config.engine.shutdown_timeout);
        for sampler in samplers {
            let interval = config.sampler_interval(sampler.domain());
            scheduler.register(DomainRegistration::new(sampler, interval))?;
        }
        let stats = scheduler.stats();

        let exporter = if config.exporter.enabled {
            Some(Arc::new(PrometheusExporter::new(cache.clone(), stats.clone())?))
        } else {
            None
        };

        Ok(Self {
            config,
            cache,
            thresholds,
            stats,
            exporter,
            scheduler: Mutex::new(Some(scheduler)),
            shutdown: CancellationToken::new(),
            start_time: Timestamp::now(),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<MetricsCache> {
        &self.cache
    }

    pub fn thresholds(&self) -> &Arc<ThresholdTable> {
        &self.thresholds
    }

    pub fn stats(&self) -> &Arc<SchedulerStats> {
        &self.stats
    }

    pub fn exporter(&self) -> Option<&Arc<PrometheusExporter>> {
        self.exporter.as_ref()
    }

    pub fn uptime(&self) -> Duration {
        Timestamp::now().duration_since(self.start_time)
    }

    /// Signal shutdown
    pub fn stop(&self) {
        info!(target: "dvpn::engine", "Shutdown requested");
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run until `cancel` fires, [`stop`](Self::stop) is called, or the
    /// scheduler hits a fatal error.
    pub async fn run(&self, cancel: CancellationToken) -> MonitorResult<()> {
        let scheduler = self
            .scheduler
            .lock()
            .take()
            .ok_or_else(|| MonitorError::Internal("engine has already been run".into()))?;

        info!(
            target: "dvpn::engine",
            version = ENGINE_VERSION,
            instance = %self.config.engine.instance_name,
            "Starting {}", ENGINE_FULL_NAME
        );

        let stop = self.shutdown.clone();
        let mut scheduler_task = tokio::spawn(scheduler.run(stop.clone()));
        let eviction_task = tokio::spawn(run_eviction_loop(
            self.cache.clone(),
            self.config.engine.eviction_interval,
            stop.clone(),
        ));
        let exporter_task = match (&self.exporter, self.config.exporter.listen_addr()) {
            (Some(exporter), Ok(addr)) => {
                let exporter = exporter.clone();
                let stop = stop.clone();
                Some(tokio::spawn(async move {
                    // Export is best-effort; collection continues without it
                    if let Err(e) = exporter::serve(exporter, addr, stop).await {
                        error!(target: "dvpn::engine", error = %e, "Metrics exporter failed");
                    }
                }))
            }
            (Some(_), Err(e)) => {
                warn!(target: "dvpn::engine", error = %e, "Metrics exporter disabled");
                None
            }
            (None, _) => None,
        };

        let mut finished = None;
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(target: "dvpn::engine", "Stop signal received");
            }
            _ = stop.cancelled() => {}
            joined = &mut scheduler_task => {
                finished = Some(joined);
            }
        }

        // Graceful shutdown
        let shutdown_start = std::time::Instant::now();
        stop.cancel();

        let joined = match finished {
            Some(joined) => joined,
            None => scheduler_task.await,
        };
        let outcome = match joined {
            Ok(result) => result,
            Err(e) => Err(MonitorError::scheduler_fatal(format!("scheduler task failed: {}", e))),
        };

        if let Err(e) = eviction_task.await {
            warn!(target: "dvpn::engine", error = %e, "Eviction task ended abnormally");
        }
        if let Some(task) = exporter_task {
            if let Err(e) = task.await {
                warn!(target: "dvpn::engine", error = %e, "Exporter task ended abnormally");
            }
        }

        let summary = self.cache.summary();
        info!(
            target: "dvpn::engine",
            duration_ms = shutdown_start.elapsed().as_millis() as u64,
            cycles = self.stats.cycles_completed(),
            retained = summary.count,
            "Engine shutdown complete"
        );

        outcome
    }
}

impl std::fmt::Debug for MonitorEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorEngine")
            .field("instance", &self.config.engine.instance_name)
            .field("cache", &self.cache.summary())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// OS Signals
// ----------------------------------------------------------------------------

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(target: "dvpn::engine", error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(target: "dvpn::engine", error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(target: "dvpn::engine", "Received SIGINT"),
        _ = terminate => info!(target: "dvpn::engine", "Received SIGTERM"),
    }
}

/// A token cancelled on the first SIGINT or SIGTERM.
pub fn signal_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });
    token
}
