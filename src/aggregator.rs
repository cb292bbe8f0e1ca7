// ============================================================================
// AGGREGATOR
// ============================================================================
// Turns one cycle's per-domain results into a CompositeRecord:
// - successful snapshots only, failed domains are simply absent
// - alerts evaluated against the process-wide threshold table
// - record written into the cache, alerts handed to the sink once
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error};

use crate::alerts::{evaluate, AlertSink, ThresholdTable};
use crate::cache::MetricsCache;
use crate::error::SamplerError;
use crate::types::{CompositeRecord, Domain, Snapshot, Timestamp};

/// Per-domain outcome of one cycle, as produced by the scheduler.
pub type CycleResults = BTreeMap<Domain, Result<Snapshot, SamplerError>>;

pub struct Aggregator {
    cache: Arc<MetricsCache>,
    thresholds: Arc<ThresholdTable>,
    sink: Arc<dyn AlertSink>,
}

impl Aggregator {
    pub fn new(cache: Arc<MetricsCache>, thresholds: Arc<ThresholdTable>, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            cache,
            thresholds,
            sink,
        }
    }

    pub fn cache(&self) -> &Arc<MetricsCache> {
        &self.cache
    }

    pub fn thresholds(&self) -> &Arc<ThresholdTable> {
        &self.thresholds
    }

    /// Merge one cycle, store it and notify the sink.
    pub fn aggregate(&self, timestamp: Timestamp, results: CycleResults) -> Arc<CompositeRecord> {
        let mut by_domain = BTreeMap::new();
        let mut failed = 0usize;

        for (domain, result) in results {
            match result {
                Ok(snapshot) => {
                    by_domain.insert(domain, snapshot);
                }
                Err(_) => failed += 1,
            }
        }

        let alerts = evaluate(&by_domain, &self.thresholds);
        let record = Arc::new(CompositeRecord::new(timestamp, by_domain, alerts));

        if let Some(replaced) = self.cache.insert_arc(record.clone()) {
            error!(
                target: "dvpn::aggregator",
                %timestamp,
                replaced_domains = replaced.by_domain().len(),
                "Composite record overwritten on equal timestamp (scheduler bug)"
            );
        }

        if !record.alerts().is_empty() {
            self.sink.deliver(timestamp, record.alerts());
        }

        debug!(
            target: "dvpn::aggregator",
            %timestamp,
            domains = record.by_domain().len(),
            failed,
            alerts = record.alerts().len(),
            "Cycle aggregated"
        );

        record
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("cache", &self.cache.summary())
            .field("thresholds", &self.thresholds.len())
            .finish_non_exhaustive()
    }
}
