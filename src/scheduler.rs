// ============================================================================
// COLLECTION SCHEDULER
// ============================================================================
// Drives the samplers on a cycle clock:
// - one worker task per domain, so a domain's samples are strictly sequential
// - non-blocking fan-out: a slow domain never delays the others' reports
// - bounded gather per cycle; stragglers are recorded as timeouts
// - per-domain intervals: a domain that is not yet due sits the cycle out
// - failures are counted per (domain, kind) and never abort a cycle
// ============================================================================

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::{Aggregator, CycleResults};
use crate::error::{ConfigError, MonitorError, MonitorResult, SamplerError, SamplerErrorKind};
use crate::samplers::Sampler;
use crate::types::{Domain, FieldMap, Snapshot, Timestamp};
use crate::REPORT_CHANNEL_CAPACITY;

// ----------------------------------------------------------------------------
// Registration
// ----------------------------------------------------------------------------

/// A sampler together with the interval it should run at.
#[derive(Clone)]
pub struct DomainRegistration {
    pub domain: Domain,
    pub interval: Duration,
    pub sampler: Arc<dyn Sampler>,
}

impl DomainRegistration {
    pub fn new(sampler: Arc<dyn Sampler>, interval: Duration) -> Self {
        Self {
            domain: sampler.domain(),
            interval,
            sampler,
        }
    }
}

impl std::fmt::Debug for DomainRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainRegistration")
            .field("domain", &self.domain)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Failure Accounting
// ----------------------------------------------------------------------------

/// Per-domain, per-kind sampling failure counters.
#[derive(Debug, Default)]
pub struct FailureCounters {
    counts: DashMap<(Domain, SamplerErrorKind), AtomicU64>,
}

/// One counter value, as reported by [`FailureCounters::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCount {
    pub domain: Domain,
    pub kind: SamplerErrorKind,
    pub count: u64,
}

impl FailureCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, error: &SamplerError) {
        self.increment(error.domain(), error.kind());
    }

    pub fn increment(&self, domain: Domain, kind: SamplerErrorKind) {
        self.counts
            .entry((domain, kind))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn get(&self, domain: Domain, kind: SamplerErrorKind) -> u64 {
        self.counts
            .get(&(domain, kind))
            .map(|v| v.load(AtomicOrdering::Relaxed))
            .unwrap_or(0)
    }

    pub fn for_domain(&self, domain: Domain) -> u64 {
        SamplerErrorKind::ALL
            .iter()
            .map(|kind| self.get(domain, *kind))
            .sum()
    }

    pub fn total(&self) -> u64 {
        self.counts
            .iter()
            .map(|entry| entry.value().load(AtomicOrdering::Relaxed))
            .sum()
    }

    /// Non-zero counters ordered by domain, then kind.
    pub fn snapshot(&self) -> Vec<FailureCount> {
        let mut out: Vec<_> = self
            .counts
            .iter()
            .map(|entry| {
                let (domain, kind) = *entry.key();
                FailureCount {
                    domain,
                    kind,
                    count: entry.value().load(AtomicOrdering::Relaxed),
                }
            })
            .filter(|c| c.count > 0)
            .collect();
        out.sort_by_key(|c| (c.domain, c.kind));
        out
    }
}

/// Counters shared between the scheduler and its observers.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    failures: FailureCounters,
    cycles_completed: AtomicU64,
}

impl SchedulerStats {
    pub fn failures(&self) -> &FailureCounters {
        &self.failures
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(AtomicOrdering::Relaxed)
    }
}

// ----------------------------------------------------------------------------
// Domain Workers
// ----------------------------------------------------------------------------

/// Outcome of one sampler call, tagged with the cycle that requested it.
#[derive(Debug)]
struct DomainReport {
    cycle: u64,
    domain: Domain,
    sampled_at: Timestamp,
    elapsed: Duration,
    result: Result<FieldMap, SamplerError>,
}

struct WorkerHandle {
    domain: Domain,
    interval: Duration,
    next_due: Option<Instant>,
    trigger: mpsc::Sender<u64>,
    busy: Arc<AtomicBool>,
}

async fn domain_worker(
    sampler: Arc<dyn Sampler>,
    mut triggers: mpsc::Receiver<u64>,
    reports: mpsc::Sender<DomainReport>,
    busy: Arc<AtomicBool>,
) {
    let domain = sampler.domain();

    while let Some(cycle) = triggers.recv().await {
        let started = Instant::now();
        let result = match AssertUnwindSafe(sampler.sample()).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(SamplerError::Panic {
                domain,
                message: panic_message(payload.as_ref()),
            }),
        };

        let report = DomainReport {
            cycle,
            domain,
            sampled_at: Timestamp::now(),
            elapsed: started.elapsed(),
            result,
        };
        let delivered = reports.send(report).await.is_ok();
        busy.store(false, AtomicOrdering::Release);
        if !delivered {
            break;
        }
    }

    debug!(target: "dvpn::scheduler", %domain, "Domain worker exited");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ----------------------------------------------------------------------------
// Scheduler
// ----------------------------------------------------------------------------

/// Invokes registered samplers on their schedules and hands each cycle's
/// results to the [`Aggregator`].
pub struct CollectionScheduler {
    registrations: Vec<DomainRegistration>,
    aggregator: Arc<Aggregator>,
    collection_interval: Duration,
    cycle_timeout: Duration,
    shutdown_timeout: Duration,
    stats: Arc<SchedulerStats>,
}

impl CollectionScheduler {
    pub fn new(aggregator: Arc<Aggregator>, collection_interval: Duration) -> Self {
        Self {
            registrations: Vec::new(),
            aggregator,
            collection_interval,
            cycle_timeout: collection_interval,
            shutdown_timeout: Duration::from_secs(crate::SHUTDOWN_GRACE_PERIOD_SECS),
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    /// Bound on how long a cycle waits for its samplers; capped at the
    /// collection interval.
    pub fn with_cycle_timeout(mut self, timeout: Duration) -> Self {
        self.cycle_timeout = timeout.min(self.collection_interval);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Register a domain. Each domain may be registered once.
    pub fn register(&mut self, registration: DomainRegistration) -> Result<(), ConfigError> {
        if self
            .registrations
            .iter()
            .any(|r| r.domain == registration.domain)
        {
            return Err(ConfigError::invalid_value(
                format!("samplers.{}", registration.domain),
                "domain registered more than once",
            ));
        }
        if registration.interval.is_zero() {
            return Err(ConfigError::invalid_value(
                format!("samplers.{}.interval", registration.domain),
                "must be greater than zero",
            ));
        }
        self.registrations.push(registration);
        self.registrations.sort_by_key(|r| r.domain);
        Ok(())
    }

    pub fn domains(&self) -> Vec<Domain> {
        self.registrations.iter().map(|r| r.domain).collect()
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    pub fn failures(&self) -> &FailureCounters {
        self.stats.failures()
    }

    pub fn cycles_completed(&self) -> u64 {
        self.stats.cycles_completed()
    }

    /// Run until `cancel` fires.
    ///
    /// Returns `SchedulerFatal` when a domain worker is lost, since collection
    /// for that domain can no longer happen.
    pub async fn run(self, cancel: CancellationToken) -> MonitorResult<()> {
        let (report_tx, mut report_rx) = mpsc::channel::<DomainReport>(REPORT_CHANNEL_CAPACITY);
        let mut join_set = JoinSet::new();
        let mut workers = Vec::with_capacity(self.registrations.len());

        for reg in &self.registrations {
            let (trigger_tx, trigger_rx) = mpsc::channel::<u64>(1);
            let busy = Arc::new(AtomicBool::new(false));
            join_set.spawn(domain_worker(
                reg.sampler.clone(),
                trigger_rx,
                report_tx.clone(),
                busy.clone(),
            ));
            workers.push(WorkerHandle {
                domain: reg.domain,
                interval: reg.interval,
                next_due: None,
                trigger: trigger_tx,
                busy,
            });
        }
        drop(report_tx);

        info!(
            target: "dvpn::scheduler",
            domains = ?self.domains(),
            interval_ms = self.collection_interval.as_millis() as u64,
            cycle_timeout_ms = self.cycle_timeout.as_millis() as u64,
            "Collection scheduler started"
        );

        let mut clock = interval(self.collection_interval);
        clock.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycle: u64 = 0;
        let mut last_timestamp: Option<Timestamp> = None;

        let outcome = loop {
            let tick_at = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                Some(joined) = join_set.join_next() => {
                    let reason = match joined {
                        Ok(()) => "domain worker exited unexpectedly".to_string(),
                        Err(e) => format!("domain worker failed: {}", e),
                    };
                    break Err(MonitorError::scheduler_fatal(reason));
                }
                at = clock.tick() => at,
            };
            cycle += 1;

            let mut results = CycleResults::new();
            let mut pending = BTreeSet::new();
            let mut fatal = None;

            // Dispatch to every due domain
            for worker in &mut workers {
                if worker.next_due.map_or(false, |due| tick_at < due) {
                    continue;
                }
                worker.next_due = Some(tick_at + worker.interval);

                if worker.busy.swap(true, AtomicOrdering::AcqRel) {
                    let err = SamplerError::Overrun {
                        domain: worker.domain,
                    };
                    self.record_failure(cycle, &err);
                    results.insert(worker.domain, Err(err));
                    continue;
                }

                match worker.trigger.try_send(cycle) {
                    Ok(()) => {
                        pending.insert(worker.domain);
                    }
                    Err(TrySendError::Full(_)) => {
                        let err = SamplerError::Overrun {
                            domain: worker.domain,
                        };
                        self.record_failure(cycle, &err);
                        results.insert(worker.domain, Err(err));
                    }
                    Err(TrySendError::Closed(_)) => {
                        fatal = Some(format!("worker for '{}' is gone", worker.domain));
                        break;
                    }
                }
            }
            if let Some(reason) = fatal {
                break Err(MonitorError::scheduler_fatal(reason));
            }
            if results.is_empty() && pending.is_empty() {
                // No domain due this tick
                continue;
            }

            // Gather until everyone answered or the cycle times out
            let deadline = sleep(self.cycle_timeout);
            tokio::pin!(deadline);
            while !pending.is_empty() {
                tokio::select! {
                    report = report_rx.recv() => {
                        let Some(report) = report else {
                            fatal = Some("all domain workers are gone".to_string());
                            break;
                        };
                        if report.cycle != cycle || !pending.remove(&report.domain) {
                            debug!(
                                target: "dvpn::scheduler",
                                domain = %report.domain,
                                report_cycle = report.cycle,
                                cycle,
                                elapsed_ms = report.elapsed.as_millis() as u64,
                                "Late report discarded"
                            );
                            continue;
                        }
                        let result = match report.result {
                            Ok(fields) => Ok(Snapshot::new(report.domain, report.sampled_at, fields)),
                            Err(err) => {
                                self.record_failure(cycle, &err);
                                Err(err)
                            }
                        };
                        results.insert(report.domain, result);
                    }
                    _ = &mut deadline => break,
                }
            }
            if let Some(reason) = fatal {
                break Err(MonitorError::scheduler_fatal(reason));
            }

            let timeout_ms = self.cycle_timeout.as_millis() as u64;
            for domain in std::mem::take(&mut pending) {
                let err = SamplerError::timeout(domain, timeout_ms);
                self.record_failure(cycle, &err);
                results.insert(domain, Err(err));
            }

            // Assigned after gathering; strictly increasing so cache keys never collide
            let now = Timestamp::now();
            let timestamp = match last_timestamp {
                Some(prev) if now <= prev => prev.next(),
                _ => now,
            };
            last_timestamp = Some(timestamp);

            let record = self.aggregator.aggregate(timestamp, results);
            self.stats.cycles_completed.fetch_add(1, AtomicOrdering::Relaxed);

            debug!(
                target: "dvpn::scheduler",
                cycle,
                %timestamp,
                domains = record.by_domain().len(),
                alerts = record.alerts().len(),
                "Cycle completed"
            );
        };

        if let Err(e) = &outcome {
            error!(target: "dvpn::scheduler", error = %e, "Collection scheduler stopping on fatal error");
        }

        // Closing the trigger channels lets each worker finish its current sample and exit
        drop(workers);
        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while join_set.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                target: "dvpn::scheduler",
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "In-flight samplers did not finish before the shutdown timeout; aborting"
            );
            join_set.abort_all();
        }

        info!(
            target: "dvpn::scheduler",
            cycles = self.stats.cycles_completed(),
            failures = self.stats.failures().total(),
            "Collection scheduler stopped"
        );

        outcome
    }

    fn record_failure(&self, cycle: u64, err: &SamplerError) {
        self.stats.failures.record(err);
        warn!(
            target: "dvpn::scheduler",
            cycle,
            domain = %err.domain(),
            kind = %err.kind(),
            error = %err,
            "Sample failed"
        );
    }
}

impl std::fmt::Debug for CollectionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionScheduler")
            .field("domains", &self.domains())
            .field("collection_interval", &self.collection_interval)
            .field("cycle_timeout", &self.cycle_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}
