// ============================================================================
// METRICS CACHE
// ============================================================================
// Time-ordered, in-memory store of composite records:
// - BTreeMap keyed by cycle timestamp (O(log n) insert, ordered iteration)
// - Age-based eviction, driven by a separate task on its own cadence
// - O(1) summary from counters maintained under the same lock as the map
// - Insert, evict and every read share one RwLock, so readers only ever see
//   whole operations
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::types::{CompositeRecord, Timestamp};

/// Point-in-time view of the cache bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheSummary {
    pub count: usize,
    pub oldest_timestamp: Option<Timestamp>,
    pub newest_timestamp: Option<Timestamp>,
}

#[derive(Debug, Default)]
struct CacheState {
    records: BTreeMap<Timestamp, Arc<CompositeRecord>>,
    summary: CacheSummary,
}

impl CacheState {
    fn refresh_bounds(&mut self) {
        self.summary.count = self.records.len();
        self.summary.oldest_timestamp = self.records.keys().next().copied();
        self.summary.newest_timestamp = self.records.keys().next_back().copied();
    }
}

/// Ordered mapping from cycle timestamp to record, with a retention window.
#[derive(Debug)]
pub struct MetricsCache {
    state: RwLock<CacheState>,
    retention_window: Duration,
}

impl MetricsCache {
    pub fn new(retention_window: Duration) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            retention_window,
        }
    }

    #[inline]
    pub fn retention_window(&self) -> Duration {
        self.retention_window
    }

    /// Insert a record, replacing any record with the same timestamp.
    /// Returns the replaced record.
    pub fn insert(&self, record: CompositeRecord) -> Option<Arc<CompositeRecord>> {
        self.insert_arc(Arc::new(record))
    }

    pub fn insert_arc(&self, record: Arc<CompositeRecord>) -> Option<Arc<CompositeRecord>> {
        let ts = record.timestamp();
        let mut state = self.state.write();
        let replaced = state.records.insert(ts, record);

        if replaced.is_none() {
            state.summary.count += 1;
        }
        state.summary.oldest_timestamp = Some(match state.summary.oldest_timestamp {
            Some(oldest) => oldest.min(ts),
            None => ts,
        });
        state.summary.newest_timestamp = Some(match state.summary.newest_timestamp {
            Some(newest) => newest.max(ts),
            None => ts,
        });

        replaced
    }

    /// Remove every record older than `retention_window` as seen from `now`.
    /// A record aged exactly the window is kept. Returns the number removed.
    pub fn evict_older_than(&self, retention_window: Duration, now: Timestamp) -> usize {
        let cutoff = now.sub_duration(retention_window);
        let mut state = self.state.write();

        if state.summary.oldest_timestamp.map_or(true, |oldest| oldest >= cutoff) {
            return 0;
        }

        let retained = state.records.split_off(&cutoff);
        let evicted = std::mem::replace(&mut state.records, retained).len();
        state.refresh_bounds();
        evicted
    }

    /// Evict against the configured window.
    pub fn evict_expired(&self, now: Timestamp) -> usize {
        self.evict_older_than(self.retention_window, now)
    }

    pub fn latest(&self) -> Option<Arc<CompositeRecord>> {
        self.state
            .read()
            .records
            .values()
            .next_back()
            .cloned()
    }

    pub fn summary(&self) -> CacheSummary {
        self.state.read().summary
    }

    pub fn get(&self, timestamp: Timestamp) -> Option<Arc<CompositeRecord>> {
        self.state.read().records.get(&timestamp).cloned()
    }

    /// All retained records, oldest first.
    pub fn records(&self) -> Vec<Arc<CompositeRecord>> {
        self.state.read().records.values().cloned().collect()
    }

    /// Records with `start <= timestamp <= end`, oldest first.
    pub fn range(&self, start: Timestamp, end: Timestamp) -> Vec<Arc<CompositeRecord>> {
        if start > end {
            return Vec::new();
        }
        self.state
            .read()
            .records
            .range(start..=end)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().summary.count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ----------------------------------------------------------------------------
// Eviction Task
// ----------------------------------------------------------------------------

/// Evict expired records every `every` until `cancel` fires.
pub async fn run_eviction_loop(cache: Arc<MetricsCache>, every: Duration, cancel: CancellationToken) {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        target: "dvpn::cache",
        every_ms = every.as_millis() as u64,
        retention_secs = cache.retention_window().as_secs(),
        "Eviction task started"
    );

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let evicted = cache.evict_expired(Timestamp::now());
                if evicted > 0 {
                    let summary = cache.summary();
                    debug!(
                        target: "dvpn::cache",
                        evicted,
                        remaining = summary.count,
                        "Expired records evicted"
                    );
                }
            }
            _ = cancel.cancelled() => {
                info!(target: "dvpn::cache", "Eviction task stopped");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn record(secs: i64) -> CompositeRecord {
        CompositeRecord::new(Timestamp::from_secs(secs), BTreeMap::new(), Vec::new())
    }

    #[test]
    fn test_empty_cache() {
        let cache = MetricsCache::new(Duration::from_secs(60));
        assert!(cache.is_empty());
        assert!(cache.latest().is_none());
        assert_eq!(cache.summary(), CacheSummary::default());
        assert_eq!(cache.evict_expired(Timestamp::from_secs(1_000)), 0);
    }

    #[test]
    fn test_insert_keeps_order_and_summary() {
        let cache = MetricsCache::new(Duration::from_secs(60));
        cache.insert(record(20));
        cache.insert(record(10));
        cache.insert(record(30));

        let ts: Vec<_> = cache.records().iter().map(|r| r.timestamp().as_secs()).collect();
        assert_eq!(ts, vec![10, 20, 30]);
        assert_eq!(
            cache.summary(),
            CacheSummary {
                count: 3,
                oldest_timestamp: Some(Timestamp::from_secs(10)),
                newest_timestamp: Some(Timestamp::from_secs(30)),
            }
        );
        assert_eq!(cache.latest().unwrap().timestamp(), Timestamp::from_secs(30));
    }

    #[test]
    fn test_same_timestamp_latest_write_wins() {
        let cache = MetricsCache::new(Duration::from_secs(60));
        assert!(cache.insert(record(5)).is_none());

        let alert = crate::types::AlertRecord {
            level: crate::types::AlertLevel::Critical,
            domain: crate::types::Domain::System,
            metric: "disk".into(),
            observed_value: 99.0,
            threshold_value: 90.0,
            message: "High system disk: 99 (threshold 90)".into(),
        };
        let second = CompositeRecord::new(Timestamp::from_secs(5), BTreeMap::new(), vec![alert]);
        let replaced = cache.insert(second);

        assert!(replaced.is_some());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.summary().count, 1);
        assert_eq!(cache.get(Timestamp::from_secs(5)).unwrap().alerts().len(), 1);
    }

    #[test]
    fn test_eviction_boundary_is_inclusive() {
        let cache = MetricsCache::new(Duration::from_secs(10));
        for s in [0, 5, 10, 15] {
            cache.insert(record(s));
        }
        // now=20, window=10: age(10) == 10 is kept, age(5) == 15 is evicted
        let evicted = cache.evict_expired(Timestamp::from_secs(20));
        assert_eq!(evicted, 2);
        assert_eq!(
            cache.summary(),
            CacheSummary {
                count: 2,
                oldest_timestamp: Some(Timestamp::from_secs(10)),
                newest_timestamp: Some(Timestamp::from_secs(15)),
            }
        );
    }

    #[test]
    fn test_evict_everything_clears_bounds() {
        let cache = MetricsCache::new(Duration::from_secs(1));
        cache.insert(record(1));
        cache.insert(record(2));
        assert_eq!(cache.evict_expired(Timestamp::from_secs(100)), 2);
        assert_eq!(cache.summary(), CacheSummary::default());
        assert!(cache.latest().is_none());
    }

    #[test]
    fn test_range_query() {
        let cache = MetricsCache::new(Duration::from_secs(60));
        for s in 1..=5 {
            cache.insert(record(s));
        }
        let got: Vec<_> = cache
            .range(Timestamp::from_secs(2), Timestamp::from_secs(4))
            .iter()
            .map(|r| r.timestamp().as_secs())
            .collect();
        assert_eq!(got, vec![2, 3, 4]);
        assert!(cache.range(Timestamp::from_secs(4), Timestamp::from_secs(2)).is_empty());
    }

    #[test]
    fn test_concurrent_insert_and_evict_keep_summary_consistent() {
        let cache = Arc::new(MetricsCache::new(Duration::from_secs(100)));
        for s in 0..1_000 {
            cache.insert(record(s));
        }

        let writer = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for s in 1_000..2_000 {
                    cache.insert(record(s));
                }
            })
        };
        let evictor = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for now in (1_000..2_100).step_by(50) {
                    cache.evict_expired(Timestamp::from_secs(now));
                }
            })
        };
        let reader = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    let summary = cache.summary();
                    assert!(summary.count <= 2_000);
                    match (summary.oldest_timestamp, summary.newest_timestamp) {
                        (Some(oldest), Some(newest)) => {
                            assert!(oldest <= newest);
                            let span = (newest.as_secs() - oldest.as_secs() + 1) as usize;
                            assert!(summary.count <= span);
                        }
                        (None, None) => assert_eq!(summary.count, 0),
                        other => panic!("half-applied summary: {:?}", other),
                    }
                }
            })
        };

        writer.join().unwrap();
        evictor.join().unwrap();
        reader.join().unwrap();

        let summary = cache.summary();
        assert_eq!(summary.count, cache.records().len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_loop_stops_on_cancel() {
        let cache = Arc::new(MetricsCache::new(Duration::from_secs(1)));
        cache.insert(record(1));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_eviction_loop(cache.clone(), Duration::from_secs(5), cancel.clone()));

        // First tick fires immediately and evicts the ancient record
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    proptest! {
        #[test]
        fn prop_eviction_bound_holds(
            stamps in proptest::collection::vec(0i64..10_000, 0..200),
            window in 0u64..5_000,
            now in 0i64..20_000,
        ) {
            let cache = MetricsCache::new(Duration::from_secs(window));
            for s in &stamps {
                cache.insert(record(*s));
            }
            cache.evict_older_than(Duration::from_secs(window), Timestamp::from_secs(now));

            let now_ts = Timestamp::from_secs(now);
            for r in cache.records() {
                prop_assert!(now_ts.duration_since(r.timestamp()) <= Duration::from_secs(window));
            }
            // nothing young enough was dropped
            let expected = stamps
                .iter()
                .copied()
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .filter(|s| now - *s <= window as i64)
                .count();
            prop_assert_eq!(cache.len(), expected);
            prop_assert_eq!(cache.summary().count, cache.records().len());
        }
    }
}
