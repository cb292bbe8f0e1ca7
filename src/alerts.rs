// ============================================================================
// ALERT EVALUATION & DELIVERY
// ============================================================================
// - ThresholdTable: static (domain, metric) -> (value, level), read-only
// - evaluate(): pure function, no I/O, no state between calls
// - AlertSink: where a cycle's alert sequence is handed off, once per cycle
// ============================================================================

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::error::ConfigError;
use crate::types::{AlertLevel, AlertRecord, Domain, Snapshot, Timestamp};
use crate::{
    DEFAULT_CPU_THRESHOLD, DEFAULT_DISK_THRESHOLD, DEFAULT_LATENCY_THRESHOLD_MS,
    DEFAULT_MEMORY_THRESHOLD,
};

// ----------------------------------------------------------------------------
// Threshold Table
// ----------------------------------------------------------------------------

/// One configured threshold, as it appears in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub domain: Domain,
    pub metric: CompactString,
    pub value: f64,
    #[serde(default)]
    pub level: AlertLevel,
}

impl ThresholdRule {
    pub fn new(domain: Domain, metric: impl Into<CompactString>, value: f64, level: AlertLevel) -> Self {
        Self {
            domain,
            metric: metric.into(),
            value,
            level,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ThresholdEntry {
    value: f64,
    level: AlertLevel,
}

/// Static mapping from (domain, metric) to threshold value and severity.
///
/// Keys are ordered by domain then metric name, which is the order alerts are
/// emitted in.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdTable {
    entries: BTreeMap<(Domain, CompactString), ThresholdEntry>,
}

impl ThresholdTable {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Build a table, rejecting duplicate keys and non-finite values.
    pub fn from_rules<I>(rules: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = ThresholdRule>,
    {
        let mut entries = BTreeMap::new();
        for rule in rules {
            if !rule.value.is_finite() {
                return Err(ConfigError::invalid_value(
                    format!("thresholds.{}.{}", rule.domain, rule.metric),
                    "threshold must be a finite number",
                ));
            }
            let key = (rule.domain, rule.metric.clone());
            if entries.contains_key(&key) {
                return Err(ConfigError::DuplicateThreshold {
                    domain: rule.domain,
                    metric: rule.metric.to_string(),
                });
            }
            entries.insert(
                key,
                ThresholdEntry {
                    value: rule.value,
                    level: rule.level,
                },
            );
        }
        Ok(Self { entries })
    }

    /// Built-in rules used when no configuration is available.
    pub fn default_rules() -> Vec<ThresholdRule> {
        vec![
            ThresholdRule::new(Domain::System, "cpu", DEFAULT_CPU_THRESHOLD, AlertLevel::Warning),
            ThresholdRule::new(Domain::System, "memory", DEFAULT_MEMORY_THRESHOLD, AlertLevel::Warning),
            ThresholdRule::new(Domain::System, "disk", DEFAULT_DISK_THRESHOLD, AlertLevel::Critical),
            ThresholdRule::new(Domain::Tunnel, "latency", DEFAULT_LATENCY_THRESHOLD_MS, AlertLevel::Warning),
        ]
    }

    pub fn get(&self, domain: Domain, metric: &str) -> Option<(f64, AlertLevel)> {
        // BTreeMap lookup needs an owned tuple key
        self.entries
            .get(&(domain, CompactString::from(metric)))
            .map(|e| (e.value, e.level))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All rules in evaluation order.
    pub fn rules(&self) -> Vec<ThresholdRule> {
        self.entries
            .iter()
            .map(|((domain, metric), e)| ThresholdRule::new(*domain, metric.clone(), e.value, e.level))
            .collect()
    }
}

impl Default for ThresholdTable {
    fn default() -> Self {
        // Built-in rules are distinct and finite.
        Self::from_rules(Self::default_rules()).unwrap_or_else(|_| Self::empty())
    }
}

// ----------------------------------------------------------------------------
// Evaluator
// ----------------------------------------------------------------------------

/// Derive the alerts for one cycle.
///
/// A `(domain, metric)` pair is considered only when it is present both in the
/// table and in that domain's snapshot; an alert fires when the observed value
/// is strictly greater than the threshold. Output is ordered by domain, then
/// metric name.
pub fn evaluate(snapshots: &BTreeMap<Domain, Snapshot>, table: &ThresholdTable) -> Vec<AlertRecord> {
    let mut alerts = Vec::new();

    for ((domain, metric), entry) in &table.entries {
        let Some(observed) = snapshots.get(domain).and_then(|s| s.get(metric)) else {
            continue;
        };

        // NaN compares false and never fires
        if observed > entry.value {
            alerts.push(AlertRecord {
                level: entry.level,
                domain: *domain,
                metric: metric.clone(),
                observed_value: observed,
                threshold_value: entry.value,
                message: format!(
                    "High {} {}: {} (threshold {})",
                    domain, metric, observed, entry.value
                ),
            });
        }
    }

    alerts
}

// ----------------------------------------------------------------------------
// Alert Sinks
// ----------------------------------------------------------------------------

/// Receives the ordered alert sequence of one cycle.
///
/// Called exactly once per cycle that produced alerts. Implementations must not
/// block: the caller is the collection loop.
pub trait AlertSink: Send + Sync {
    fn deliver(&self, timestamp: Timestamp, alerts: &[AlertRecord]);
}

/// Writes each alert as a structured log event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn deliver(&self, timestamp: Timestamp, alerts: &[AlertRecord]) {
        for alert in alerts {
            match alert.level {
                AlertLevel::Warning => warn!(
                    target: "dvpn::alerts",
                    %timestamp,
                    domain = %alert.domain,
                    metric = %alert.metric,
                    observed = alert.observed_value,
                    threshold = alert.threshold_value,
                    "{}", alert.message
                ),
                AlertLevel::Critical => error!(
                    target: "dvpn::alerts",
                    %timestamp,
                    domain = %alert.domain,
                    metric = %alert.metric,
                    observed = alert.observed_value,
                    threshold = alert.threshold_value,
                    "{}", alert.message
                ),
            }
        }
    }
}

/// Alerts of one cycle, as handed to an external notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertBatch {
    pub timestamp: Timestamp,
    pub alerts: Vec<AlertRecord>,
}

/// Forwards each cycle's alerts over a bounded channel.
///
/// A full or closed channel drops the batch; there is no retry.
#[derive(Debug, Clone)]
pub struct ChannelAlertSink {
    tx: mpsc::Sender<AlertBatch>,
}

impl ChannelAlertSink {
    pub fn new(tx: mpsc::Sender<AlertBatch>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AlertBatch>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelAlertSink {
    fn deliver(&self, timestamp: Timestamp, alerts: &[AlertRecord]) {
        let batch = AlertBatch {
            timestamp,
            alerts: alerts.to_vec(),
        };
        if let Err(e) = self.tx.try_send(batch) {
            warn!(
                target: "dvpn::alerts",
                %timestamp,
                dropped = alerts.len(),
                error = %e,
                "Alert batch dropped"
            );
        }
    }
}

/// Delivers to every inner sink, in order.
#[derive(Clone, Default)]
pub struct FanoutAlertSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanoutAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn push(&mut self, sink: Arc<dyn AlertSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl AlertSink for FanoutAlertSink {
    fn deliver(&self, timestamp: Timestamp, alerts: &[AlertRecord]) {
        for sink in &self.sinks {
            sink.deliver(timestamp, alerts);
        }
    }
}

impl Debug for FanoutAlertSink {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutAlertSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldMap;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use test_case::test_case;

    fn snap(domain: Domain, fields: &[(&str, f64)]) -> Snapshot {
        let fields: FieldMap = fields.iter().map(|(k, v)| (CompactString::from(*k), *v)).collect();
        Snapshot::new(domain, Timestamp::from_secs(1), fields)
    }

    fn snapshots(items: Vec<Snapshot>) -> BTreeMap<Domain, Snapshot> {
        items.into_iter().map(|s| (s.domain(), s)).collect()
    }

    #[test_case(80.0, false ; "equal to threshold does not fire")]
    #[test_case(81.0, true ; "one unit above fires")]
    #[test_case(79.0, false ; "below threshold does not fire")]
    #[test_case(f64::NAN, false ; "nan never fires")]
    fn test_threshold_boundary(observed: f64, fires: bool) {
        let table = ThresholdTable::from_rules(vec![ThresholdRule::new(
            Domain::System,
            "cpu",
            80.0,
            AlertLevel::Warning,
        )])
        .unwrap();
        let alerts = evaluate(&snapshots(vec![snap(Domain::System, &[("cpu", observed)])]), &table);
        assert_eq!(alerts.len(), usize::from(fires));
    }

    #[test]
    fn test_alert_fields_and_severity() {
        let table = ThresholdTable::default();
        let alerts = evaluate(
            &snapshots(vec![snap(Domain::System, &[("cpu", 85.0), ("disk", 95.5), ("memory", 10.0)])]),
            &table,
        );

        assert_eq!(
            alerts,
            vec![
                AlertRecord {
                    level: AlertLevel::Warning,
                    domain: Domain::System,
                    metric: "cpu".into(),
                    observed_value: 85.0,
                    threshold_value: 80.0,
                    message: "High system cpu: 85 (threshold 80)".into(),
                },
                AlertRecord {
                    level: AlertLevel::Critical,
                    domain: Domain::System,
                    metric: "disk".into(),
                    observed_value: 95.5,
                    threshold_value: 90.0,
                    message: "High system disk: 95.5 (threshold 90)".into(),
                },
            ]
        );
    }

    #[test]
    fn test_order_is_domain_then_metric() {
        let table = ThresholdTable::from_rules(vec![
            ThresholdRule::new(Domain::LedgerPeer, "memory", 1.0, AlertLevel::Warning),
            ThresholdRule::new(Domain::Tunnel, "latency", 1.0, AlertLevel::Warning),
            ThresholdRule::new(Domain::System, "memory", 1.0, AlertLevel::Warning),
            ThresholdRule::new(Domain::System, "cpu", 1.0, AlertLevel::Critical),
        ])
        .unwrap();
        let alerts = evaluate(
            &snapshots(vec![
                snap(Domain::LedgerPeer, &[("memory", 5.0)]),
                snap(Domain::Tunnel, &[("latency", 5.0)]),
                snap(Domain::System, &[("memory", 5.0), ("cpu", 5.0)]),
            ]),
            &table,
        );
        let keys: Vec<_> = alerts.iter().map(|a| (a.domain, a.metric.as_str())).collect();
        assert_eq!(
            keys,
            vec![
                (Domain::System, "cpu"),
                (Domain::System, "memory"),
                (Domain::Tunnel, "latency"),
                (Domain::LedgerPeer, "memory"),
            ]
        );
    }

    #[test]
    fn test_missing_domain_and_metric_are_skipped() {
        let table = ThresholdTable::default();
        // Tunnel absent, System lacks memory and disk
        let alerts = evaluate(&snapshots(vec![snap(Domain::System, &[("cpu", 10.0)])]), &table);
        assert!(alerts.is_empty());

        let alerts = evaluate(&BTreeMap::new(), &table);
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_duplicate_and_non_finite_rules_rejected() {
        let dup = ThresholdTable::from_rules(vec![
            ThresholdRule::new(Domain::System, "cpu", 80.0, AlertLevel::Warning),
            ThresholdRule::new(Domain::System, "cpu", 90.0, AlertLevel::Critical),
        ]);
        assert!(matches!(dup, Err(ConfigError::DuplicateThreshold { .. })));

        let inf = ThresholdTable::from_rules(vec![ThresholdRule::new(
            Domain::System,
            "cpu",
            f64::INFINITY,
            AlertLevel::Warning,
        )]);
        assert!(matches!(inf, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_default_table() {
        let table = ThresholdTable::default();
        assert_eq!(table.len(), 4);
        assert_eq!(table.get(Domain::System, "cpu"), Some((80.0, AlertLevel::Warning)));
        assert_eq!(table.get(Domain::System, "memory"), Some((80.0, AlertLevel::Warning)));
        assert_eq!(table.get(Domain::System, "disk"), Some((90.0, AlertLevel::Critical)));
        assert_eq!(table.get(Domain::Tunnel, "latency"), Some((1000.0, AlertLevel::Warning)));
        assert_eq!(table.get(Domain::LedgerPeer, "cpu"), None);
    }

    #[test]
    fn test_channel_sink_forwards_and_drops_when_full() {
        let (sink, mut rx) = ChannelAlertSink::channel(1);
        let alert = AlertRecord {
            level: AlertLevel::Warning,
            domain: Domain::System,
            metric: "cpu".into(),
            observed_value: 90.0,
            threshold_value: 80.0,
            message: "High system cpu: 90 (threshold 80)".into(),
        };
        sink.deliver(Timestamp::from_secs(1), std::slice::from_ref(&alert));
        sink.deliver(Timestamp::from_secs(2), std::slice::from_ref(&alert));

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.timestamp, Timestamp::from_secs(1));
        assert_eq!(batch.alerts, vec![alert]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_fanout_delivers_to_all() {
        let (a, mut rx_a) = ChannelAlertSink::channel(4);
        let (b, mut rx_b) = ChannelAlertSink::channel(4);
        let fanout = FanoutAlertSink::new().with(Arc::new(a)).with(Arc::new(b));
        fanout.deliver(Timestamp::from_secs(3), &[]);
        assert_eq!(rx_a.try_recv().unwrap().timestamp, Timestamp::from_secs(3));
        assert_eq!(rx_b.try_recv().unwrap().timestamp, Timestamp::from_secs(3));
    }

    proptest! {
        #[test]
        fn prop_evaluate_is_deterministic(
            cpu in 0.0f64..200.0,
            memory in 0.0f64..200.0,
            latency in 0.0f64..5000.0,
        ) {
            let table = ThresholdTable::default();
            let input = snapshots(vec![
                snap(Domain::System, &[("cpu", cpu), ("memory", memory)]),
                snap(Domain::Tunnel, &[("latency", latency)]),
            ]);
            let first = evaluate(&input, &table);
            let second = evaluate(&input, &table);
            prop_assert_eq!(&first, &second);
            for alert in &first {
                prop_assert!(alert.observed_value > alert.threshold_value);
            }
        }
    }
}
