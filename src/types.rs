// ============================================================================
// CORE TYPE SYSTEM
// ============================================================================
// The data that flows from samplers through the aggregator into the cache:
// - Timestamp: nanosecond wall-clock instant, totally ordered (cache key)
// - Snapshot: one domain's sample at one instant
// - CompositeRecord: one collection cycle, all domains merged, plus alerts
// - AlertRecord: one triggered threshold
// ============================================================================

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Timestamp - Nanosecond Precision Time Handling
// ----------------------------------------------------------------------------

/// Timestamp in nanoseconds since Unix epoch.
/// Using i64 allows representing times from ~1677 to ~2262.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);

    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Current wall-clock time.
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000_000
    }

    /// Seconds since epoch as a float, for exposition formats.
    #[inline]
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Duration elapsed from `earlier` to `self`, zero if `earlier` is later.
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_nanos(duration)))
    }

    #[inline]
    pub fn sub_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_nanos(duration)))
    }

    /// The next representable instant.
    #[inline]
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    #[inline]
    pub fn is_within(&self, start: Timestamp, end: Timestamp) -> bool {
        self.0 >= start.0 && self.0 <= end.0
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_nanos_opt().unwrap_or(0))
    }
}

fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%dT%H:%M:%S%.3fZ"))
    }
}

impl From<i64> for Timestamp {
    #[inline]
    fn from(nanos: i64) -> Self {
        Self(nanos)
    }
}

impl From<Timestamp> for i64 {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        let duration = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

// ----------------------------------------------------------------------------
// Domain - Metric Source Category
// ----------------------------------------------------------------------------

/// One metric source category. Declaration order is the canonical ordering
/// used for records and alert sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// Host resources (CPU, memory, disk, network)
    System,
    /// The VPN tunnel
    #[serde(alias = "vpn")]
    Tunnel,
    /// The blockchain peer process
    #[serde(alias = "ledger", alias = "blockchain")]
    LedgerPeer,
}

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::System, Domain::Tunnel, Domain::LedgerPeer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::System => "system",
            Domain::Tunnel => "tunnel",
            Domain::LedgerPeer => "ledger_peer",
        }
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Domain::System),
            "tunnel" | "vpn" => Ok(Domain::Tunnel),
            "ledger_peer" | "ledgerpeer" | "ledger" | "blockchain" => Ok(Domain::LedgerPeer),
            other => Err(format!("unknown domain '{}'", other)),
        }
    }
}

// ----------------------------------------------------------------------------
// Snapshot - One Domain, One Instant
// ----------------------------------------------------------------------------

/// Metric name to value. Ordered so iteration is deterministic.
pub type FieldMap = BTreeMap<CompactString, f64>;

/// One domain's sample at one instant. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    domain: Domain,
    timestamp: Timestamp,
    fields: FieldMap,
}

impl Snapshot {
    pub fn new(domain: Domain, timestamp: Timestamp, fields: FieldMap) -> Self {
        Self {
            domain,
            timestamp,
            fields,
        }
    }

    #[inline]
    pub fn domain(&self) -> Domain {
        self.domain
    }

    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    #[inline]
    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    /// Value of one metric, if this sample carried it.
    pub fn get(&self, metric: &str) -> Option<f64> {
        self.fields.get(metric).copied()
    }
}

// ----------------------------------------------------------------------------
// Alerts
// ----------------------------------------------------------------------------

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

impl Default for AlertLevel {
    fn default() -> Self {
        AlertLevel::Warning
    }
}

impl Display for AlertLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warning" | "warn" => Ok(AlertLevel::Warning),
            "critical" | "crit" => Ok(AlertLevel::Critical),
            other => Err(format!("unknown alert level '{}'", other)),
        }
    }
}

/// One triggered threshold. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub level: AlertLevel,
    pub domain: Domain,
    pub metric: CompactString,
    pub observed_value: f64,
    pub threshold_value: f64,
    pub message: String,
}

// ----------------------------------------------------------------------------
// CompositeRecord - One Collection Cycle
// ----------------------------------------------------------------------------

/// Merged, timestamped union of all domains' snapshots for one cycle.
///
/// Domains whose sample failed are absent from `by_domain`; nothing is
/// zero-filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeRecord {
    timestamp: Timestamp,
    by_domain: BTreeMap<Domain, Snapshot>,
    alerts: Vec<AlertRecord>,
}

impl CompositeRecord {
    pub fn new(
        timestamp: Timestamp,
        by_domain: BTreeMap<Domain, Snapshot>,
        alerts: Vec<AlertRecord>,
    ) -> Self {
        Self {
            timestamp,
            by_domain,
            alerts,
        }
    }

    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    #[inline]
    pub fn by_domain(&self) -> &BTreeMap<Domain, Snapshot> {
        &self.by_domain
    }

    #[inline]
    pub fn alerts(&self) -> &[AlertRecord] {
        &self.alerts
    }

    pub fn snapshot(&self, domain: Domain) -> Option<&Snapshot> {
        self.by_domain.get(&domain)
    }

    pub fn contains(&self, domain: Domain) -> bool {
        self.by_domain.contains_key(&domain)
    }

    pub fn value(&self, domain: Domain, metric: &str) -> Option<f64> {
        self.by_domain.get(&domain).and_then(|s| s.get(metric))
    }

    pub fn domains(&self) -> impl Iterator<Item = Domain> + '_ {
        self.by_domain.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_arithmetic() {
        let ts = Timestamp::from_secs(100);
        assert_eq!(ts.add_duration(Duration::from_secs(5)), Timestamp::from_secs(105));
        assert_eq!(ts.sub_duration(Duration::from_secs(5)), Timestamp::from_secs(95));
        assert_eq!(Timestamp::from_secs(105).duration_since(ts), Duration::from_secs(5));
        assert_eq!(ts.duration_since(Timestamp::from_secs(105)), Duration::ZERO);
        assert_eq!(ts.next().as_nanos(), ts.as_nanos() + 1);
    }

    #[test]
    fn test_timestamp_saturates_on_huge_duration() {
        let ts = Timestamp::from_secs(1);
        assert_eq!(ts.sub_duration(Duration::MAX).as_nanos(), i64::MIN + 1 + 1_000_000_000);
        assert_eq!(ts.add_duration(Duration::MAX).as_nanos(), i64::MAX);
    }

    #[test]
    fn test_timestamp_datetime_roundtrip() {
        let ts = Timestamp::from_millis(1_700_000_000_123);
        assert_eq!(Timestamp::from_datetime(ts.to_datetime()), ts);
        assert_eq!(ts.to_string(), "2023-11-14T22:13:20.123Z");
    }

    #[test]
    fn test_domain_parsing_and_order() {
        assert_eq!("vpn".parse::<Domain>().unwrap(), Domain::Tunnel);
        assert_eq!("Blockchain".parse::<Domain>().unwrap(), Domain::LedgerPeer);
        assert!("disk".parse::<Domain>().is_err());
        assert!(Domain::System < Domain::Tunnel);
        assert!(Domain::Tunnel < Domain::LedgerPeer);
    }

    #[test]
    fn test_domain_serde_names() {
        assert_eq!(serde_json::to_string(&Domain::LedgerPeer).unwrap(), "\"ledger_peer\"");
        let parsed: Domain = serde_json::from_str("\"vpn\"").unwrap();
        assert_eq!(parsed, Domain::Tunnel);
    }

    #[test]
    fn test_record_lookup() {
        let mut fields = FieldMap::new();
        fields.insert("cpu".into(), 42.0);
        let snap = Snapshot::new(Domain::System, Timestamp::from_secs(1), fields);

        let mut by_domain = BTreeMap::new();
        by_domain.insert(Domain::System, snap);
        let record = CompositeRecord::new(Timestamp::from_secs(2), by_domain, Vec::new());

        assert_eq!(record.value(Domain::System, "cpu"), Some(42.0));
        assert_eq!(record.value(Domain::System, "memory"), None);
        assert_eq!(record.value(Domain::Tunnel, "cpu"), None);
        assert!(record.contains(Domain::System));
        assert_eq!(record.domains().collect::<Vec<_>>(), vec![Domain::System]);
    }
}
