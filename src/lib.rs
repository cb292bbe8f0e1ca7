//! # dvpn-monitor - Metrics Core for dVPN-IoT Nodes
//!
//! Periodically samples host, VPN tunnel and ledger-peer metrics, merges each
//! collection cycle into one timestamped record, evaluates the record against
//! a static threshold table and retains records for a bounded window.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                             DVPN MONITOR                                 │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  SAMPLERS → SCHEDULER → AGGREGATOR → { METRICS CACHE, ALERT SINK }       │
//! │                                            ↑                             │
//! │                         EVICTION TASK ─────┘      EXPORTER (scrape)      │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The core (scheduler, aggregator, cache, alert evaluator) never performs I/O
//! itself: samplers are injected through the [`Sampler`] trait and alerts leave
//! through the [`AlertSink`] trait.

// ============================================================================
// SECTION 1: MODULES
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod aggregator;
pub mod alerts;
pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod exporter;
pub mod logging;
pub mod samplers;
pub mod scheduler;
pub mod types;

pub use aggregator::Aggregator;
pub use alerts::{
    evaluate, AlertSink, ChannelAlertSink, FanoutAlertSink, ThresholdRule, ThresholdTable,
    TracingAlertSink,
};
pub use cache::{CacheSummary, MetricsCache};
pub use config::MonitorConfig;
pub use engine::MonitorEngine;
pub use error::{ConfigError, MonitorError, MonitorResult, SamplerError, SamplerErrorKind};
pub use samplers::{FnSampler, Sampler};
pub use scheduler::{CollectionScheduler, DomainRegistration, FailureCounters};
pub use types::{AlertLevel, AlertRecord, CompositeRecord, Domain, FieldMap, Snapshot, Timestamp};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "dvpn-monitor";
pub const ENGINE_FULL_NAME: &str = "dVPN-IoT Metrics Monitor";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default collection interval (seconds)
pub const DEFAULT_COLLECTION_INTERVAL_SECS: u64 = 15;

/// Minimum allowed collection interval (milliseconds)
pub const MIN_COLLECTION_INTERVAL_MS: u64 = 100;

/// Default retention window (seconds) - 7 days
pub const DEFAULT_RETENTION_SECS: u64 = 7 * 24 * 3600;

/// Default cadence of the eviction task (seconds)
pub const DEFAULT_EVICTION_INTERVAL_SECS: u64 = 60;

/// Default bound on how long one cycle waits for its samplers (seconds)
pub const DEFAULT_CYCLE_TIMEOUT_SECS: u64 = 10;

/// Grace period for in-flight samplers on shutdown (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 30;

// ----------------------------------------------------------------------------
// Default Alert Thresholds
// ----------------------------------------------------------------------------

pub const DEFAULT_CPU_THRESHOLD: f64 = 80.0;
pub const DEFAULT_MEMORY_THRESHOLD: f64 = 80.0;
pub const DEFAULT_DISK_THRESHOLD: f64 = 90.0;

/// Tunnel round-trip latency threshold (milliseconds)
pub const DEFAULT_LATENCY_THRESHOLD_MS: f64 = 1000.0;

// ----------------------------------------------------------------------------
// Network & Protocol
// ----------------------------------------------------------------------------

/// Default scrape endpoint listen address
pub const DEFAULT_EXPORTER_LISTEN: &str = "0.0.0.0:9105";

/// Capacity of the channel between domain workers and the cycle loop
pub const REPORT_CHANNEL_CAPACITY: usize = 256;

/// Default capacity for channel-backed alert sinks
pub const ALERT_QUEUE_CAPACITY: usize = 1024;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "DVPN_MONITOR_";
