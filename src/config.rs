// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration:
// - TOML (or JSON) file
// - Environment variable overrides (DVPN_MONITOR_SECTION__KEY)
// - Validation before use
// - Built-in defaults when nothing else is available
// ============================================================================

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::alerts::{ThresholdRule, ThresholdTable};
use crate::error::ConfigError;
use crate::types::Domain;
use crate::{
    DEFAULT_COLLECTION_INTERVAL_SECS, DEFAULT_CYCLE_TIMEOUT_SECS, DEFAULT_EVICTION_INTERVAL_SECS,
    DEFAULT_EXPORTER_LISTEN, DEFAULT_RETENTION_SECS, ENV_PREFIX, MIN_COLLECTION_INTERVAL_MS,
    SHUTDOWN_GRACE_PERIOD_SECS,
};

// ----------------------------------------------------------------------------
// Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration for the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    /// Alert thresholds; replaces the built-in table when present
    #[serde(default = "ThresholdTable::default_rules")]
    pub thresholds: Vec<ThresholdRule>,

    #[serde(default)]
    pub samplers: SamplersConfig,

    #[serde(default)]
    pub exporter: ExporterConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            thresholds: ThresholdTable::default_rules(),
            samplers: SamplersConfig::default(),
            exporter: ExporterConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from file with environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_with_prefix(path.as_ref(), ENV_PREFIX)
    }

    fn load_with_prefix(path: &Path, env_prefix: &str) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e.eq_ignore_ascii_case("json"));

        let figment = if is_json {
            Figment::new().merge(Json::file(path))
        } else {
            Figment::new().merge(Toml::file(path))
        };
        let figment = figment.merge(Env::prefixed(env_prefix).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to the built-in defaults.
    ///
    /// The error is returned alongside so the caller can report it once
    /// logging is up.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, Option<ConfigError>) {
        match Self::load(path) {
            Ok(config) => (config, None),
            Err(e) => (Self::default(), Some(e)),
        }
    }

    /// Load from a TOML string (no environment overrides).
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;

        if engine.collection_interval < Duration::from_millis(MIN_COLLECTION_INTERVAL_MS) {
            return Err(ConfigError::invalid_value(
                "engine.collection_interval",
                format!(
                    "Collection interval must be at least {}ms",
                    MIN_COLLECTION_INTERVAL_MS
                ),
            ));
        }

        for (field, value) in [
            ("engine.retention_window", engine.retention_window),
            ("engine.eviction_interval", engine.eviction_interval),
            ("engine.cycle_timeout", engine.cycle_timeout),
            ("engine.shutdown_timeout", engine.shutdown_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid_value(field, "must be greater than zero"));
            }
        }

        if engine.cycle_timeout > engine.collection_interval {
            return Err(ConfigError::invalid_value(
                "engine.cycle_timeout",
                format!(
                    "cycle timeout ({}) cannot exceed the collection interval ({})",
                    humantime::format_duration(engine.cycle_timeout),
                    humantime::format_duration(engine.collection_interval)
                ),
            ));
        }

        for domain in Domain::ALL {
            if let Some(interval) = self.samplers.interval_override(domain) {
                if interval < engine.collection_interval {
                    return Err(ConfigError::invalid_value(
                        format!("samplers.{}.interval", domain),
                        "per-domain interval cannot be shorter than the collection interval",
                    ));
                }
            }
        }

        ThresholdTable::from_rules(self.thresholds.iter().cloned())?;

        if self.exporter.enabled {
            self.exporter.listen_addr()?;
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "compact" | "json") {
            return Err(ConfigError::invalid_value(
                "logging.format",
                format!("unknown format '{}' (expected pretty, compact or json)", self.logging.format),
            ));
        }

        Ok(())
    }

    /// The effective threshold table.
    pub fn threshold_table(&self) -> Result<ThresholdTable, ConfigError> {
        ThresholdTable::from_rules(self.thresholds.iter().cloned())
    }

    /// Sampling interval for a domain: its override, or the collection interval.
    pub fn sampler_interval(&self, domain: Domain) -> Duration {
        self.samplers
            .interval_override(domain)
            .unwrap_or(self.engine.collection_interval)
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Engine Configuration
// ----------------------------------------------------------------------------

/// Scheduling and retention settings. Durations use humantime ("15s", "7days").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Instance name (for identification)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Cycle clock period
    #[serde(default = "default_collection_interval", with = "humantime_serde")]
    pub collection_interval: Duration,

    /// Maximum age of a retained record
    #[serde(default = "default_retention_window", with = "humantime_serde")]
    pub retention_window: Duration,

    /// Cadence of the eviction task
    #[serde(default = "default_eviction_interval", with = "humantime_serde")]
    pub eviction_interval: Duration,

    /// How long a cycle waits for its samplers
    #[serde(default = "default_cycle_timeout", with = "humantime_serde")]
    pub cycle_timeout: Duration,

    /// Bound on draining in-flight samplers at shutdown
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            collection_interval: default_collection_interval(),
            retention_window: default_retention_window(),
            eviction_interval: default_eviction_interval(),
            cycle_timeout: default_cycle_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_instance_name() -> String {
    "dvpn-monitor".into()
}

fn default_collection_interval() -> Duration {
    Duration::from_secs(DEFAULT_COLLECTION_INTERVAL_SECS)
}

fn default_retention_window() -> Duration {
    Duration::from_secs(DEFAULT_RETENTION_SECS)
}

fn default_eviction_interval() -> Duration {
    Duration::from_secs(DEFAULT_EVICTION_INTERVAL_SECS)
}

fn default_cycle_timeout() -> Duration {
    Duration::from_secs(DEFAULT_CYCLE_TIMEOUT_SECS)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// Sampler Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplersConfig {
    #[serde(default)]
    pub system: SystemSamplerConfig,

    #[serde(default)]
    pub tunnel: TunnelSamplerConfig,

    #[serde(default)]
    pub ledger_peer: LedgerPeerSamplerConfig,
}

impl SamplersConfig {
    pub fn is_enabled(&self, domain: Domain) -> bool {
        match domain {
            Domain::System => self.system.enabled,
            Domain::Tunnel => self.tunnel.enabled,
            Domain::LedgerPeer => self.ledger_peer.enabled,
        }
    }

    pub fn interval_override(&self, domain: Domain) -> Option<Duration> {
        match domain {
            Domain::System => self.system.interval,
            Domain::Tunnel => self.tunnel.interval,
            Domain::LedgerPeer => self.ledger_peer.interval,
        }
    }
}

/// Host CPU, memory, disk and network sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSamplerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,

    /// Volume reported as `disk`
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,
}

impl Default for SystemSamplerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: None,
            mount_point: default_mount_point(),
        }
    }
}

fn default_mount_point() -> PathBuf {
    PathBuf::from("/")
}

/// OpenVPN tunnel sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelSamplerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,

    /// OpenVPN server status file
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,

    /// Tunnel network interface
    #[serde(default = "default_tunnel_interface")]
    pub interface: String,

    /// Host probed for round-trip latency
    #[serde(default = "default_ping_target")]
    pub ping_target: String,

    #[serde(default = "default_ping_timeout", with = "humantime_serde")]
    pub ping_timeout: Duration,

    /// Executable name of the VPN daemon, for process cpu/memory
    #[serde(default = "default_vpn_process")]
    pub process_name: String,
}

impl Default for TunnelSamplerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: None,
            status_file: default_status_file(),
            interface: default_tunnel_interface(),
            ping_target: default_ping_target(),
            ping_timeout: default_ping_timeout(),
            process_name: default_vpn_process(),
        }
    }
}

fn default_status_file() -> PathBuf {
    PathBuf::from("/var/log/openvpn/openvpn-status.log")
}

fn default_tunnel_interface() -> String {
    "tun0".into()
}

fn default_ping_target() -> String {
    "10.8.0.1".into()
}

fn default_ping_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_vpn_process() -> String {
    "openvpn".into()
}

/// Hyperledger Fabric peer sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerPeerSamplerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,

    /// `peer` CLI executable
    #[serde(default = "default_peer_binary")]
    pub peer_binary: PathBuf,

    /// Extra directory appended to PATH for the CLI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_dir: Option<PathBuf>,

    #[serde(default = "default_channel")]
    pub channel: String,

    #[serde(default = "default_fabric_cfg_path")]
    pub fabric_cfg_path: PathBuf,

    #[serde(default = "default_peer_address")]
    pub peer_address: String,

    #[serde(default = "default_local_msp_id")]
    pub local_msp_id: String,

    #[serde(default = "default_msp_config_path")]
    pub msp_config_path: PathBuf,

    /// Bound on each CLI invocation
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
}

impl Default for LedgerPeerSamplerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: None,
            peer_binary: default_peer_binary(),
            bin_dir: None,
            channel: default_channel(),
            fabric_cfg_path: default_fabric_cfg_path(),
            peer_address: default_peer_address(),
            local_msp_id: default_local_msp_id(),
            msp_config_path: default_msp_config_path(),
            command_timeout: default_command_timeout(),
        }
    }
}

fn default_peer_binary() -> PathBuf {
    PathBuf::from("peer")
}

fn default_channel() -> String {
    "dvpnchannel".into()
}

fn default_fabric_cfg_path() -> PathBuf {
    PathBuf::from("/etc/hyperledger/fabric")
}

fn default_peer_address() -> String {
    "localhost:7051".into()
}

fn default_local_msp_id() -> String {
    "Org1MSP".into()
}

fn default_msp_config_path() -> PathBuf {
    PathBuf::from("/etc/hyperledger/fabric/msp")
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(5)
}

// ----------------------------------------------------------------------------
// Exporter Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExporterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_exporter_listen")]
    pub listen: String,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_exporter_listen(),
        }
    }
}

impl ExporterConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen.parse().map_err(|e| {
            ConfigError::invalid_value("exporter.listen", format!("'{}': {}", self.listen, e))
        })
    }
}

fn default_exporter_listen() -> String {
    DEFAULT_EXPORTER_LISTEN.into()
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log file; rotated daily
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AlertLevel;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = MonitorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.collection_interval, Duration::from_secs(15));
        assert_eq!(config.engine.retention_window, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.threshold_table().unwrap().len(), 4);
    }

    #[test]
    fn test_generated_config_round_trips() {
        let generated = MonitorConfig::generate_default_config();
        let parsed = MonitorConfig::from_toml_str(&generated).unwrap();
        assert_eq!(parsed, MonitorConfig::default());
    }

    #[test]
    fn test_parse_toml_with_humantime() {
        let config = MonitorConfig::from_toml_str(
            r#"
            [engine]
            collection_interval = "30s"
            retention_window = "2days"
            cycle_timeout = "20s"

            [samplers.tunnel]
            interval = "1m"
            interface = "tun1"

            [samplers.ledger_peer]
            enabled = false

            [[thresholds]]
            domain = "system"
            metric = "cpu"
            value = 95.0
            level = "critical"

            [[thresholds]]
            domain = "vpn"
            metric = "connections"
            value = 100
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.collection_interval, Duration::from_secs(30));
        assert_eq!(config.engine.retention_window, Duration::from_secs(2 * 86_400));
        assert_eq!(config.sampler_interval(Domain::Tunnel), Duration::from_secs(60));
        assert_eq!(config.sampler_interval(Domain::System), Duration::from_secs(30));
        assert!(!config.samplers.is_enabled(Domain::LedgerPeer));
        assert_eq!(config.samplers.tunnel.interface, "tun1");

        let table = config.threshold_table().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(Domain::System, "cpu"), Some((95.0, AlertLevel::Critical)));
        assert_eq!(
            table.get(Domain::Tunnel, "connections"),
            Some((100.0, AlertLevel::Warning))
        );
    }

    #[test]
    fn test_validation_rejects_zero_durations() {
        let err = MonitorConfig::from_toml_str("[engine]\nretention_window = \"0s\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "engine.retention_window"));
    }

    #[test]
    fn test_validation_rejects_cycle_timeout_above_interval() {
        let err = MonitorConfig::from_toml_str(
            "[engine]\ncollection_interval = \"5s\"\ncycle_timeout = \"6s\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "engine.cycle_timeout"));
    }

    #[test]
    fn test_validation_rejects_duplicate_thresholds() {
        let err = MonitorConfig::from_toml_str(
            r#"
            [[thresholds]]
            domain = "system"
            metric = "cpu"
            value = 80.0

            [[thresholds]]
            domain = "system"
            metric = "cpu"
            value = 90.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateThreshold { .. }));
    }

    #[test]
    fn test_validation_rejects_bad_listen_address() {
        let err = MonitorConfig::from_toml_str("[exporter]\nlisten = \"not-an-address\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "exporter.listen"));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (config, err) = MonitorConfig::load_or_default(dir.path().join("absent.toml"));
        assert_eq!(config, MonitorConfig::default());
        assert!(matches!(err, Some(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(b"[engine\ncollection_interval = ").unwrap();
        let (config, err) = MonitorConfig::load_or_default(file.path());
        assert_eq!(config, MonitorConfig::default());
        assert!(matches!(err, Some(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_load_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(
            br#"{
                "engine": { "collection_interval": "20s", "retention_window": "1h" },
                "thresholds": [ { "domain": "ledger_peer", "metric": "cpu", "value": 70.0 } ]
            }"#,
        )
        .unwrap();

        let config = MonitorConfig::load_with_prefix(file.path(), "DVPN_MONITOR_TEST_JSON_").unwrap();
        assert_eq!(config.engine.collection_interval, Duration::from_secs(20));
        assert_eq!(config.engine.retention_window, Duration::from_secs(3600));
        assert_eq!(config.thresholds.len(), 1);
        assert_eq!(config.thresholds[0].domain, Domain::LedgerPeer);
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(b"[engine]\ncollection_interval = \"20s\"\n").unwrap();

        std::env::set_var("DVPN_MONITOR_TEST_ENV_ENGINE__COLLECTION_INTERVAL", "40s");
        std::env::set_var("DVPN_MONITOR_TEST_ENV_EXPORTER__LISTEN", "127.0.0.1:9999");
        let loaded = MonitorConfig::load_with_prefix(file.path(), "DVPN_MONITOR_TEST_ENV_");
        std::env::remove_var("DVPN_MONITOR_TEST_ENV_ENGINE__COLLECTION_INTERVAL");
        std::env::remove_var("DVPN_MONITOR_TEST_ENV_EXPORTER__LISTEN");

        let config = loaded.unwrap();
        assert_eq!(config.engine.collection_interval, Duration::from_secs(40));
        assert_eq!(config.exporter.listen, "127.0.0.1:9999");
    }
}
