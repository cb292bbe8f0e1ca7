// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem of the monitor:
// - SamplerError: domain-scoped, recorded and skipped, never cycle-wide
// - ConfigError: falls back to built-in defaults, never fatal
// - MonitorError: top-level, carries the fatal scheduler condition
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Domain;

// ----------------------------------------------------------------------------
// Core Monitor Errors
// ----------------------------------------------------------------------------

/// The main error type for the monitor.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sampler error: {0}")]
    Sampler(#[from] SamplerError),

    /// Further collection is impossible; the process should stop rather than
    /// publish silently wrong data.
    #[error("Scheduler fatal: {reason}")]
    SchedulerFatal { reason: String },

    #[error("Exporter error: {message}")]
    Exporter { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MonitorError {
    pub fn scheduler_fatal(reason: impl Into<String>) -> Self {
        MonitorError::SchedulerFatal {
            reason: reason.into(),
        }
    }

    pub fn exporter(message: impl Into<String>) -> Self {
        MonitorError::Exporter {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            MonitorError::Config(_) => true,
            MonitorError::Sampler(_) => true,
            MonitorError::SchedulerFatal { .. } => false,
            MonitorError::Exporter { .. } => true,
            MonitorError::Io(_) => true,
            MonitorError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            MonitorError::Config(_) => "config",
            MonitorError::Sampler(_) => "sampler",
            MonitorError::SchedulerFatal { .. } => "scheduler",
            MonitorError::Exporter { .. } => "exporter",
            MonitorError::Io(_) => "io",
            MonitorError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Duplicate threshold for {domain}.{metric}")]
    DuplicateThreshold { domain: Domain, metric: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        ConfigError::ParseError {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Sampler Errors
// ----------------------------------------------------------------------------

/// Kind of a domain-scoped sampling failure. Used as the failure counter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerErrorKind {
    /// Sampler did not answer within its deadline
    Timeout,
    /// Reading a file, socket or child process failed
    Io,
    /// Source answered but the output could not be interpreted
    Parse,
    /// Source is not present on this host (missing file, binary or process)
    Unavailable,
    /// Previous sample for the domain was still outstanding when the next was due
    Overrun,
    /// Sampler panicked
    Panic,
}

impl SamplerErrorKind {
    pub const ALL: [SamplerErrorKind; 6] = [
        SamplerErrorKind::Timeout,
        SamplerErrorKind::Io,
        SamplerErrorKind::Parse,
        SamplerErrorKind::Unavailable,
        SamplerErrorKind::Overrun,
        SamplerErrorKind::Panic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SamplerErrorKind::Timeout => "timeout",
            SamplerErrorKind::Io => "io",
            SamplerErrorKind::Parse => "parse",
            SamplerErrorKind::Unavailable => "unavailable",
            SamplerErrorKind::Overrun => "overrun",
            SamplerErrorKind::Panic => "panic",
        }
    }
}

impl Display for SamplerErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain-scoped sampling failure.
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Timeout sampling '{domain}' (waited {timeout_ms}ms)")]
    Timeout { domain: Domain, timeout_ms: u64 },

    #[error("I/O failure sampling '{domain}' ({context}): {source}")]
    Io {
        domain: Domain,
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not parse '{domain}' output: {message}")]
    Parse { domain: Domain, message: String },

    #[error("Source for '{domain}' unavailable: {message}")]
    Unavailable { domain: Domain, message: String },

    #[error("Previous '{domain}' sample still outstanding")]
    Overrun { domain: Domain },

    #[error("Sampler for '{domain}' panicked: {message}")]
    Panic { domain: Domain, message: String },
}

impl SamplerError {
    pub fn timeout(domain: Domain, timeout_ms: u64) -> Self {
        SamplerError::Timeout { domain, timeout_ms }
    }

    pub fn io(domain: Domain, context: impl Into<String>, source: std::io::Error) -> Self {
        SamplerError::Io {
            domain,
            context: context.into(),
            source,
        }
    }

    pub fn parse(domain: Domain, message: impl Into<String>) -> Self {
        SamplerError::Parse {
            domain,
            message: message.into(),
        }
    }

    pub fn unavailable(domain: Domain, message: impl Into<String>) -> Self {
        SamplerError::Unavailable {
            domain,
            message: message.into(),
        }
    }

    pub fn domain(&self) -> Domain {
        match self {
            SamplerError::Timeout { domain, .. }
            | SamplerError::Io { domain, .. }
            | SamplerError::Parse { domain, .. }
            | SamplerError::Unavailable { domain, .. }
            | SamplerError::Overrun { domain }
            | SamplerError::Panic { domain, .. } => *domain,
        }
    }

    pub fn kind(&self) -> SamplerErrorKind {
        match self {
            SamplerError::Timeout { .. } => SamplerErrorKind::Timeout,
            SamplerError::Io { .. } => SamplerErrorKind::Io,
            SamplerError::Parse { .. } => SamplerErrorKind::Parse,
            SamplerError::Unavailable { .. } => SamplerErrorKind::Unavailable,
            SamplerError::Overrun { .. } => SamplerErrorKind::Overrun,
            SamplerError::Panic { .. } => SamplerErrorKind::Panic,
        }
    }
}

// ----------------------------------------------------------------------------
// Result Type Aliases
// ----------------------------------------------------------------------------

pub type MonitorResult<T> = Result<T, MonitorError>;

pub type SamplerResult<T> = Result<T, SamplerError>;

pub type ConfigResult<T> = Result<T, ConfigError>;
