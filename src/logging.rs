// ============================================================================
// LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging through tracing:
// - EnvFilter (RUST_LOG wins over the configured level)
// - pretty, compact or json console output
// - optional daily-rolling log file through a non-blocking writer
// ============================================================================

use std::path::{Path, PathBuf};

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::{ConfigError, MonitorError, MonitorResult};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize the logging system based on configuration.
///
/// The returned guard flushes the log file on drop and must be held for the
/// lifetime of the process.
pub fn init_logging(config: &LoggingConfig) -> MonitorResult<Option<WorkerGuard>> {
    let env_filter = build_filter(&config.level)?;

    let mut layers: Vec<BoxedLayer> = vec![console_layer(config)];
    let mut guard = None;

    if let Some(path) = &config.file {
        let (dir, file_name) = split_log_path(path);
        std::fs::create_dir_all(&dir)?;
        let appender = tracing_appender::rolling::daily(&dir, file_name);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .boxed(),
        );
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| MonitorError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "dvpn::init",
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "Logging initialized"
    );

    Ok(guard)
}

/// `RUST_LOG` when set, otherwise the configured level or directive.
fn build_filter(level: &str) -> Result<EnvFilter, ConfigError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level)
        .map_err(|e| ConfigError::invalid_value("logging.level", format!("'{}': {}", level, e)))
}

fn console_layer(config: &LoggingConfig) -> BoxedLayer {
    match config.format.as_str() {
        "json" => fmt::layer()
            .json()
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_ids(true)
            .with_thread_names(true)
            .boxed(),
        "compact" => fmt::layer()
            .compact()
            .with_ansi(config.colors)
            .with_target(true)
            .boxed(),
        // Pretty format (default)
        _ => fmt::layer()
            .pretty()
            .with_ansi(config.colors)
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_ids(false)
            .with_thread_names(true)
            .boxed(),
    }
}

fn split_log_path(path: &Path) -> (PathBuf, PathBuf) {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("{}.log", crate::ENGINE_NAME)));
    (dir, file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_log_path() {
        assert_eq!(
            split_log_path(Path::new("/var/log/dvpn/monitor.log")),
            (PathBuf::from("/var/log/dvpn"), PathBuf::from("monitor.log"))
        );
        assert_eq!(
            split_log_path(Path::new("monitor.log")),
            (PathBuf::from("."), PathBuf::from("monitor.log"))
        );
    }

    #[test]
    fn test_filter_directives() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(build_filter("info").is_ok());
        assert!(build_filter("warn,dvpn::scheduler=debug").is_ok());
        assert!(build_filter("dvpn::scheduler=loud").is_err());
    }
}
