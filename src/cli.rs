// ============================================================================
// CLI & COMMAND LINE INTERFACE
// ============================================================================
// Command-line surface of the monitor:
// - run (default), validate, generate-config, thresholds, status, version
// - global --config / --log-level / --debug with environment fallbacks
// ============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::config::MonitorConfig;
use crate::engine::{signal_token, MonitorEngine};
use crate::exporter::SummaryResponse;
use crate::logging::init_logging;
use crate::types::Domain;
use crate::{ENGINE_FULL_NAME, ENGINE_VERSION};

// ----------------------------------------------------------------------------
// Argument Parser
// ----------------------------------------------------------------------------

/// dVPN monitor CLI
#[derive(Parser, Debug)]
#[command(
    name = "dvpn-monitor",
    version,
    about = "Metrics collection and alerting for dVPN nodes",
    long_about = "Samples host, tunnel and ledger peer metrics on a fixed cadence, \
                  merges them into timestamped records held for a retention window, \
                  and raises threshold alerts."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "dvpn-monitor.toml", env = "DVPN_MONITOR_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "DVPN_MONITOR_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start collecting (default)
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the effective alert thresholds
    Thresholds,

    /// Query a running monitor's exporter
    Status {
        /// Exporter base URL
        #[arg(short, long, default_value = "http://127.0.0.1:9105")]
        endpoint: String,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = match MonitorConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            return Err(e.into());
        }
    };

    println!("✅ Configuration is valid!");
    if verbose {
        println!("\n📋 Parsed configuration:");
        println!("{}", "=".repeat(60));
        match toml::to_string_pretty(&config) {
            Ok(s) => println!("{}", s),
            Err(e) => println!("Failed to serialize: {}", e),
        }
    }

    println!("\n📊 Configuration Summary:");
    println!("  • Instance name: {}", config.engine.instance_name);
    println!(
        "  • Collection interval: {}",
        humantime::format_duration(config.engine.collection_interval)
    );
    println!(
        "  • Retention window: {}",
        humantime::format_duration(config.engine.retention_window)
    );
    println!("  • Threshold rules: {}", config.thresholds.len());
    println!("  • Samplers enabled:");
    for domain in Domain::ALL {
        if config.samplers.is_enabled(domain) {
            println!(
                "    - {} (every {})",
                domain,
                humantime::format_duration(config.sampler_interval(domain))
            );
        }
    }
    if config.exporter.enabled {
        println!("  • Exporter: {}", config.exporter.listen);
    }

    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config_str = MonitorConfig::generate_default_config();
    match output {
        Some(path) => {
            std::fs::write(path, &config_str)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }
    Ok(())
}

fn handle_thresholds(config_path: &Path) -> AnyhowResult<()> {
    let (config, fallback) = MonitorConfig::load_or_default(config_path);
    if let Some(e) = fallback {
        println!("⚠️  {} (showing defaults)", e);
    }
    let table = config.threshold_table()?;

    println!("{:<12} {:<16} {:>12} {:<8}", "DOMAIN", "METRIC", "THRESHOLD", "LEVEL");
    for rule in table.rules() {
        println!(
            "{:<12} {:<16} {:>12} {:<8}",
            rule.domain.as_str(),
            rule.metric.as_str(),
            rule.value,
            rule.level.as_str()
        );
    }
    Ok(())
}

async fn handle_status(endpoint: &str) -> AnyhowResult<()> {
    let url = format!("{}/summary", endpoint.trim_end_matches('/'));
    println!("Checking monitor status at {}...", url);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("Failed to build HTTP client")?;
    let summary: SummaryResponse = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?
        .error_for_status()?
        .json()
        .await
        .context("Malformed summary response")?;

    println!("\n📊 Cache:");
    println!("  • Records: {}", summary.cache.count);
    match (summary.cache.oldest_timestamp, summary.cache.newest_timestamp) {
        (Some(oldest), Some(newest)) => {
            println!("  • Oldest: {}", oldest.to_datetime().to_rfc3339());
            println!("  • Newest: {}", newest.to_datetime().to_rfc3339());
        }
        _ => println!("  • No records yet"),
    }
    println!(
        "  • Retention: {}",
        humantime::format_duration(Duration::from_secs(summary.retention_secs))
    );
    println!("  • Cycles completed: {}", summary.cycles_completed);

    if summary.failures.is_empty() {
        println!("\n✅ No sampler failures");
    } else {
        println!("\n⚠️  Sampler failures:");
        for failure in &summary.failures {
            println!("  • {} {}: {}", failure.domain, failure.kind.as_str(), failure.count);
        }
    }
    Ok(())
}

fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Domains:");
    for domain in Domain::ALL {
        println!("  • {}", domain);
    }
}

async fn handle_run(cli: &Cli) -> AnyhowResult<()> {
    let (mut config, fallback) = MonitorConfig::load_or_default(&cli.config);

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.debug {
        config.logging.level = "debug".into();
    }

    let _guard = init_logging(&config.logging)?;
    if let Some(e) = fallback {
        warn!(target: "dvpn::init", error = %e, "Using default configuration");
    }

    info!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    let engine = MonitorEngine::from_config(config)?;
    engine.run(signal_token()).await?;
    Ok(())
}

/// Dispatch a parsed command line.
pub async fn run_cli(cli: Cli) -> AnyhowResult<()> {
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            Ok(())
        }
        Some(Commands::GenerateConfig { output }) => handle_generate_config(output.as_deref()),
        Some(Commands::Validate { verbose }) => handle_validate(&cli.config, *verbose),
        Some(Commands::Thresholds) => handle_thresholds(&cli.config),
        Some(Commands::Status { endpoint }) => handle_status(endpoint).await,
        Some(Commands::Run) | None => handle_run(&cli).await,
    }
}
