// ============================================================================
// TUNNEL SAMPLER
// ============================================================================
// OpenVPN tunnel health:
// - connections: CLIENT_LIST rows of the server status file
// - bandwidth_in_bytes / bandwidth_out_bytes: tunnel interface counters
// - latency: one ICMP round trip to the tunnel peer
// - process_cpu / process_memory: usage of the VPN daemon (percent)
// Each probe is independent; a failed probe only drops its own fields.
// ============================================================================

use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tracing::debug;

use super::process::{ProcessProbe, ProcessUsage};
use super::Sampler;
use crate::config::TunnelSamplerConfig;
use crate::error::{SamplerError, SamplerResult};
use crate::types::{Domain, FieldMap};

static PING_TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"time[=<]\s*([0-9]+(?:\.[0-9]+)?)\s*ms").expect("Invalid ping time regex"));

#[derive(Debug)]
pub struct TunnelSampler {
    config: TunnelSamplerConfig,
    process: ProcessProbe,
}

impl TunnelSampler {
    pub fn new(config: TunnelSamplerConfig) -> Self {
        Self {
            config,
            process: ProcessProbe::new(Domain::Tunnel),
        }
    }

    async fn connection_count(&self) -> SamplerResult<usize> {
        let path = &self.config.status_file;
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(count_clients(&contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(SamplerError::unavailable(
                Domain::Tunnel,
                format!("status file {} not found", path.display()),
            )),
            Err(e) => Err(SamplerError::io(
                Domain::Tunnel,
                format!("reading {}", path.display()),
                e,
            )),
        }
    }

    async fn interface_bytes(&self) -> SamplerResult<(u64, u64)> {
        let base = Path::new("/sys/class/net").join(&self.config.interface);
        if !tokio::fs::try_exists(&base).await.unwrap_or(false) {
            return Err(SamplerError::unavailable(
                Domain::Tunnel,
                format!("interface {} not present", self.config.interface),
            ));
        }

        let rx = read_counter(&base.join("statistics/rx_bytes")).await?;
        let tx = read_counter(&base.join("statistics/tx_bytes")).await?;
        Ok((rx, tx))
    }

    async fn latency_ms(&self) -> Option<f64> {
        let wait_secs = self.config.ping_timeout.as_secs().max(1).to_string();
        let output = Command::new("ping")
            .args(["-c", "1", "-W", wait_secs.as_str(), self.config.ping_target.as_str()])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => parse_ping_time(&String::from_utf8_lossy(&out.stdout)),
            Ok(out) => {
                debug!(
                    target: "dvpn::samplers::tunnel",
                    target_host = %self.config.ping_target,
                    status = ?out.status.code(),
                    "Latency probe failed"
                );
                None
            }
            Err(e) => {
                debug!(
                    target: "dvpn::samplers::tunnel",
                    error = %e,
                    "Latency probe could not run"
                );
                None
            }
        }
    }
}

#[async_trait]
impl Sampler for TunnelSampler {
    fn domain(&self) -> Domain {
        Domain::Tunnel
    }

    async fn sample(&self) -> SamplerResult<FieldMap> {
        let process_name = self.config.process_name.clone();
        let (connections, bytes, latency, usage) = tokio::join!(
            self.connection_count(),
            self.interface_bytes(),
            self.latency_ms(),
            self.process.usage(move |p| p.name() == process_name)
        );

        let mut fields = FieldMap::new();
        let mut missing = Vec::new();

        match connections {
            Ok(count) => {
                fields.insert("connections".into(), count as f64);
            }
            Err(e) => missing.push(e.to_string()),
        }
        match bytes {
            Ok((rx, tx)) => {
                fields.insert("bandwidth_in_bytes".into(), rx as f64);
                fields.insert("bandwidth_out_bytes".into(), tx as f64);
            }
            Err(e) => missing.push(e.to_string()),
        }
        match latency {
            Some(ms) => {
                fields.insert("latency".into(), ms);
            }
            None => missing.push(format!("no reply from {}", self.config.ping_target)),
        }
        match usage {
            Ok(Some(ProcessUsage { cpu, memory })) => {
                if let Some(cpu) = cpu {
                    fields.insert("process_cpu".into(), cpu);
                }
                if let Some(memory) = memory {
                    fields.insert("process_memory".into(), memory);
                }
            }
            Ok(None) => missing.push(format!("process {} not running", self.config.process_name)),
            Err(e) => missing.push(e.to_string()),
        }

        if fields.is_empty() {
            return Err(SamplerError::unavailable(Domain::Tunnel, missing.join("; ")));
        }
        if !missing.is_empty() {
            debug!(
                target: "dvpn::samplers::tunnel",
                missing = %missing.join("; "),
                "Partial tunnel sample"
            );
        }
        Ok(fields)
    }
}

async fn read_counter(path: &Path) -> SamplerResult<u64> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| SamplerError::io(Domain::Tunnel, format!("reading {}", path.display()), e))?;
    parse_counter(&raw)
}

fn parse_counter(raw: &str) -> SamplerResult<u64> {
    raw.trim()
        .parse()
        .map_err(|e| SamplerError::parse(Domain::Tunnel, format!("counter '{}': {}", raw.trim(), e)))
}

/// Count connected clients in an OpenVPN status file.
pub fn count_clients(status: &str) -> usize {
    status
        .lines()
        .filter(|line| line.starts_with("CLIENT_LIST"))
        .count()
}

/// Extract the round-trip time in milliseconds from `ping` output.
///
/// `time<1 ms` (sub-millisecond replies on some platforms) yields the bound,
/// so the result is an upper bound rather than the measured time.
pub fn parse_ping_time(output: &str) -> Option<f64> {
    PING_TIME_RE
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    const STATUS_V2: &str = "TITLE,OpenVPN 2.5.5 x86_64-pc-linux-gnu\n\
TIME,Mon Jan 15 10:00:00 2024,1705312800\n\
HEADER,CLIENT_LIST,Common Name,Real Address,Virtual Address\n\
CLIENT_LIST,iot-node-1,203.0.113.10:51820,10.8.0.2\n\
CLIENT_LIST,iot-node-2,203.0.113.11:51820,10.8.0.3\n\
HEADER,ROUTING_TABLE,Virtual Address,Common Name\n\
ROUTING_TABLE,10.8.0.2,iot-node-1\n\
END\n";

    #[test]
    fn test_count_clients() {
        assert_eq!(count_clients(STATUS_V2), 2);
        assert_eq!(count_clients(""), 0);
    }

    #[test]
    fn test_parse_ping_time() {
        let linux = "PING 10.8.0.1 (10.8.0.1) 56(84) bytes of data.\n\
64 bytes from 10.8.0.1: icmp_seq=1 ttl=64 time=23.4 ms\n";
        assert_eq!(parse_ping_time(linux), Some(23.4));
        // reported as the bound
        assert_eq!(parse_ping_time("64 bytes from 10.8.0.1: time<1 ms"), Some(1.0));
        assert_eq!(parse_ping_time("Request timeout for icmp_seq 0"), None);
    }

    #[test]
    fn test_parse_counter() {
        assert_eq!(parse_counter("12345\n").unwrap(), 12345);
        assert_eq!(
            parse_counter("n/a").unwrap_err().kind(),
            crate::error::SamplerErrorKind::Parse
        );
    }

    #[tokio::test]
    async fn test_missing_status_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let sampler = TunnelSampler::new(TunnelSamplerConfig {
            status_file: dir.path().join("missing-status.log"),
            ..TunnelSamplerConfig::default()
        });
        let err = sampler.connection_count().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::SamplerErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn test_status_file_is_counted() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(STATUS_V2.as_bytes()).unwrap();
        let sampler = TunnelSampler::new(TunnelSamplerConfig {
            status_file: file.path().to_path_buf(),
            ping_timeout: Duration::from_secs(1),
            ..TunnelSamplerConfig::default()
        });
        assert_eq!(sampler.connection_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_missing_interface_is_unavailable() {
        let sampler = TunnelSampler::new(TunnelSamplerConfig {
            interface: "dvpn-test-none0".into(),
            ..TunnelSamplerConfig::default()
        });
        let err = sampler.interface_bytes().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::SamplerErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn test_missing_status_file_keeps_interface_counters() {
        if !Path::new("/sys/class/net/lo").exists() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let sampler = TunnelSampler::new(TunnelSamplerConfig {
            status_file: dir.path().join("missing-status.log"),
            interface: "lo".into(),
            ping_target: "127.0.0.1".into(),
            ping_timeout: Duration::from_secs(1),
            process_name: "dvpn-test-no-daemon".into(),
            ..TunnelSamplerConfig::default()
        });

        let fields = sampler.sample().await.unwrap();
        assert!(fields.contains_key("bandwidth_in_bytes"));
        assert!(fields.contains_key("bandwidth_out_bytes"));
        assert!(!fields.contains_key("connections"));
        assert!(!fields.contains_key("process_cpu"));
        assert!(!fields.contains_key("process_memory"));
    }

    #[tokio::test]
    async fn test_nothing_available_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let sampler = TunnelSampler::new(TunnelSamplerConfig {
            status_file: dir.path().join("missing-status.log"),
            interface: "dvpn-test-none0".into(),
            ping_target: "dvpn-test.invalid".into(),
            ping_timeout: Duration::from_secs(1),
            process_name: "dvpn-test-no-daemon".into(),
            ..TunnelSamplerConfig::default()
        });

        let err = sampler.sample().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::SamplerErrorKind::Unavailable);
        assert_eq!(err.domain(), Domain::Tunnel);
    }
}
