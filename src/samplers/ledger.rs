// ============================================================================
// LEDGER PEER SAMPLER
// ============================================================================
// Hyperledger Fabric peer health through the `peer` CLI and the process table:
// - block_height: `peer channel getinfo -c <channel>`
// - peer_count: `peers` array of `peer node status`
// - cpu / memory: usage of the `peer node start` process (percent); cpu is
//   left out until the process has been seen by two refreshes
// ============================================================================

use std::io::ErrorKind;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use super::process::{cmdline_contains, ProcessProbe, ProcessUsage};
use super::Sampler;
use crate::config::LedgerPeerSamplerConfig;
use crate::error::{SamplerError, SamplerResult};
use crate::types::{Domain, FieldMap};

/// Command line fragment identifying the running peer daemon.
const PEER_PROCESS_MARKER: &str = "peer node start";

pub struct LedgerPeerSampler {
    config: LedgerPeerSamplerConfig,
    process: ProcessProbe,
}

impl LedgerPeerSampler {
    pub fn new(config: LedgerPeerSamplerConfig) -> Self {
        Self {
            config,
            process: ProcessProbe::new(Domain::LedgerPeer),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let cfg = &self.config;
        let mut cmd = Command::new(&cfg.peer_binary);
        cmd.args(args)
            .env("FABRIC_CFG_PATH", &cfg.fabric_cfg_path)
            .env("CORE_PEER_ADDRESS", &cfg.peer_address)
            .env("CORE_PEER_LOCALMSPID", &cfg.local_msp_id)
            .env("CORE_PEER_MSPCONFIGPATH", &cfg.msp_config_path)
            .kill_on_drop(true);

        if let Some(bin_dir) = &cfg.bin_dir {
            let mut path = std::env::var_os("PATH").unwrap_or_default();
            if !path.is_empty() {
                path.push(":");
            }
            path.push(bin_dir.as_os_str());
            cmd.env("PATH", path);
        }
        cmd
    }

    async fn run(&self, args: &[&str]) -> SamplerResult<String> {
        let invocation = format!("peer {}", args.join(" "));
        let output = tokio::time::timeout(self.config.command_timeout, self.command(args).output())
            .await
            .map_err(|_| {
                SamplerError::timeout(Domain::LedgerPeer, self.config.command_timeout.as_millis() as u64)
            })?
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => SamplerError::unavailable(
                    Domain::LedgerPeer,
                    format!("peer binary '{}' not found", self.config.peer_binary.display()),
                ),
                _ => SamplerError::io(Domain::LedgerPeer, invocation.clone(), e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SamplerError::io(
                Domain::LedgerPeer,
                invocation,
                std::io::Error::new(
                    ErrorKind::Other,
                    format!("exit status {:?}: {}", output.status.code(), stderr.trim()),
                ),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn process_usage(&self) -> SamplerResult<Option<ProcessUsage>> {
        self.process
            .usage(|p| cmdline_contains(p, PEER_PROCESS_MARKER))
            .await
    }
}

impl std::fmt::Debug for LedgerPeerSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerPeerSampler")
            .field("peer_binary", &self.config.peer_binary)
            .field("channel", &self.config.channel)
            .finish()
    }
}

#[async_trait]
impl Sampler for LedgerPeerSampler {
    fn domain(&self) -> Domain {
        Domain::LedgerPeer
    }

    async fn sample(&self) -> SamplerResult<FieldMap> {
        let getinfo = ["channel", "getinfo", "-c", self.config.channel.as_str()];
        let node_status = ["node", "status"];
        let (info, status, usage) = tokio::join!(
            self.run(&getinfo),
            self.run(&node_status),
            self.process_usage()
        );

        let mut fields = FieldMap::new();
        fields.insert("block_height".into(), parse_block_height(&info?)? as f64);

        match status.and_then(|out| parse_peer_count(&out)) {
            Ok(count) => {
                fields.insert("peer_count".into(), count as f64);
            }
            Err(e) => {
                debug!(target: "dvpn::samplers::ledger", error = %e, "Peer count unavailable");
            }
        }

        match usage? {
            Some(ProcessUsage { cpu, memory }) => {
                if let Some(cpu) = cpu {
                    fields.insert("cpu".into(), cpu);
                }
                if let Some(memory) = memory {
                    fields.insert("memory".into(), memory);
                }
            }
            None => {
                debug!(
                    target: "dvpn::samplers::ledger",
                    marker = PEER_PROCESS_MARKER,
                    "Peer process not found"
                );
            }
        }

        Ok(fields)
    }
}

/// Parse the block height from `peer channel getinfo` output.
///
/// Accepts either a bare integer or the standard
/// `Blockchain info: {"height":N,...}` line.
pub fn parse_block_height(output: &str) -> SamplerResult<u64> {
    let trimmed = output.trim();
    if let Ok(height) = trimmed.parse::<u64>() {
        return Ok(height);
    }

    let json = trimmed
        .find('{')
        .map(|start| &trimmed[start..])
        .ok_or_else(|| SamplerError::parse(Domain::LedgerPeer, "no chain info in getinfo output"))?;
    let info: Value = serde_json::from_str(json)
        .map_err(|e| SamplerError::parse(Domain::LedgerPeer, format!("chain info: {}", e)))?;

    info.get("height")
        .and_then(Value::as_u64)
        .ok_or_else(|| SamplerError::parse(Domain::LedgerPeer, "chain info has no height"))
}

/// Count entries of the `peers` array in `peer node status` JSON output.
pub fn parse_peer_count(output: &str) -> SamplerResult<usize> {
    let status: Value = serde_json::from_str(output.trim())
        .map_err(|e| SamplerError::parse(Domain::LedgerPeer, format!("node status: {}", e)))?;

    Ok(status
        .get("peers")
        .and_then(Value::as_array)
        .map_or(0, Vec::len))
}
