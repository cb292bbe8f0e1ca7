// ============================================================================
// SYSTEM SAMPLER
// ============================================================================
// Host-level metrics through sysinfo:
// - cpu: global usage since the previous sample (percent)
// - memory: used / total (percent)
// - disk: used space of the configured mount point (percent)
// - net_in_bytes / net_out_bytes: interface totals, loopback excluded
// ============================================================================

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use sysinfo::{Disks, Networks, System};
use tracing::trace;

use super::Sampler;
use crate::config::SystemSamplerConfig;
use crate::error::{SamplerError, SamplerResult};
use crate::types::{Domain, FieldMap};

/// Interfaces never counted towards host traffic.
const LOOPBACK_INTERFACES: &[&str] = &["lo", "lo0"];

pub struct SystemSampler {
    config: SystemSamplerConfig,
    // CPU usage is a delta between refreshes, so the handle lives across samples
    sys: Arc<Mutex<System>>,
}

impl SystemSampler {
    pub fn new(config: SystemSamplerConfig) -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        Self {
            config,
            sys: Arc::new(Mutex::new(sys)),
        }
    }
}

impl std::fmt::Debug for SystemSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemSampler")
            .field("mount_point", &self.config.mount_point)
            .finish()
    }
}

#[async_trait]
impl Sampler for SystemSampler {
    fn domain(&self) -> Domain {
        Domain::System
    }

    async fn sample(&self) -> SamplerResult<FieldMap> {
        let sys = self.sys.clone();
        let mount_point = self.config.mount_point.clone();

        tokio::task::spawn_blocking(move || {
            let start = Instant::now();
            let mut sys = sys.lock();
            let fields = collect(&mut sys, &mount_point);
            trace!(
                target: "dvpn::samplers::system",
                fields = fields.len(),
                elapsed_us = start.elapsed().as_micros() as u64,
                "System sample taken"
            );
            fields
        })
        .await
        .map_err(|e| SamplerError::Panic {
            domain: Domain::System,
            message: e.to_string(),
        })
    }
}

fn collect(sys: &mut System, mount_point: &Path) -> FieldMap {
    let mut fields = FieldMap::new();

    sys.refresh_cpu();
    fields.insert("cpu".into(), f64::from(sys.global_cpu_info().cpu_usage()));

    sys.refresh_memory();
    if let Some(pct) = percent(sys.used_memory(), sys.total_memory()) {
        fields.insert("memory".into(), pct);
    }

    let disks = Disks::new_with_refreshed_list();
    let volumes: Vec<_> = disks
        .iter()
        .map(|d| (d.mount_point(), d.total_space(), d.available_space()))
        .collect();
    if let Some(pct) = disk_usage(&volumes, mount_point) {
        fields.insert("disk".into(), pct);
    }

    let networks = Networks::new_with_refreshed_list();
    let (rx, tx) = interface_totals(
        networks
            .iter()
            .map(|(name, data)| (name.as_str(), data.total_received(), data.total_transmitted())),
    );
    fields.insert("net_in_bytes".into(), rx as f64);
    fields.insert("net_out_bytes".into(), tx as f64);

    fields
}

/// `part / whole` as a percentage, or `None` when `whole` is zero.
fn percent(part: u64, whole: u64) -> Option<f64> {
    if whole == 0 {
        return None;
    }
    Some(part as f64 / whole as f64 * 100.0)
}

/// Used-space percentage of the volume mounted at `mount_point`, falling back
/// to the largest volume.
fn disk_usage(volumes: &[(&Path, u64, u64)], mount_point: &Path) -> Option<f64> {
    let (_, total, available) = volumes
        .iter()
        .find(|(mp, _, _)| *mp == mount_point)
        .or_else(|| volumes.iter().max_by_key(|(_, total, _)| *total))?;

    percent(total.saturating_sub(*available), *total)
}

fn interface_totals<'a, I>(interfaces: I) -> (u64, u64)
where
    I: IntoIterator<Item = (&'a str, u64, u64)>,
{
    interfaces
        .into_iter()
        .filter(|(name, _, _)| !LOOPBACK_INTERFACES.contains(name))
        .fold((0u64, 0u64), |(rx, tx), (_, r, t)| {
            (rx.saturating_add(r), tx.saturating_add(t))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_percent() {
        assert_eq!(percent(1, 4), Some(25.0));
        assert_eq!(percent(0, 0), None);
    }

    #[test]
    fn test_disk_usage_prefers_mount_point() {
        let root = PathBuf::from("/");
        let data = PathBuf::from("/data");
        let volumes = vec![(root.as_path(), 100, 40), (data.as_path(), 1_000, 100)];

        assert_eq!(disk_usage(&volumes, Path::new("/")), Some(60.0));
        // unknown mount point falls back to the largest volume
        assert_eq!(disk_usage(&volumes, Path::new("/srv")), Some(90.0));
        assert_eq!(disk_usage(&[], Path::new("/")), None);
    }

    #[test]
    fn test_interface_totals_skip_loopback() {
        let totals = interface_totals(vec![
            ("lo", 1_000, 1_000),
            ("eth0", 10, 20),
            ("tun0", 5, 7),
        ]);
        assert_eq!(totals, (15, 27));
    }

    #[tokio::test]
    async fn test_sample_reports_core_fields() {
        let sampler = SystemSampler::new(SystemSamplerConfig::default());
        let fields = sampler.sample().await.unwrap();
        assert!(fields.contains_key("cpu"));
        assert!(fields.contains_key("net_in_bytes"));
        assert!(fields.contains_key("net_out_bytes"));
    }
}
