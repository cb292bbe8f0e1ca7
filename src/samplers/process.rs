// ============================================================================
// PROCESS PROBE
// ============================================================================
// Resource usage of one daemon located in the process table:
// - command lines are loaded so daemons can be matched on their arguments
// - cpu is only reported for a pid already present at the previous refresh
// ============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::{Pid, Process, ProcessRefreshKind, System, UpdateKind};

use crate::error::{SamplerError, SamplerResult};
use crate::types::Domain;

/// Usage of a matched process, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessUsage {
    /// `None` until the process has been observed across two refreshes;
    /// sysinfo has no cpu delta before that.
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
}

struct ProbeState {
    sys: System,
    seen: HashSet<Pid>,
}

impl ProbeState {
    /// Refresh the process table and return the pids known before it.
    fn refresh(&mut self) -> HashSet<Pid> {
        self.sys.refresh_memory();
        self.sys.refresh_processes_specifics(
            ProcessRefreshKind::new()
                .with_cpu()
                .with_memory()
                .with_cmd(UpdateKind::OnlyIfNotSet),
        );
        let current = self.sys.processes().keys().copied().collect();
        std::mem::replace(&mut self.seen, current)
    }

    fn usage(&mut self, matches: &dyn Fn(&Process) -> bool) -> Option<ProcessUsage> {
        let previous = self.refresh();
        let total = self.sys.total_memory();
        self.sys
            .processes()
            .values()
            .find(|p| matches(*p))
            .map(|p| ProcessUsage {
                cpu: previous.contains(&p.pid()).then(|| f64::from(p.cpu_usage())),
                memory: (total > 0).then(|| p.memory() as f64 / total as f64 * 100.0),
            })
    }
}

/// Finds a process by predicate and reports its cpu and memory share.
pub struct ProcessProbe {
    domain: Domain,
    state: Arc<Mutex<ProbeState>>,
}

impl ProcessProbe {
    /// Creates the probe with the process table already loaded, so a daemon
    /// running at startup gets a cpu value on the first sample.
    pub fn new(domain: Domain) -> Self {
        let mut state = ProbeState {
            sys: System::new(),
            seen: HashSet::new(),
        };
        state.refresh();
        Self {
            domain,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Usage of the first process accepted by `matches`, if any.
    pub async fn usage<F>(&self, matches: F) -> SamplerResult<Option<ProcessUsage>>
    where
        F: Fn(&Process) -> bool + Send + 'static,
    {
        let state = self.state.clone();
        let domain = self.domain;
        tokio::task::spawn_blocking(move || state.lock().usage(&matches))
            .await
            .map_err(|e| SamplerError::Panic {
                domain,
                message: e.to_string(),
            })
    }
}

impl std::fmt::Debug for ProcessProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessProbe")
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// True when the joined command line contains `marker`.
pub fn cmdline_contains(process: &Process, marker: &str) -> bool {
    process.cmd().join(" ").contains(marker)
}
