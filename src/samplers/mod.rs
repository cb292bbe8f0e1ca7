// ============================================================================
// SAMPLER TRAIT & ADAPTERS
// ============================================================================
// The seam between the scheduler and the outside world:
// - Sampler: async, one call produces one domain's field map or a failure
// - FnSampler: closure adapter for tests and embedding
// - SystemSampler / TunnelSampler / LedgerPeerSampler: host adapters
// ============================================================================

use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SamplersConfig;
use crate::error::SamplerResult;
use crate::types::{Domain, FieldMap};

pub mod ledger;
pub mod process;
pub mod system;
pub mod tunnel;

pub use ledger::LedgerPeerSampler;
pub use process::{ProcessProbe, ProcessUsage};
pub use system::SystemSampler;
pub use tunnel::TunnelSampler;

// ----------------------------------------------------------------------------
// Sampler Trait
// ----------------------------------------------------------------------------

/// Produces one domain's metrics on demand.
///
/// Calls for the same domain are never concurrent; the scheduler waits for a
/// call to finish before issuing the next one. A sampler that cannot produce a
/// value returns an error rather than a zero.
#[async_trait]
pub trait Sampler: Send + Sync {
    /// The domain this sampler reports for.
    fn domain(&self) -> Domain;

    /// Take one sample.
    async fn sample(&self) -> SamplerResult<FieldMap>;
}

// ----------------------------------------------------------------------------
// Closure Adapter
// ----------------------------------------------------------------------------

type SampleFuture = Pin<Box<dyn Future<Output = SamplerResult<FieldMap>> + Send>>;
type SampleFn = dyn Fn() -> SampleFuture + Send + Sync;

/// Wraps an async closure as a [`Sampler`].
///
/// ```ignore
/// let s = FnSampler::new(Domain::System, || async {
///     Ok(FieldMap::from([("cpu".into(), 12.5)]))
/// });
/// ```
pub struct FnSampler {
    domain: Domain,
    f: Box<SampleFn>,
}

impl FnSampler {
    pub fn new<F, Fut>(domain: Domain, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SamplerResult<FieldMap>> + Send + 'static,
    {
        Self {
            domain,
            f: Box::new(move || Box::pin(f())),
        }
    }
}

impl Debug for FnSampler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnSampler").field("domain", &self.domain).finish()
    }
}

#[async_trait]
impl Sampler for FnSampler {
    fn domain(&self) -> Domain {
        self.domain
    }

    async fn sample(&self) -> SamplerResult<FieldMap> {
        (self.f)().await
    }
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// Build the host samplers enabled in configuration, in domain order.
pub fn build_samplers(config: &SamplersConfig) -> Vec<Arc<dyn Sampler>> {
    let mut samplers: Vec<Arc<dyn Sampler>> = Vec::new();

    if config.system.enabled {
        samplers.push(Arc::new(SystemSampler::new(config.system.clone())));
    }
    if config.tunnel.enabled {
        samplers.push(Arc::new(TunnelSampler::new(config.tunnel.clone())));
    }
    if config.ledger_peer.enabled {
        samplers.push(Arc::new(LedgerPeerSampler::new(config.ledger_peer.clone())));
    }

    samplers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SamplerError;

    #[tokio::test]
    async fn test_fn_sampler_passes_through() {
        let ok = FnSampler::new(Domain::System, || async {
            Ok::<_, SamplerError>(FieldMap::from([("cpu".into(), 12.5)]))
        });
        assert_eq!(ok.domain(), Domain::System);
        assert_eq!(ok.sample().await.unwrap().get("cpu"), Some(&12.5));

        let failing = FnSampler::new(Domain::Tunnel, || async {
            Err::<FieldMap, _>(SamplerError::unavailable(Domain::Tunnel, "no status file"))
        });
        let err = failing.sample().await.unwrap_err();
        assert_eq!(err.domain(), Domain::Tunnel);
    }

    #[test]
    fn test_build_samplers_respects_enabled() {
        let mut config = SamplersConfig::default();
        config.tunnel.enabled = false;
        let domains: Vec<_> = build_samplers(&config).iter().map(|s| s.domain()).collect();
        assert_eq!(domains, vec![Domain::System, Domain::LedgerPeer]);
    }
}
