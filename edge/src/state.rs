//! Shared edge state wired once at boot.

use std::sync::Arc;

use crate::config::EdgeConfig;
use crate::domains::DomainRegistry;
use crate::identity::IdentityGate;
use crate::metrics::Metrics;
use crate::recorder::WebhookRecorder;
use crate::registry::TunnelRegistry;
use crate::store::Store;
use crate::subdomain::SubdomainAllocator;

#[derive(Clone)]
pub struct EdgeState {
    pub config: Arc<EdgeConfig>,
    pub store: Store,
    pub identity: Arc<IdentityGate>,
    pub allocator: Arc<SubdomainAllocator>,
    pub domains: Arc<DomainRegistry>,
    pub registry: Arc<TunnelRegistry>,
    pub recorder: Arc<WebhookRecorder>,
    pub metrics: Metrics,
}

impl EdgeState {
    /// Wire the component graph and load persisted state.
    pub async fn build(config: EdgeConfig, store: Store) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let identity = Arc::new(IdentityGate::new(store.clone(), config.jwt_secret.clone()));
        let allocator = Arc::new(SubdomainAllocator::new(store.clone(), config.grace_window));
        let domains = Arc::new(DomainRegistry::new(
            store.clone(),
            config.base_domain.clone(),
        ));
        allocator.load().await?;
        domains.load().await?;

        let registry = Arc::new(TunnelRegistry::new(
            Arc::clone(&allocator),
            Arc::clone(&domains),
            Arc::clone(&config),
        ));
        registry.start_reaper();

        let recorder = Arc::new(WebhookRecorder::new(
            config.capture_ring_size,
            config.capture_max_bytes,
        ));

        Ok(Self {
            config,
            store,
            identity,
            allocator,
            domains,
            registry,
            recorder,
            metrics: Metrics::new(),
        })
    }
}
