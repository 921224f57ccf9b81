#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod fixtures;

use grouppolicy_core::{
    chain::ChainInstance,
    memory::{MemoryChains, MemoryPlatform},
    platform::{Network, Port, Router, SecurityGroup, SecurityGroupRule, Subnet},
    TenantId,
};
use grouppolicy_mapping::{Config, Driver, DriverMetrics};
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::sync::Arc;

/// A driver wired to in-memory collaborators, acting for a tenant with a random name.
pub struct Harness {
    pub driver: Driver,
    pub platform: Arc<MemoryPlatform>,
    pub chains: Arc<MemoryChains>,
    pub tenant: TenantId,
    registry: Registry,
    _tracing: tracing::subscriber::DefaultGuard,
}

/// Everything the collaborators hold, for comparing states across events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub networks: Vec<Network>,
    pub subnets: Vec<Subnet>,
    pub routers: Vec<Router>,
    pub ports: Vec<Port>,
    pub security_groups: Vec<(SecurityGroup, Vec<SecurityGroupRule>)>,
    pub chains: Vec<ChainInstance>,
}

/// Runs a test against a fresh harness.
pub fn with_harness<F>(test: F)
where
    F: FnOnce(&Harness),
{
    let harness = Harness::new();
    tracing::debug!(tenant = %harness.tenant, "Running test");
    test(&harness);
}

// === impl Harness ===

impl Harness {
    pub fn new() -> Self {
        Self::with(Config::default(), MemoryChains::new())
    }

    pub fn with(config: Config, chains: MemoryChains) -> Self {
        let _tracing = init_tracing();
        let platform = Arc::new(MemoryPlatform::new());
        let chains = Arc::new(chains);
        let mut registry = <Registry>::default();
        let metrics = DriverMetrics::register(registry.sub_registry_with_prefix("grouppolicy"));
        let driver = Driver::new(config, platform.clone(), chains.clone(), metrics);
        Self {
            driver,
            platform,
            chains,
            tenant: TenantId::new(format!("tenant-{}", random_suffix(6))),
            registry,
            _tracing,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            networks: self.platform.networks(),
            subnets: self.platform.subnets(),
            routers: self.platform.routers(),
            ports: self.platform.ports(),
            security_groups: self
                .platform
                .security_groups()
                .into_iter()
                .map(|sg| {
                    let rules = self.platform.rules(&sg.id);
                    (sg, rules)
                })
                .collect(),
            chains: self.chains.instances(),
        }
    }

    /// The driver's metrics in OpenMetrics text.
    pub fn metrics(&self) -> String {
        let mut text = String::new();
        encode(&mut text, &self.registry).expect("metrics must encode");
        text
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

// === impl Snapshot ===

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
            && self.subnets.is_empty()
            && self.routers.is_empty()
            && self.ports.is_empty()
            && self.security_groups.is_empty()
            && self.chains.is_empty()
    }
}

pub fn random_suffix(len: usize) -> String {
    use rand::Rng;

    let rng = &mut rand::thread_rng();
    (0..len)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "grouppolicy=trace,debug".parse().unwrap()),
            )
            .finish(),
    )
}
