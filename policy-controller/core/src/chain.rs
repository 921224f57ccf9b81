//! The service-chain orchestrator.

use crate::{ChainInstanceId, ChainSpecId, PolicyTargetGroupId, TenantId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T, E = ChainError> = std::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("chain instance {0} not found")]
    NotFound(ChainInstanceId),

    #[error("chain operation failed: {0}")]
    Failed(String),
}

/// A running service chain steering traffic from a consumer group to a provider group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInstance {
    pub id: ChainInstanceId,
    pub tenant_id: TenantId,
    pub name: String,
    pub provider_ptg_id: PolicyTargetGroupId,
    pub consumer_ptg_id: PolicyTargetGroupId,
    pub servicechain_spec: ChainSpecId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainRequest {
    pub tenant_id: TenantId,
    pub name: String,
    pub provider_ptg_id: PolicyTargetGroupId,
    pub consumer_ptg_id: PolicyTargetGroupId,
    pub servicechain_spec: ChainSpecId,
}

/// Selects chain instances. Unset fields match anything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainFilter {
    pub provider_ptg_id: Option<PolicyTargetGroupId>,
    pub consumer_ptg_id: Option<PolicyTargetGroupId>,
    pub servicechain_spec: Option<ChainSpecId>,
}

pub trait ServiceChains: Send + Sync {
    fn instantiate(&self, request: ChainRequest) -> Result<ChainInstance>;
    fn retire(&self, id: &ChainInstanceId) -> Result<()>;
    fn list_instances(&self, filter: &ChainFilter) -> Result<Vec<ChainInstance>>;

    /// Points an existing instance at a new chain specification.
    ///
    /// Returns `false` when the orchestrator cannot update instances in place, in which case the
    /// caller replaces the instance.
    fn respecify(&self, id: &ChainInstanceId, spec: &ChainSpecId) -> Result<bool> {
        let _ = (id, spec);
        Ok(false)
    }
}

// === impl ChainFilter ===

impl ChainFilter {
    pub fn matches(&self, instance: &ChainInstance) -> bool {
        self.provider_ptg_id
            .as_ref()
            .map_or(true, |p| *p == instance.provider_ptg_id)
            && self
                .consumer_ptg_id
                .as_ref()
                .map_or(true, |c| *c == instance.consumer_ptg_id)
            && self
                .servicechain_spec
                .as_ref()
                .map_or(true, |s| *s == instance.servicechain_spec)
    }
}
