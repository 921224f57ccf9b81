use super::Reconcile;
use crate::{
    allocator,
    error::{Error, Result},
    index::{L2PolicyState, L3PolicyState},
};
use grouppolicy_core::{
    policy::{L2Policy, L3Policy},
    ExternalSegmentId, L2PolicyId, L3PolicyId, Owned, TenantId,
};
use std::{collections::BTreeMap, net::IpAddr};

impl Reconcile<'_, '_> {
    pub(super) fn create_l3_policy(&mut self, mut l3p: L3Policy, implicit: bool) -> Result<L3Policy> {
        if l3p.routers.len() > 1 {
            return Err(Error::L3PolicyMultipleRoutersNotSupported);
        }
        if l3p.external_segments.len() > 1 {
            return Err(Error::MultipleESPerL3PolicyNotSupported);
        }
        allocator::check_prefix_length(&l3p.ip_pool, l3p.subnet_prefix_length)?;
        allocator::check_pool_overlap(self.index, &l3p)?;
        for es in l3p.external_segments.keys() {
            self.index.segment(es)?;
        }
        if l3p.external_segments.is_empty() {
            if let Some(es) = self.default_segment(&l3p.tenant_id) {
                tracing::debug!(l3p = %l3p.id, segment = %es, "Using default external segment");
                l3p.external_segments.insert(es, Vec::new());
            }
        }

        let router = allocator::allocate_router(self.txn, &l3p)?;
        l3p.routers = vec![router.id.clone()];
        tracing::debug!(
            l3p = %l3p.id,
            router = %router.id,
            ownership = ?router.ownership,
            "Allocated router",
        );

        let requested = first_segment(&l3p.external_segments);
        l3p.external_segments.clear();
        self.index.l3_policies.insert(
            l3p.id.clone(),
            L3PolicyState {
                policy: l3p.clone(),
                router: router.clone(),
                implicit,
            },
        );
        if let Some((es, fixed_ips)) = requested {
            let assigned = allocator::attach_segment(
                self.index,
                self.txn,
                &l3p.id,
                &router.id,
                &es,
                &fixed_ips,
            )?;
            self.index
                .deps
                .segment_l3_policies
                .link(es.clone(), l3p.id.clone());
            l3p.external_segments.insert(es, assigned);
            self.store_l3_policy(&l3p);
        }

        // A new pool may hide destinations that were reachable externally.
        self.sync_external_rule_sets()?;
        Ok(l3p)
    }

    pub(super) fn update_l3_policy(&mut self, after: L3Policy) -> Result<L3Policy> {
        let current = self.index.l3_policy(&after.id)?.clone();
        if after.ip_pool != current.policy.ip_pool {
            return Err(Error::L3PolicyIpPoolUpdateNotSupported);
        }
        if !after.routers.is_empty() && after.routers != current.policy.routers {
            return Err(Error::L3PolicyRoutersUpdateNotSupported);
        }
        if after.external_segments.len() > 1 {
            return Err(Error::MultipleESPerL3PolicyNotSupported);
        }
        allocator::check_prefix_length(&after.ip_pool, after.subnet_prefix_length)?;
        for es in after.external_segments.keys() {
            self.index.segment(es)?;
        }

        let router = current.router.id.clone();
        let attached = first_segment(&current.policy.external_segments);
        let requested = first_segment(&after.external_segments);
        let mut policy = L3Policy {
            routers: current.policy.routers.clone(),
            external_segments: BTreeMap::new(),
            ..after
        };

        match (attached, requested) {
            (Some((old, assigned)), Some((new, fixed_ips))) if old == new => {
                // An empty address list keeps the current assignment.
                let ips = if fixed_ips.is_empty() || fixed_ips == assigned {
                    assigned
                } else {
                    allocator::attach_segment(
                        self.index, self.txn, &policy.id, &router, &new, &fixed_ips,
                    )?
                };
                policy.external_segments.insert(new, ips);
            }
            (attached, requested) => {
                if let Some((old, _)) = attached {
                    allocator::detach_segment(self.index, self.txn, &policy.id, &router)?;
                    self.index
                        .deps
                        .segment_l3_policies
                        .unlink(&old, &policy.id);
                }
                if let Some((new, fixed_ips)) = requested {
                    let ips = allocator::attach_segment(
                        self.index, self.txn, &policy.id, &router, &new, &fixed_ips,
                    )?;
                    self.index
                        .deps
                        .segment_l3_policies
                        .link(new.clone(), policy.id.clone());
                    policy.external_segments.insert(new, ips);
                }
            }
        }

        self.store_l3_policy(&policy);
        Ok(policy)
    }

    pub(super) fn delete_l3_policy(&mut self, id: &L3PolicyId) -> Result<()> {
        let state = self.index.l3_policy(id)?.clone();
        if self.index.deps.l3_policy_l2_policies.has(id) {
            return Err(Error::L3PolicyInUse(id.clone()));
        }

        allocator::detach_segment(self.index, self.txn, id, &state.router.id)?;
        for es in state.policy.external_segments.keys() {
            self.index.deps.segment_l3_policies.unlink(es, id);
        }
        allocator::release_if_owned(self.txn, state.router);
        self.index.l3_policies.remove(id);
        self.index.default_l3_policies.retain(|_, l3p| l3p != id);

        self.sync_external_rule_sets()
    }

    pub(super) fn create_l2_policy(&mut self, mut l2p: L2Policy) -> Result<L2Policy> {
        let l3_policy = match &l2p.l3_policy_id {
            Some(id) => {
                let l3p = &self.index.l3_policy(id)?.policy;
                if l3p.tenant_id != l2p.tenant_id || (l2p.shared && !l3p.shared) {
                    return Err(Error::CrossTenantL2PolicyL3PolicyNotSupported {
                        l2_policy: l2p.id.clone(),
                        tenant: l2p.tenant_id.clone(),
                        l3_policy: id.clone(),
                    });
                }
                Owned::explicit(id.clone())
            }
            None => Owned::implicit(self.default_l3_policy(&l2p.tenant_id)?),
        };

        let network = allocator::allocate_network(self.txn, &l2p)?;
        l2p.l3_policy_id = Some(l3_policy.id.clone());
        l2p.network_id = Some(network.id.clone());
        tracing::debug!(
            l2p = %l2p.id,
            l3p = %l3_policy.id,
            network = %network.id,
            ownership = ?network.ownership,
            "Allocated network",
        );

        self.index
            .deps
            .l3_policy_l2_policies
            .link(l3_policy.id.clone(), l2p.id.clone());
        self.index.l2_policies.insert(
            l2p.id.clone(),
            L2PolicyState {
                policy: l2p.clone(),
                network,
                l3_policy,
            },
        );
        Ok(l2p)
    }

    pub(super) fn update_l2_policy(&mut self, after: L2Policy) -> Result<L2Policy> {
        let current = self.index.l2_policy(&after.id)?.clone();
        if matches!(&after.l3_policy_id, Some(id) if *id != current.l3_policy.id) {
            return Err(Error::L3PolicyUpdateOfL2PolicyNotSupported);
        }
        if matches!(&after.network_id, Some(id) if *id != current.network.id) {
            return Err(Error::L2PolicyNetworkUpdateNotSupported);
        }
        if after.shared && !current.policy.shared {
            let network = self.txn.platform().get_network(&current.network.id)?;
            if !network.shared {
                return Err(Error::NonSharedNetworkOnSharedL2PolicyNotSupported {
                    l2_policy: after.id.clone(),
                    network: network.id,
                });
            }
        }

        let policy = L2Policy {
            l3_policy_id: Some(current.l3_policy.id.clone()),
            network_id: Some(current.network.id.clone()),
            ..after
        };
        if let Some(state) = self.index.l2_policies.get_mut(&policy.id) {
            state.policy = policy.clone();
        }
        Ok(policy)
    }

    pub(super) fn delete_l2_policy(&mut self, id: &L2PolicyId) -> Result<()> {
        let state = self.index.l2_policy(id)?.clone();
        if self.index.deps.l2_policy_groups.has(id) {
            return Err(Error::L2PolicyInUse(id.clone()));
        }

        allocator::release_if_owned(self.txn, state.network);
        self.index
            .deps
            .l3_policy_l2_policies
            .unlink(&state.l3_policy.id, id);
        self.index.l2_policies.remove(id);

        // A tenant's default L3 policy lives only as long as its L2 policies.
        let l3p = &state.l3_policy.id;
        let cascade = self.index.l3_policies.get(l3p).map_or(false, |s| s.implicit)
            && !self.index.deps.l3_policy_l2_policies.has(l3p);
        if cascade {
            tracing::debug!(%l3p, "Deleting default L3 policy");
            self.delete_l3_policy(l3p)?;
        }
        Ok(())
    }

    /// The tenant's default L3 policy, created on first use.
    fn default_l3_policy(&mut self, tenant: &TenantId) -> Result<L3PolicyId> {
        if let Some(id) = self.index.default_l3_policies.get(tenant) {
            return Ok(id.clone());
        }
        let named = self
            .index
            .l3_policies
            .values()
            .map(|s| &s.policy)
            .filter(|l3p| l3p.tenant_id == *tenant && l3p.name == self.config.default_l3_policy_name)
            .map(|l3p| l3p.id.clone())
            .min();
        if let Some(id) = named {
            return Ok(id);
        }

        let l3p = self.create_l3_policy(
            L3Policy {
                id: L3PolicyId::generate(),
                tenant_id: tenant.clone(),
                name: self.config.default_l3_policy_name.clone(),
                ip_pool: self.config.default_ip_pool,
                subnet_prefix_length: self.config.default_subnet_prefix_length,
                routers: Vec::new(),
                external_segments: BTreeMap::new(),
                shared: false,
            },
            true,
        )?;
        tracing::info!(%tenant, l3p = %l3p.id, pool = %l3p.ip_pool, "Created default L3 policy");
        self.index
            .default_l3_policies
            .insert(tenant.clone(), l3p.id.clone());
        Ok(l3p.id)
    }

    /// The segment L3 policies without external segments are attached to, preferring one owned
    /// by the tenant over a shared one.
    fn default_segment(&self, tenant: &TenantId) -> Option<ExternalSegmentId> {
        let name = &self.config.default_external_segment_name;
        let mut candidates = self
            .index
            .segments
            .values()
            .map(|s| &s.policy)
            .filter(|es| es.name == *name && (es.tenant_id == *tenant || es.shared))
            .map(|es| (es.tenant_id != *tenant, es.id.clone()))
            .collect::<Vec<_>>();
        candidates.sort();
        candidates.into_iter().next().map(|(_, id)| id)
    }

    fn store_l3_policy(&mut self, l3p: &L3Policy) {
        if let Some(state) = self.index.l3_policies.get_mut(&l3p.id) {
            state.policy = l3p.clone();
        }
    }
}

fn first_segment(
    segments: &BTreeMap<ExternalSegmentId, Vec<IpAddr>>,
) -> Option<(ExternalSegmentId, Vec<IpAddr>)> {
    segments
        .iter()
        .next()
        .map(|(es, ips)| (es.clone(), ips.clone()))
}
