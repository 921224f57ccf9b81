use super::Reconcile;
use crate::{
    allocator,
    error::{Error, Result},
    index::{Party, SegmentState},
};
use grouppolicy_core::{
    policy::{ExternalPolicy, ExternalSegment, ResourceKind},
    ExternalPolicyId, ExternalSegmentId, PolicyRuleSetId,
};
use std::collections::BTreeSet;

impl Reconcile<'_, '_> {
    pub(super) fn create_external_segment(
        &mut self,
        mut es: ExternalSegment,
    ) -> Result<ExternalSegment> {
        let Some(id) = es.subnet_id.clone() else {
            return Err(Error::ImplicitSubnetNotSupported);
        };
        let subnet = self.txn.platform().get_subnet(&id).map_err(|error| {
            if error.is_not_found() {
                Error::ReferencedSubnetNotFound(id.clone())
            } else {
                error.into()
            }
        })?;

        es.cidr = Some(subnet.cidr);
        es.network_id = Some(subnet.network_id.clone());
        tracing::debug!(
            segment = %es.id,
            network = %subnet.network_id,
            cidr = %subnet.cidr,
            "Resolved external segment subnet",
        );
        self.index.segments.insert(
            es.id.clone(),
            SegmentState {
                policy: es.clone(),
                network_id: subnet.network_id,
                cidr: subnet.cidr,
            },
        );
        Ok(es)
    }

    pub(super) fn update_external_segment(
        &mut self,
        after: ExternalSegment,
    ) -> Result<ExternalSegment> {
        let current = self.index.segment(&after.id)?.clone();
        if matches!(&after.subnet_id, Some(id) if Some(id) != current.policy.subnet_id.as_ref()) {
            return Err(Error::InvalidAttributeUpdateForES("subnet_id"));
        }
        if after.port_address_translation != current.policy.port_address_translation {
            return Err(Error::InvalidAttributeUpdateForES("port_address_translation"));
        }

        let policy = ExternalSegment {
            subnet_id: current.policy.subnet_id.clone(),
            cidr: Some(current.cidr),
            network_id: Some(current.network_id.clone()),
            ..after
        };
        let rerouted = policy.external_routes != current.policy.external_routes;
        self.index.segments.insert(
            policy.id.clone(),
            SegmentState {
                policy: policy.clone(),
                ..current
            },
        );

        if rerouted {
            allocator::reroute_segment(self.index, self.txn, &policy.id)?;
            // Reachable destinations changed for every contract with a party on this segment.
            let touched = self.index.segment_rule_sets(&policy.id);
            self.sync_rule_sets(touched)?;
        }
        Ok(policy)
    }

    pub(super) fn delete_external_segment(&mut self, id: &ExternalSegmentId) -> Result<()> {
        self.index.segment(id)?;
        if self.index.deps.segment_l3_policies.has(id)
            || self.index.deps.segment_external_policies.has(id)
        {
            return Err(Error::ExternalSegmentInUse(id.clone()));
        }
        self.index.segments.remove(id);
        Ok(())
    }

    pub(super) fn create_external_policy(&mut self, ep: ExternalPolicy) -> Result<ExternalPolicy> {
        if ep.shared {
            return Err(Error::InvalidSharedResource(ResourceKind::ExternalPolicy));
        }
        let segment = match ep.external_segments.as_slice() {
            [] => return Err(Error::ESIdRequiredWhenCreatingEP),
            [es] => es.clone(),
            _ => return Err(Error::MultipleESPerEPNotSupported),
        };
        let exists = self
            .index
            .external_policies
            .values()
            .any(|other| other.id != ep.id && other.tenant_id == ep.tenant_id);
        if exists {
            return Err(Error::OnlyOneEPPerTenantAllowed(ep.tenant_id.clone()));
        }
        self.index.segment(&segment)?;
        self.check_party_rule_sets(&ep)?;

        self.index
            .deps
            .segment_external_policies
            .link(segment, ep.id.clone());
        let touched = self.set_external_party(&ep);
        self.index.external_policies.insert(ep.id.clone(), ep.clone());

        self.sync_rule_sets(touched)?;
        Ok(ep)
    }

    pub(super) fn update_external_policy(&mut self, after: ExternalPolicy) -> Result<ExternalPolicy> {
        let current = self.index.external_policy(&after.id)?;
        if after.shared {
            return Err(Error::InvalidSharedResource(ResourceKind::ExternalPolicy));
        }
        if after.external_segments != current.external_segments {
            return Err(Error::ESUpdateNotSupportedForEP);
        }
        self.check_party_rule_sets(&after)?;

        let touched = self.set_external_party(&after);
        self.index
            .external_policies
            .insert(after.id.clone(), after.clone());

        self.sync_rule_sets(touched)?;
        Ok(after)
    }

    pub(super) fn delete_external_policy(&mut self, id: &ExternalPolicyId) -> Result<()> {
        let ep = self.index.external_policy(id)?.clone();

        let touched = self
            .index
            .deps
            .set_party(&Party::External(id.clone()), &[], &[]);
        for es in &ep.external_segments {
            self.index.deps.segment_external_policies.unlink(es, id);
        }
        self.index.external_policies.remove(id);

        self.sync_rule_sets(touched)
    }

    fn check_party_rule_sets(&self, ep: &ExternalPolicy) -> Result<()> {
        self.index.check_rule_sets(
            ep.provided_policy_rule_sets
                .iter()
                .chain(&ep.consumed_policy_rule_sets),
        )
    }

    fn set_external_party(&mut self, ep: &ExternalPolicy) -> BTreeSet<PolicyRuleSetId> {
        self.index.deps.set_party(
            &Party::External(ep.id.clone()),
            &ep.provided_policy_rule_sets,
            &ep.consumed_policy_rule_sets,
        )
    }
}
