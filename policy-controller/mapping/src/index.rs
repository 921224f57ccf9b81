//! The driver's view of policy objects and the primitives derived from them.
//!
//! Objects never embed pointers to their dependents; every cross-object edge is held in a
//! [`Relation`] so that derived state (rules, external reachability, chains) can be recomputed by
//! walking the dependency graph from whatever changed.

use crate::{
    error::{Error, Result},
    redirect::Redirects,
    relation::Relation,
    rules,
    security::SecurityStore,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use grouppolicy_core::{
    cidr::IpSet,
    policy::*,
    ExternalPolicyId, ExternalSegmentId, IpNet, L2PolicyId, L3PolicyId, NetworkId, Owned,
    PolicyActionId, PolicyClassifierId, PolicyRuleId, PolicyRuleSetId, PolicyTargetGroupId,
    PolicyTargetId, PortId, RouterId, SecurityGroupId, SubnetId, TenantId,
};
use std::collections::BTreeSet;

#[derive(Clone, Debug, Default)]
pub(crate) struct Index {
    pub l3_policies: HashMap<L3PolicyId, L3PolicyState>,
    pub l2_policies: HashMap<L2PolicyId, L2PolicyState>,
    pub groups: HashMap<PolicyTargetGroupId, GroupState>,
    pub targets: HashMap<PolicyTargetId, TargetState>,
    pub classifiers: HashMap<PolicyClassifierId, PolicyClassifier>,
    pub actions: HashMap<PolicyActionId, PolicyAction>,
    pub rules: HashMap<PolicyRuleId, PolicyRule>,
    pub rule_sets: HashMap<PolicyRuleSetId, PolicyRuleSet>,
    pub segments: HashMap<ExternalSegmentId, SegmentState>,
    pub external_policies: HashMap<ExternalPolicyId, ExternalPolicy>,

    pub deps: Dependencies,
    pub security: SecurityStore,
    pub redirects: Redirects,

    /// The external segment each router is attached to, and the L3 policies that attached it.
    pub router_segments: HashMap<RouterId, RouterAttachment>,

    /// The implicitly created L3 policy of each tenant.
    pub default_l3_policies: HashMap<TenantId, L3PolicyId>,
}

/// Edges of the dependency graph. Each relation maps an object to its dependents.
#[derive(Clone, Debug, Default)]
pub(crate) struct Dependencies {
    pub classifier_rules: Relation<PolicyClassifierId, PolicyRuleId>,
    pub action_rules: Relation<PolicyActionId, PolicyRuleId>,
    pub rule_rule_sets: Relation<PolicyRuleId, PolicyRuleSetId>,
    pub providers: Relation<PolicyRuleSetId, Party>,
    pub consumers: Relation<PolicyRuleSetId, Party>,
    pub segment_l3_policies: Relation<ExternalSegmentId, L3PolicyId>,
    pub segment_external_policies: Relation<ExternalSegmentId, ExternalPolicyId>,
    pub l3_policy_l2_policies: Relation<L3PolicyId, L2PolicyId>,
    pub l2_policy_groups: Relation<L2PolicyId, PolicyTargetGroupId>,
    pub group_targets: Relation<PolicyTargetGroupId, PolicyTargetId>,
}

/// A provider or consumer of a policy rule set.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Party {
    Group(PolicyTargetGroupId),
    External(ExternalPolicyId),
}

#[derive(Clone, Debug)]
pub(crate) struct L3PolicyState {
    /// The policy as returned to the caller, with derived fields filled in.
    pub policy: L3Policy,
    pub router: Owned<RouterId>,

    /// Set for a tenant's default L3 policy, which is deleted with its last L2 policy.
    pub implicit: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct L2PolicyState {
    pub policy: L2Policy,
    pub network: Owned<NetworkId>,
    pub l3_policy: Owned<L3PolicyId>,
}

#[derive(Clone, Debug)]
pub(crate) struct GroupState {
    pub policy: PolicyTargetGroup,
    pub l2_policy: Owned<L2PolicyId>,
    pub subnets: Vec<GroupSubnet>,
    pub intra_sg: SecurityGroupId,
}

#[derive(Clone, Debug)]
pub(crate) struct GroupSubnet {
    pub subnet: Owned<SubnetId>,
    pub cidr: IpNet,

    /// Whether the driver attached this subnet to the L3 policy's router.
    pub interface: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct TargetState {
    pub policy: PolicyTarget,
    pub port: Owned<PortId>,
}

#[derive(Clone, Debug)]
pub(crate) struct SegmentState {
    pub policy: ExternalSegment,
    pub network_id: NetworkId,
    pub cidr: IpNet,
}

#[derive(Clone, Debug)]
pub(crate) struct RouterAttachment {
    pub segment: ExternalSegmentId,
    pub l3_policies: BTreeSet<L3PolicyId>,
}

// === impl Index ===

impl Index {
    pub(crate) fn l3_policy(&self, id: &L3PolicyId) -> Result<&L3PolicyState> {
        self.l3_policies
            .get(id)
            .ok_or_else(|| Error::not_found(ResourceKind::L3Policy, id))
    }

    pub(crate) fn l2_policy(&self, id: &L2PolicyId) -> Result<&L2PolicyState> {
        self.l2_policies
            .get(id)
            .ok_or_else(|| Error::not_found(ResourceKind::L2Policy, id))
    }

    pub(crate) fn group(&self, id: &PolicyTargetGroupId) -> Result<&GroupState> {
        self.groups
            .get(id)
            .ok_or_else(|| Error::not_found(ResourceKind::PolicyTargetGroup, id))
    }

    pub(crate) fn target(&self, id: &PolicyTargetId) -> Result<&TargetState> {
        self.targets
            .get(id)
            .ok_or_else(|| Error::not_found(ResourceKind::PolicyTarget, id))
    }

    pub(crate) fn classifier(&self, id: &PolicyClassifierId) -> Result<&PolicyClassifier> {
        self.classifiers
            .get(id)
            .ok_or_else(|| Error::not_found(ResourceKind::PolicyClassifier, id))
    }

    pub(crate) fn action(&self, id: &PolicyActionId) -> Result<&PolicyAction> {
        self.actions
            .get(id)
            .ok_or_else(|| Error::not_found(ResourceKind::PolicyAction, id))
    }

    pub(crate) fn rule(&self, id: &PolicyRuleId) -> Result<&PolicyRule> {
        self.rules
            .get(id)
            .ok_or_else(|| Error::not_found(ResourceKind::PolicyRule, id))
    }

    pub(crate) fn rule_set(&self, id: &PolicyRuleSetId) -> Result<&PolicyRuleSet> {
        self.rule_sets
            .get(id)
            .ok_or_else(|| Error::not_found(ResourceKind::PolicyRuleSet, id))
    }

    pub(crate) fn segment(&self, id: &ExternalSegmentId) -> Result<&SegmentState> {
        self.segments
            .get(id)
            .ok_or_else(|| Error::not_found(ResourceKind::ExternalSegment, id))
    }

    pub(crate) fn external_policy(&self, id: &ExternalPolicyId) -> Result<&ExternalPolicy> {
        self.external_policies
            .get(id)
            .ok_or_else(|| Error::not_found(ResourceKind::ExternalPolicy, id))
    }

    pub(crate) fn check_rule_sets<'r>(
        &self,
        ids: impl IntoIterator<Item = &'r PolicyRuleSetId>,
    ) -> Result<()> {
        for id in ids {
            self.rule_set(id)?;
        }
        Ok(())
    }

    /// The address pools of every known L3 policy.
    pub(crate) fn pools(&self) -> impl Iterator<Item = IpNet> + '_ {
        self.l3_policies.values().map(|s| s.policy.ip_pool)
    }

    /// The destinations routable through a segment that lie outside every L3 policy's pool.
    pub(crate) fn external_cidrs(&self, segment: &ExternalSegmentId) -> IpSet {
        match self.segments.get(segment) {
            Some(s) => rules::external_reachable(
                s.policy.external_routes.iter().map(|r| r.destination),
                self.pools(),
            ),
            None => IpSet::default(),
        }
    }

    /// The addresses a party contributes to a contract.
    pub(crate) fn party_cidrs(&self, party: &Party) -> Vec<IpNet> {
        match party {
            Party::Group(id) => self
                .groups
                .get(id)
                .map(|g| g.subnets.iter().map(|s| s.cidr).collect())
                .unwrap_or_default(),
            Party::External(id) => self
                .external_policies
                .get(id)
                .into_iter()
                .flat_map(|ep| ep.external_segments.iter())
                .flat_map(|es| self.external_cidrs(es))
                .collect(),
        }
    }

    /// Rule sets that have an external policy as a party.
    pub(crate) fn external_rule_sets(&self) -> BTreeSet<PolicyRuleSetId> {
        self.external_policies
            .values()
            .flat_map(|ep| {
                ep.provided_policy_rule_sets
                    .iter()
                    .chain(&ep.consumed_policy_rule_sets)
                    .cloned()
            })
            .collect()
    }

    /// Rule sets with an external policy on the given segment as a party.
    pub(crate) fn segment_rule_sets(&self, segment: &ExternalSegmentId) -> BTreeSet<PolicyRuleSetId> {
        self.deps
            .segment_external_policies
            .get(segment)
            .iter()
            .filter_map(|ep| self.external_policies.get(ep))
            .flat_map(|ep| {
                ep.provided_policy_rule_sets
                    .iter()
                    .chain(&ep.consumed_policy_rule_sets)
                    .cloned()
            })
            .collect()
    }

    /// Rule sets that include a rule.
    pub(crate) fn rule_rule_sets<'r>(
        &self,
        rules: impl IntoIterator<Item = &'r PolicyRuleId>,
    ) -> BTreeSet<PolicyRuleSetId> {
        rules
            .into_iter()
            .flat_map(|rule| self.deps.rule_rule_sets.get(rule))
            .collect()
    }

    pub(crate) fn classifier_rule_sets(&self, id: &PolicyClassifierId) -> BTreeSet<PolicyRuleSetId> {
        self.rule_rule_sets(&self.deps.classifier_rules.get(id))
    }

    pub(crate) fn action_rule_sets(&self, id: &PolicyActionId) -> BTreeSet<PolicyRuleSetId> {
        self.rule_rule_sets(&self.deps.action_rules.get(id))
    }

    /// The groups a group's ports are bound to, in binding order.
    pub(crate) fn port_groups(&self, group: &GroupState) -> Vec<SecurityGroupId> {
        let mut sgs = vec![group.intra_sg.clone()];
        let mut seen = HashSet::new();
        seen.insert(group.intra_sg.clone());

        let provided = group
            .policy
            .provided_policy_rule_sets
            .iter()
            .filter_map(|rs| self.security.get(rs))
            .map(|m| m.provided.clone());
        let consumed = group
            .policy
            .consumed_policy_rule_sets
            .iter()
            .filter_map(|rs| self.security.get(rs))
            .map(|m| m.consumed.clone());
        for sg in provided.chain(consumed) {
            if seen.insert(sg.clone()) {
                sgs.push(sg);
            }
        }
        sgs
    }

    /// Every L2 policy network under an L3 policy.
    pub(crate) fn l3_policy_networks(&self, l3p: &L3PolicyId) -> Vec<NetworkId> {
        let mut networks = self
            .deps
            .l3_policy_l2_policies
            .get(l3p)
            .iter()
            .filter_map(|l2p| self.l2_policies.get(l2p))
            .map(|s| s.network.id.clone())
            .collect::<Vec<_>>();
        networks.sort();
        networks.dedup();
        networks
    }
}

// === impl Party ===

impl Party {
    pub(crate) fn group(&self) -> Option<&PolicyTargetGroupId> {
        match self {
            Self::Group(id) => Some(id),
            Self::External(_) => None,
        }
    }
}

// === impl Dependencies ===

impl Dependencies {
    /// Replaces a party's memberships, returning every rule set it was or is now a party to.
    pub(crate) fn set_party(
        &mut self,
        party: &Party,
        provided: &[PolicyRuleSetId],
        consumed: &[PolicyRuleSetId],
    ) -> BTreeSet<PolicyRuleSetId> {
        let mut touched = self.providers.remove_reverse(party);
        touched.extend(self.consumers.remove_reverse(party));
        for rs in provided {
            self.providers.link(rs.clone(), party.clone());
        }
        for rs in consumed {
            self.consumers.link(rs.clone(), party.clone());
        }
        touched.extend(provided.iter().cloned());
        touched.extend(consumed.iter().cloned());
        touched.into_iter().collect()
    }

    /// Replaces the rules a rule set includes.
    pub(crate) fn set_rule_set_rules(&mut self, rs: &PolicyRuleSetId, rules: &[PolicyRuleId]) {
        self.rule_rule_sets.remove_reverse(rs);
        for rule in rules {
            self.rule_rule_sets.link(rule.clone(), rs.clone());
        }
    }

    /// Replaces the classifier and actions a rule uses.
    pub(crate) fn set_rule(&mut self, rule: &PolicyRule) {
        self.remove_rule(&rule.id);
        self.classifier_rules
            .link(rule.policy_classifier_id.clone(), rule.id.clone());
        for action in &rule.policy_actions {
            self.action_rules.link(action.clone(), rule.id.clone());
        }
    }

    pub(crate) fn remove_rule(&mut self, rule: &PolicyRuleId) {
        self.classifier_rules.remove_reverse(rule);
        self.action_rules.remove_reverse(rule);
    }
}
