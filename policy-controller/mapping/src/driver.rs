//! Lifecycle event handling.
//!
//! Handlers run one at a time under the driver's lock. Each works against a snapshot of the index
//! and a fresh [`Txn`]. When the handler or one of the releases it deferred fails, the transaction
//! is rolled back and the snapshot restored, so a failed event leaves no new derived state or
//! platform objects behind.

mod contract;
mod external;
mod group;
mod topology;

use crate::{
    error::{Error, ErrorClass, Result},
    index::Index,
    metrics::DriverMetrics,
    redirect::{self, ChainKey, ChainState},
    security::{self, RuleEntries, SecurityGroupMapping},
    txn::Txn,
    Config,
};
use grouppolicy_core::{
    chain::ServiceChains,
    cidr::IpSet,
    platform::Platform,
    policy::*,
    ExternalPolicyId, ExternalSegmentId, IpNet, L2PolicyId, L3PolicyId, PolicyActionId,
    PolicyClassifierId, PolicyRuleId, PolicyRuleSetId, PolicyTargetGroupId, PolicyTargetId,
    SecurityGroupId, TenantId,
};
use parking_lot::Mutex;
use std::{collections::BTreeSet, fmt, sync::Arc, time::Instant};

pub struct Driver {
    config: Config,
    platform: Arc<dyn Platform>,
    chains: Arc<dyn ServiceChains>,
    index: Mutex<Index>,
    metrics: DriverMetrics,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Update,
    Delete,
}

/// A lifecycle event emitted by the policy API layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Create(Resource),
    Update { before: Resource, after: Resource },
    Delete(Resource),
}

/// The state a handler works with for the duration of one event.
struct Reconcile<'a, 'p> {
    config: &'a Config,
    index: &'a mut Index,
    txn: &'a mut Txn<'p>,
}

// === impl Driver ===

impl Driver {
    pub fn new(
        config: Config,
        platform: Arc<dyn Platform>,
        chains: Arc<dyn ServiceChains>,
        metrics: DriverMetrics,
    ) -> Self {
        Self {
            config,
            platform,
            chains,
            index: Mutex::new(Index::default()),
            metrics,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handles an event, returning the created or updated object with its derived fields.
    pub fn handle(&self, event: Event) -> Result<Option<Resource>> {
        match event {
            Event::Create(resource) => self.create(resource).map(Some),
            Event::Update { before, after } => self.update(before, after).map(Some),
            Event::Delete(resource) => self.delete(resource).map(|()| None),
        }
    }

    fn create(&self, resource: Resource) -> Result<Resource> {
        let resource = match resource {
            Resource::L3Policy(r) => Resource::L3Policy(self.create_l3_policy(r)?),
            Resource::L2Policy(r) => Resource::L2Policy(self.create_l2_policy(r)?),
            Resource::PolicyTargetGroup(r) => {
                Resource::PolicyTargetGroup(self.create_policy_target_group(r)?)
            }
            Resource::PolicyTarget(r) => Resource::PolicyTarget(self.create_policy_target(r)?),
            Resource::PolicyClassifier(r) => {
                Resource::PolicyClassifier(self.create_policy_classifier(r)?)
            }
            Resource::PolicyAction(r) => Resource::PolicyAction(self.create_policy_action(r)?),
            Resource::PolicyRule(r) => Resource::PolicyRule(self.create_policy_rule(r)?),
            Resource::PolicyRuleSet(r) => Resource::PolicyRuleSet(self.create_policy_rule_set(r)?),
            Resource::ExternalSegment(r) => {
                Resource::ExternalSegment(self.create_external_segment(r)?)
            }
            Resource::ExternalPolicy(r) => {
                Resource::ExternalPolicy(self.create_external_policy(r)?)
            }
        };
        Ok(resource)
    }

    fn update(&self, before: Resource, after: Resource) -> Result<Resource> {
        let resource = match (before, after) {
            (Resource::L3Policy(b), Resource::L3Policy(a)) => {
                Resource::L3Policy(self.update_l3_policy(&b, a)?)
            }
            (Resource::L2Policy(b), Resource::L2Policy(a)) => {
                Resource::L2Policy(self.update_l2_policy(&b, a)?)
            }
            (Resource::PolicyTargetGroup(b), Resource::PolicyTargetGroup(a)) => {
                Resource::PolicyTargetGroup(self.update_policy_target_group(&b, a)?)
            }
            (Resource::PolicyTarget(b), Resource::PolicyTarget(a)) => {
                Resource::PolicyTarget(self.update_policy_target(&b, a)?)
            }
            (Resource::PolicyClassifier(b), Resource::PolicyClassifier(a)) => {
                Resource::PolicyClassifier(self.update_policy_classifier(&b, a)?)
            }
            (Resource::PolicyAction(b), Resource::PolicyAction(a)) => {
                Resource::PolicyAction(self.update_policy_action(&b, a)?)
            }
            (Resource::PolicyRule(b), Resource::PolicyRule(a)) => {
                Resource::PolicyRule(self.update_policy_rule(&b, a)?)
            }
            (Resource::PolicyRuleSet(b), Resource::PolicyRuleSet(a)) => {
                Resource::PolicyRuleSet(self.update_policy_rule_set(&b, a)?)
            }
            (Resource::ExternalSegment(b), Resource::ExternalSegment(a)) => {
                Resource::ExternalSegment(self.update_external_segment(&b, a)?)
            }
            (Resource::ExternalPolicy(b), Resource::ExternalPolicy(a)) => {
                Resource::ExternalPolicy(self.update_external_policy(&b, a)?)
            }
            (_, after) => return Err(Error::MismatchedUpdate(after.id().to_string())),
        };
        Ok(resource)
    }

    fn delete(&self, resource: Resource) -> Result<()> {
        match resource {
            Resource::L3Policy(r) => self.delete_l3_policy(&r),
            Resource::L2Policy(r) => self.delete_l2_policy(&r),
            Resource::PolicyTargetGroup(r) => self.delete_policy_target_group(&r),
            Resource::PolicyTarget(r) => self.delete_policy_target(&r),
            Resource::PolicyClassifier(r) => self.delete_policy_classifier(&r),
            Resource::PolicyAction(r) => self.delete_policy_action(&r),
            Resource::PolicyRule(r) => self.delete_policy_rule(&r),
            Resource::PolicyRuleSet(r) => self.delete_policy_rule_set(&r),
            Resource::ExternalSegment(r) => self.delete_external_segment(&r),
            Resource::ExternalPolicy(r) => self.delete_external_policy(&r),
        }
    }

    pub fn create_l3_policy(&self, l3p: L3Policy) -> Result<L3Policy> {
        let id = l3p.id.to_string();
        self.transact(ResourceKind::L3Policy, Op::Create, id, |r| {
            r.create_l3_policy(l3p, false)
        })
    }

    pub fn update_l3_policy(&self, before: &L3Policy, after: L3Policy) -> Result<L3Policy> {
        check_update(&before.id, &after.id)?;
        let id = after.id.to_string();
        self.transact(ResourceKind::L3Policy, Op::Update, id, |r| {
            r.update_l3_policy(after)
        })
    }

    pub fn delete_l3_policy(&self, l3p: &L3Policy) -> Result<()> {
        self.transact(ResourceKind::L3Policy, Op::Delete, l3p.id.to_string(), |r| {
            r.delete_l3_policy(&l3p.id)
        })
    }

    pub fn create_l2_policy(&self, l2p: L2Policy) -> Result<L2Policy> {
        let id = l2p.id.to_string();
        self.transact(ResourceKind::L2Policy, Op::Create, id, |r| {
            r.create_l2_policy(l2p)
        })
    }

    pub fn update_l2_policy(&self, before: &L2Policy, after: L2Policy) -> Result<L2Policy> {
        check_update(&before.id, &after.id)?;
        let id = after.id.to_string();
        self.transact(ResourceKind::L2Policy, Op::Update, id, |r| {
            r.update_l2_policy(after)
        })
    }

    pub fn delete_l2_policy(&self, l2p: &L2Policy) -> Result<()> {
        self.transact(ResourceKind::L2Policy, Op::Delete, l2p.id.to_string(), |r| {
            r.delete_l2_policy(&l2p.id)
        })
    }

    pub fn create_policy_target_group(&self, ptg: PolicyTargetGroup) -> Result<PolicyTargetGroup> {
        let id = ptg.id.to_string();
        self.transact(ResourceKind::PolicyTargetGroup, Op::Create, id, |r| {
            r.create_policy_target_group(ptg)
        })
    }

    pub fn update_policy_target_group(
        &self,
        before: &PolicyTargetGroup,
        after: PolicyTargetGroup,
    ) -> Result<PolicyTargetGroup> {
        check_update(&before.id, &after.id)?;
        let id = after.id.to_string();
        self.transact(ResourceKind::PolicyTargetGroup, Op::Update, id, |r| {
            r.update_policy_target_group(after)
        })
    }

    pub fn delete_policy_target_group(&self, ptg: &PolicyTargetGroup) -> Result<()> {
        let id = ptg.id.to_string();
        self.transact(ResourceKind::PolicyTargetGroup, Op::Delete, id, |r| {
            r.delete_policy_target_group(&ptg.id)
        })
    }

    pub fn create_policy_target(&self, pt: PolicyTarget) -> Result<PolicyTarget> {
        let id = pt.id.to_string();
        self.transact(ResourceKind::PolicyTarget, Op::Create, id, |r| {
            r.create_policy_target(pt)
        })
    }

    pub fn update_policy_target(
        &self,
        before: &PolicyTarget,
        after: PolicyTarget,
    ) -> Result<PolicyTarget> {
        check_update(&before.id, &after.id)?;
        let id = after.id.to_string();
        self.transact(ResourceKind::PolicyTarget, Op::Update, id, |r| {
            r.update_policy_target(after)
        })
    }

    pub fn delete_policy_target(&self, pt: &PolicyTarget) -> Result<()> {
        self.transact(ResourceKind::PolicyTarget, Op::Delete, pt.id.to_string(), |r| {
            r.delete_policy_target(&pt.id)
        })
    }

    pub fn create_policy_classifier(&self, pc: PolicyClassifier) -> Result<PolicyClassifier> {
        let id = pc.id.to_string();
        self.transact(ResourceKind::PolicyClassifier, Op::Create, id, |r| {
            r.create_policy_classifier(pc)
        })
    }

    pub fn update_policy_classifier(
        &self,
        before: &PolicyClassifier,
        after: PolicyClassifier,
    ) -> Result<PolicyClassifier> {
        check_update(&before.id, &after.id)?;
        let id = after.id.to_string();
        self.transact(ResourceKind::PolicyClassifier, Op::Update, id, |r| {
            r.update_policy_classifier(after)
        })
    }

    pub fn delete_policy_classifier(&self, pc: &PolicyClassifier) -> Result<()> {
        let id = pc.id.to_string();
        self.transact(ResourceKind::PolicyClassifier, Op::Delete, id, |r| {
            r.delete_policy_classifier(&pc.id)
        })
    }

    pub fn create_policy_action(&self, pa: PolicyAction) -> Result<PolicyAction> {
        let id = pa.id.to_string();
        self.transact(ResourceKind::PolicyAction, Op::Create, id, |r| {
            r.create_policy_action(pa)
        })
    }

    pub fn update_policy_action(
        &self,
        before: &PolicyAction,
        after: PolicyAction,
    ) -> Result<PolicyAction> {
        check_update(&before.id, &after.id)?;
        let id = after.id.to_string();
        self.transact(ResourceKind::PolicyAction, Op::Update, id, |r| {
            r.update_policy_action(after)
        })
    }

    pub fn delete_policy_action(&self, pa: &PolicyAction) -> Result<()> {
        self.transact(ResourceKind::PolicyAction, Op::Delete, pa.id.to_string(), |r| {
            r.delete_policy_action(&pa.id)
        })
    }

    pub fn create_policy_rule(&self, pr: PolicyRule) -> Result<PolicyRule> {
        let id = pr.id.to_string();
        self.transact(ResourceKind::PolicyRule, Op::Create, id, |r| {
            r.create_policy_rule(pr)
        })
    }

    pub fn update_policy_rule(&self, before: &PolicyRule, after: PolicyRule) -> Result<PolicyRule> {
        check_update(&before.id, &after.id)?;
        let id = after.id.to_string();
        self.transact(ResourceKind::PolicyRule, Op::Update, id, |r| {
            r.update_policy_rule(after)
        })
    }

    pub fn delete_policy_rule(&self, pr: &PolicyRule) -> Result<()> {
        self.transact(ResourceKind::PolicyRule, Op::Delete, pr.id.to_string(), |r| {
            r.delete_policy_rule(&pr.id)
        })
    }

    pub fn create_policy_rule_set(&self, prs: PolicyRuleSet) -> Result<PolicyRuleSet> {
        let id = prs.id.to_string();
        self.transact(ResourceKind::PolicyRuleSet, Op::Create, id, |r| {
            r.create_policy_rule_set(prs)
        })
    }

    pub fn update_policy_rule_set(
        &self,
        before: &PolicyRuleSet,
        after: PolicyRuleSet,
    ) -> Result<PolicyRuleSet> {
        check_update(&before.id, &after.id)?;
        let id = after.id.to_string();
        self.transact(ResourceKind::PolicyRuleSet, Op::Update, id, |r| {
            r.update_policy_rule_set(after)
        })
    }

    pub fn delete_policy_rule_set(&self, prs: &PolicyRuleSet) -> Result<()> {
        let id = prs.id.to_string();
        self.transact(ResourceKind::PolicyRuleSet, Op::Delete, id, |r| {
            r.delete_policy_rule_set(&prs.id)
        })
    }

    pub fn create_external_segment(&self, es: ExternalSegment) -> Result<ExternalSegment> {
        let id = es.id.to_string();
        self.transact(ResourceKind::ExternalSegment, Op::Create, id, |r| {
            r.create_external_segment(es)
        })
    }

    pub fn update_external_segment(
        &self,
        before: &ExternalSegment,
        after: ExternalSegment,
    ) -> Result<ExternalSegment> {
        check_update(&before.id, &after.id)?;
        let id = after.id.to_string();
        self.transact(ResourceKind::ExternalSegment, Op::Update, id, |r| {
            r.update_external_segment(after)
        })
    }

    pub fn delete_external_segment(&self, es: &ExternalSegment) -> Result<()> {
        let id = es.id.to_string();
        self.transact(ResourceKind::ExternalSegment, Op::Delete, id, |r| {
            r.delete_external_segment(&es.id)
        })
    }

    pub fn create_external_policy(&self, ep: ExternalPolicy) -> Result<ExternalPolicy> {
        let id = ep.id.to_string();
        self.transact(ResourceKind::ExternalPolicy, Op::Create, id, |r| {
            r.create_external_policy(ep)
        })
    }

    pub fn update_external_policy(
        &self,
        before: &ExternalPolicy,
        after: ExternalPolicy,
    ) -> Result<ExternalPolicy> {
        check_update(&before.id, &after.id)?;
        let id = after.id.to_string();
        self.transact(ResourceKind::ExternalPolicy, Op::Update, id, |r| {
            r.update_external_policy(after)
        })
    }

    pub fn delete_external_policy(&self, ep: &ExternalPolicy) -> Result<()> {
        let id = ep.id.to_string();
        self.transact(ResourceKind::ExternalPolicy, Op::Delete, id, |r| {
            r.delete_external_policy(&ep.id)
        })
    }

    /// Re-derives the rules of a rule set's security groups.
    ///
    /// Rules are always derived in full and diffed against the platform, so this is a no-op
    /// unless rules were changed out of band.
    pub fn resync_policy_rule_set(&self, id: &PolicyRuleSetId) -> Result<()> {
        self.transact(ResourceKind::PolicyRuleSet, Op::Update, id.to_string(), |r| {
            r.index.rule_set(id)?;
            security::sync_rule_set(r.index, r.txn, id)
        })
    }

    /// Returns the current state of a policy object, with derived fields filled in.
    pub fn get(&self, kind: ResourceKind, id: &str) -> Option<Resource> {
        let index = self.index.lock();
        let resource = match kind {
            ResourceKind::L3Policy => Resource::L3Policy(
                index.l3_policies.get(&L3PolicyId::new(id))?.policy.clone(),
            ),
            ResourceKind::L2Policy => Resource::L2Policy(
                index.l2_policies.get(&L2PolicyId::new(id))?.policy.clone(),
            ),
            ResourceKind::PolicyTargetGroup => Resource::PolicyTargetGroup(
                index
                    .groups
                    .get(&PolicyTargetGroupId::new(id))?
                    .policy
                    .clone(),
            ),
            ResourceKind::PolicyTarget => Resource::PolicyTarget(
                index.targets.get(&PolicyTargetId::new(id))?.policy.clone(),
            ),
            ResourceKind::PolicyClassifier => Resource::PolicyClassifier(
                index
                    .classifiers
                    .get(&PolicyClassifierId::new(id))?
                    .clone(),
            ),
            ResourceKind::PolicyAction => {
                Resource::PolicyAction(index.actions.get(&PolicyActionId::new(id))?.clone())
            }
            ResourceKind::PolicyRule => {
                Resource::PolicyRule(index.rules.get(&PolicyRuleId::new(id))?.clone())
            }
            ResourceKind::PolicyRuleSet => {
                Resource::PolicyRuleSet(index.rule_sets.get(&PolicyRuleSetId::new(id))?.clone())
            }
            ResourceKind::ExternalSegment => Resource::ExternalSegment(
                index
                    .segments
                    .get(&ExternalSegmentId::new(id))?
                    .policy
                    .clone(),
            ),
            ResourceKind::ExternalPolicy => Resource::ExternalPolicy(
                index
                    .external_policies
                    .get(&ExternalPolicyId::new(id))?
                    .clone(),
            ),
        };
        Some(resource)
    }

    pub fn security_groups(&self, rs: &PolicyRuleSetId) -> Option<SecurityGroupMapping> {
        self.index.lock().security.get(rs).cloned()
    }

    pub fn intra_group_security_group(&self, ptg: &PolicyTargetGroupId) -> Option<SecurityGroupId> {
        self.index.lock().groups.get(ptg).map(|g| g.intra_sg.clone())
    }

    /// The rules a policy rule contributed when its rule set was last synced.
    pub fn rule_entries(&self, rs: &PolicyRuleSetId, rule: &PolicyRuleId) -> Option<RuleEntries> {
        self.index.lock().security.entries(rs, rule).cloned()
    }

    pub fn chain_state(&self, key: &ChainKey) -> ChainState {
        self.index.lock().redirects.state(key)
    }

    /// The destinations reachable through a segment, minus every L3 policy's pool.
    pub fn external_cidrs(&self, es: &ExternalSegmentId) -> Vec<IpNet> {
        let set: IpSet = self.index.lock().external_cidrs(es);
        set.into_iter().collect()
    }

    pub fn default_l3_policy(&self, tenant: &TenantId) -> Option<L3PolicyId> {
        self.index.lock().default_l3_policies.get(tenant).cloned()
    }

    fn transact<T>(
        &self,
        kind: ResourceKind,
        op: Op,
        id: String,
        handler: impl FnOnce(&mut Reconcile<'_, '_>) -> Result<T>,
    ) -> Result<T> {
        let start = Instant::now();
        let mut index = self.index.lock();
        let snapshot = index.clone();
        let mut txn = Txn::new(&*self.platform, &*self.chains);

        let result = handler(&mut Reconcile {
            config: &self.config,
            index: &mut *index,
            txn: &mut txn,
        });
        let result = match result {
            Ok(value) => txn.commit().map(|stats| (value, stats)),
            Err(error) => {
                txn.rollback();
                Err(error)
            }
        };

        match result {
            Ok((value, stats)) => {
                self.metrics.committed(kind, op, &stats, start.elapsed());
                tracing::info!(
                    %kind,
                    op = op.as_str(),
                    %id,
                    rules_added = stats.rules_added,
                    rules_removed = stats.rules_removed,
                    chains = stats.transitions.len(),
                    "Handled event",
                );
                Ok(value)
            }
            Err(error) => {
                *index = snapshot;
                self.metrics.failed(kind, op, &error, start.elapsed());
                match error.class() {
                    ErrorClass::Validation | ErrorClass::Exhausted => {
                        tracing::info!(%kind, op = op.as_str(), %id, %error, "Rejected event")
                    }
                    class => {
                        tracing::warn!(%kind, op = op.as_str(), %id, %class, %error, "Failed to handle event")
                    }
                }
                Err(error)
            }
        }
    }
}

fn check_update<I: PartialEq + fmt::Display>(before: &I, after: &I) -> Result<()> {
    if before != after {
        return Err(Error::MismatchedUpdate(after.to_string()));
    }
    Ok(())
}

// === impl Op ===

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl Reconcile ===

impl Reconcile<'_, '_> {
    /// Re-derives the rules and chains of each rule set that still exists.
    fn sync_rule_sets(&mut self, rule_sets: impl IntoIterator<Item = PolicyRuleSetId>) -> Result<()> {
        for rs in rule_sets {
            if !self.index.rule_sets.contains_key(&rs) {
                continue;
            }
            security::sync_rule_set(self.index, self.txn, &rs)?;
            redirect::reconcile(self.index, self.txn, &rs)?;
        }
        Ok(())
    }

    /// Re-derives every rule set with an external party, after the set of pools changed.
    fn sync_external_rule_sets(&mut self) -> Result<()> {
        let rule_sets: BTreeSet<_> = self.index.external_rule_sets();
        for rs in rule_sets {
            if self.index.rule_sets.contains_key(&rs) {
                security::sync_rule_set(self.index, self.txn, &rs)?;
            }
        }
        Ok(())
    }
}
