//! Service chains for rule sets with redirect actions.
//!
//! Every (provider group, consumer group, rule set) key is in one of two states. Only
//! instantiated keys are stored, so a key absent from the index is absent from the orchestrator.

use crate::{
    error::Result,
    index::Index,
    txn::{Primitive, Txn},
};
use grouppolicy_core::{
    chain::ChainRequest, ChainInstanceId, ChainSpecId, PolicyRuleSetId, PolicyTargetGroupId,
};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainKey {
    pub provider: PolicyTargetGroupId,
    pub consumer: PolicyTargetGroupId,
    pub rule_set: PolicyRuleSetId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainState {
    Absent,
    Instantiated {
        instance: ChainInstanceId,
        spec: ChainSpecId,
    },
}

/// A change in the state of a chain key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Transition {
    Instantiate,

    /// The orchestrator updated an instance in place.
    Respecify,

    /// The orchestrator could not update an instance in place, so it was replaced.
    Replace,

    Retire,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Redirects {
    instances: BTreeMap<ChainKey, Instance>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Instance {
    id: ChainInstanceId,
    spec: ChainSpecId,
}

// === impl Redirects ===

impl Redirects {
    pub(crate) fn state(&self, key: &ChainKey) -> ChainState {
        match self.instances.get(key) {
            Some(Instance { id, spec }) => ChainState::Instantiated {
                instance: id.clone(),
                spec: spec.clone(),
            },
            None => ChainState::Absent,
        }
    }

    fn keys(&self, rs: &PolicyRuleSetId) -> Vec<ChainKey> {
        self.instances
            .keys()
            .filter(|k| k.rule_set == *rs)
            .cloned()
            .collect()
    }
}

// === impl Transition ===

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instantiate => "instantiate",
            Self::Respecify => "respecify",
            Self::Replace => "replace",
            Self::Retire => "retire",
        }
    }
}

/// The chain spec of a rule set's first redirect action, in rule order.
pub(crate) fn redirect_spec(index: &Index, rs: &PolicyRuleSetId) -> Option<ChainSpecId> {
    let rule_set = index.rule_sets.get(rs)?;
    rule_set
        .policy_rules
        .iter()
        .filter_map(|id| index.rules.get(id))
        .flat_map(|rule| rule.policy_actions.iter())
        .filter_map(|id| index.actions.get(id))
        .find_map(|action| action.redirect_spec().cloned())
}

/// Drives every chain key of a rule set toward its desired state.
pub(crate) fn reconcile(index: &mut Index, txn: &mut Txn<'_>, rs: &PolicyRuleSetId) -> Result<()> {
    let spec = redirect_spec(index, rs);
    let desired = match &spec {
        Some(_) => desired_keys(index, rs),
        None => BTreeSet::new(),
    };

    for key in index.redirects.keys(rs) {
        if desired.contains(&key) {
            continue;
        }
        if let Some(instance) = index.redirects.instances.remove(&key) {
            tracing::info!(
                provider = %key.provider,
                consumer = %key.consumer,
                rule_set = %key.rule_set,
                instance = %instance.id,
                "Retiring service chain",
            );
            txn.release(Primitive::Chain(instance.id));
            txn.record(Transition::Retire);
        }
    }

    let Some(spec) = spec else {
        return Ok(());
    };
    let tenant_id = match index.rule_sets.get(rs) {
        Some(rule_set) => rule_set.tenant_id.clone(),
        None => return Ok(()),
    };

    for key in desired {
        match index.redirects.instances.get(&key).cloned() {
            None => {
                let instance = txn.instantiate(ChainRequest {
                    tenant_id: tenant_id.clone(),
                    name: format!("{}-{}-{}", key.rule_set, key.provider, key.consumer),
                    provider_ptg_id: key.provider.clone(),
                    consumer_ptg_id: key.consumer.clone(),
                    servicechain_spec: spec.clone(),
                })?;
                tracing::info!(
                    provider = %key.provider,
                    consumer = %key.consumer,
                    rule_set = %key.rule_set,
                    instance = %instance.id,
                    %spec,
                    "Instantiated service chain",
                );
                txn.record(Transition::Instantiate);
                index.redirects.instances.insert(
                    key,
                    Instance {
                        id: instance.id,
                        spec: spec.clone(),
                    },
                );
            }

            Some(current) if current.spec == spec => {}

            Some(current) => {
                if txn.respecify(&current.id, &current.spec, &spec)? {
                    tracing::info!(instance = %current.id, %spec, "Respecified service chain");
                    txn.record(Transition::Respecify);
                    index.redirects.instances.insert(
                        key,
                        Instance {
                            id: current.id,
                            spec: spec.clone(),
                        },
                    );
                    continue;
                }

                let replacement = txn.instantiate(ChainRequest {
                    tenant_id: tenant_id.clone(),
                    name: format!("{}-{}-{}", key.rule_set, key.provider, key.consumer),
                    provider_ptg_id: key.provider.clone(),
                    consumer_ptg_id: key.consumer.clone(),
                    servicechain_spec: spec.clone(),
                })?;
                tracing::info!(
                    previous = %current.id,
                    instance = %replacement.id,
                    %spec,
                    "Replaced service chain",
                );
                txn.release(Primitive::Chain(current.id));
                txn.record(Transition::Replace);
                index.redirects.instances.insert(
                    key,
                    Instance {
                        id: replacement.id,
                        spec: spec.clone(),
                    },
                );
            }
        }
    }
    Ok(())
}

/// Every pair of distinct groups providing and consuming the rule set.
fn desired_keys(index: &Index, rs: &PolicyRuleSetId) -> BTreeSet<ChainKey> {
    let providers = index.deps.providers.get(rs);
    let consumers = index.deps.consumers.get(rs);
    let mut keys = BTreeSet::new();
    for provider in providers.iter().filter_map(|p| p.group()) {
        for consumer in consumers.iter().filter_map(|c| c.group()) {
            if provider == consumer {
                continue;
            }
            keys.insert(ChainKey {
                provider: provider.clone(),
                consumer: consumer.clone(),
                rule_set: rs.clone(),
            });
        }
    }
    keys
}
