//! Security groups implementing policy rule sets and policy target groups.
//!
//! Each rule set is implemented by a pair of groups: the provided group is bound to the ports of
//! its providers and the consumed group to the ports of its consumers. Rules are never patched
//! incrementally. Every sync derives the complete set of rules each group should carry and diffs
//! it against what the platform reports as installed.

use crate::{
    error::Result,
    index::Index,
    rules::{self, Scopes},
    txn::{Primitive, Txn},
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use grouppolicy_core::{
    platform::{SecurityGroupRule, SecurityGroupSpec},
    policy::{ActionType, PolicyRuleSet},
    PolicyRuleId, PolicyRuleSetId, PolicyTargetGroupId, SecurityGroupId,
};

/// The security groups implementing a policy rule set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityGroupMapping {
    pub provided: SecurityGroupId,
    pub consumed: SecurityGroupId,
}

/// The rules a single policy rule contributes to each group of its rule set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleEntries {
    pub provided: Vec<SecurityGroupRule>,
    pub consumed: Vec<SecurityGroupRule>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct SecurityStore {
    mappings: HashMap<PolicyRuleSetId, SecurityGroupMapping>,
    entries: HashMap<PolicyRuleSetId, HashMap<PolicyRuleId, RuleEntries>>,
}

// === impl SecurityStore ===

impl SecurityStore {
    pub(crate) fn get(&self, rs: &PolicyRuleSetId) -> Option<&SecurityGroupMapping> {
        self.mappings.get(rs)
    }

    pub(crate) fn entries(&self, rs: &PolicyRuleSetId, rule: &PolicyRuleId) -> Option<&RuleEntries> {
        self.entries.get(rs)?.get(rule)
    }

    /// Returns the rule set's groups, creating them on first use.
    pub(crate) fn ensure(
        &mut self,
        txn: &mut Txn<'_>,
        rs: &PolicyRuleSet,
    ) -> Result<SecurityGroupMapping> {
        if let Some(mapping) = self.mappings.get(&rs.id) {
            return Ok(mapping.clone());
        }

        let provided = txn.create_security_group(SecurityGroupSpec {
            tenant_id: rs.tenant_id.clone(),
            name: format!("provided_{}", rs.id),
        })?;
        let consumed = txn.create_security_group(SecurityGroupSpec {
            tenant_id: rs.tenant_id.clone(),
            name: format!("consumed_{}", rs.id),
        })?;
        let mapping = SecurityGroupMapping {
            provided: provided.id,
            consumed: consumed.id,
        };
        tracing::debug!(
            rule_set = %rs.id,
            provided = %mapping.provided,
            consumed = %mapping.consumed,
            "Mapped rule set",
        );
        self.mappings.insert(rs.id.clone(), mapping.clone());
        Ok(mapping)
    }

    /// Forgets the rule set's groups and releases them.
    pub(crate) fn remove(&mut self, txn: &mut Txn<'_>, rs: &PolicyRuleSetId) {
        self.entries.remove(rs);
        if let Some(mapping) = self.mappings.remove(rs) {
            txn.release(Primitive::SecurityGroup(mapping.provided));
            txn.release(Primitive::SecurityGroup(mapping.consumed));
        }
    }
}

/// Brings both groups of a rule set in line with its rules and parties.
pub(crate) fn sync_rule_set(
    index: &mut Index,
    txn: &mut Txn<'_>,
    rs: &PolicyRuleSetId,
) -> Result<()> {
    let Some(mapping) = index.security.get(rs).cloned() else {
        return Ok(());
    };
    let Some(rule_set) = index.rule_sets.get(rs) else {
        return Ok(());
    };

    let scopes = Scopes {
        providers: index
            .deps
            .providers
            .get(rs)
            .iter()
            .flat_map(|p| index.party_cidrs(p))
            .collect(),
        consumers: index
            .deps
            .consumers
            .get(rs)
            .iter()
            .flat_map(|p| index.party_cidrs(p))
            .collect(),
    };

    let mut provided = Vec::new();
    let mut consumed = Vec::new();
    let mut entries = HashMap::default();
    for rule_id in &rule_set.policy_rules {
        let rule = index.rule(rule_id)?;
        let allows = rule.policy_actions.iter().any(|id| {
            index
                .actions
                .get(id)
                .map_or(false, |a| a.action_type == ActionType::Allow)
        });
        if !allows {
            continue;
        }
        let classifier = index.classifier(&rule.policy_classifier_id)?;
        let compiled = rules::compile(classifier, &scopes);
        provided.extend(compiled.provided.iter().cloned());
        consumed.extend(compiled.consumed.iter().cloned());
        entries.insert(rule_id.clone(), compiled);
    }

    tracing::debug!(
        rule_set = %rs,
        providers = scopes.providers.len(),
        consumers = scopes.consumers.len(),
        provided = provided.len(),
        consumed = consumed.len(),
        "Syncing rule set",
    );
    reconcile_group(txn, &mapping.provided, &provided)?;
    reconcile_group(txn, &mapping.consumed, &consumed)?;
    index.security.entries.insert(rs.clone(), entries);
    Ok(())
}

/// Brings a group's intra-group security group in line with its subnets.
pub(crate) fn sync_intra_group(
    index: &Index,
    txn: &mut Txn<'_>,
    group: &PolicyTargetGroupId,
) -> Result<()> {
    let group = index.group(group)?;
    let desired = rules::intra_group(group.subnets.iter().map(|s| &s.cidr));
    reconcile_group(txn, &group.intra_sg, &desired)
}

/// Installs each desired rule exactly once and removes every other rule from `group`.
fn reconcile_group(
    txn: &mut Txn<'_>,
    group: &SecurityGroupId,
    desired: &[SecurityGroupRule],
) -> Result<()> {
    let wanted = desired.iter().collect::<HashSet<_>>();
    let mut kept = HashSet::new();
    for installed in txn.platform().list_security_group_rules(group)? {
        if wanted.contains(&installed.rule) && kept.insert(installed.rule.clone()) {
            continue;
        }
        txn.remove_rule(installed)?;
    }

    for rule in desired {
        if kept.insert(rule.clone()) {
            txn.add_rule(group, rule.clone())?;
        }
    }
    Ok(())
}
