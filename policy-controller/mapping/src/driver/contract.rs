use super::Reconcile;
use crate::error::{Error, Result};
use grouppolicy_core::{
    policy::{
        ActionType, PolicyAction, PolicyClassifier, PolicyRule, PolicyRuleSet, ResourceKind,
    },
    PolicyActionId, PolicyClassifierId, PolicyRuleId, PolicyRuleSetId,
};

impl Reconcile<'_, '_> {
    pub(super) fn create_policy_classifier(
        &mut self,
        pc: PolicyClassifier,
    ) -> Result<PolicyClassifier> {
        self.index.classifiers.insert(pc.id.clone(), pc.clone());
        Ok(pc)
    }

    pub(super) fn update_policy_classifier(
        &mut self,
        after: PolicyClassifier,
    ) -> Result<PolicyClassifier> {
        self.index.classifier(&after.id)?;
        self.index.classifiers.insert(after.id.clone(), after.clone());

        let touched = self.index.classifier_rule_sets(&after.id);
        tracing::debug!(classifier = %after.id, rule_sets = touched.len(), "Classifier changed");
        self.sync_rule_sets(touched)?;
        Ok(after)
    }

    pub(super) fn delete_policy_classifier(&mut self, id: &PolicyClassifierId) -> Result<()> {
        self.index.classifier(id)?;
        if self.index.deps.classifier_rules.has(id) {
            return Err(Error::PolicyClassifierInUse(id.to_string()));
        }
        self.index.classifiers.remove(id);
        Ok(())
    }

    pub(super) fn create_policy_action(&mut self, pa: PolicyAction) -> Result<PolicyAction> {
        check_action(&pa)?;
        self.index.actions.insert(pa.id.clone(), pa.clone());
        Ok(pa)
    }

    pub(super) fn update_policy_action(&mut self, after: PolicyAction) -> Result<PolicyAction> {
        self.index.action(&after.id)?;
        check_action(&after)?;
        self.index.actions.insert(after.id.clone(), after.clone());

        let touched = self.index.action_rule_sets(&after.id);
        self.sync_rule_sets(touched)?;
        Ok(after)
    }

    pub(super) fn delete_policy_action(&mut self, id: &PolicyActionId) -> Result<()> {
        self.index.action(id)?;
        if self.index.deps.action_rules.has(id) {
            return Err(Error::PolicyActionInUse(id.to_string()));
        }
        self.index.actions.remove(id);
        Ok(())
    }

    pub(super) fn create_policy_rule(&mut self, pr: PolicyRule) -> Result<PolicyRule> {
        self.check_rule(&pr)?;
        self.index.deps.set_rule(&pr);
        self.index.rules.insert(pr.id.clone(), pr.clone());
        Ok(pr)
    }

    pub(super) fn update_policy_rule(&mut self, after: PolicyRule) -> Result<PolicyRule> {
        self.index.rule(&after.id)?;
        self.check_rule(&after)?;
        self.index.deps.set_rule(&after);
        self.index.rules.insert(after.id.clone(), after.clone());

        let touched = self.index.rule_rule_sets([&after.id]);
        self.sync_rule_sets(touched)?;
        Ok(after)
    }

    pub(super) fn delete_policy_rule(&mut self, id: &PolicyRuleId) -> Result<()> {
        self.index.rule(id)?;
        if self.index.deps.rule_rule_sets.has(id) {
            return Err(Error::PolicyRuleInUse(id.to_string()));
        }
        self.index.deps.remove_rule(id);
        self.index.rules.remove(id);
        Ok(())
    }

    pub(super) fn create_policy_rule_set(&mut self, prs: PolicyRuleSet) -> Result<PolicyRuleSet> {
        self.check_rule_set(&prs)?;
        self.index.deps.set_rule_set_rules(&prs.id, &prs.policy_rules);
        self.index.rule_sets.insert(prs.id.clone(), prs.clone());
        self.index.security.ensure(self.txn, &prs)?;

        self.sync_rule_sets([prs.id.clone()])?;
        Ok(prs)
    }

    pub(super) fn update_policy_rule_set(&mut self, after: PolicyRuleSet) -> Result<PolicyRuleSet> {
        self.index.rule_set(&after.id)?;
        self.check_rule_set(&after)?;
        self.index
            .deps
            .set_rule_set_rules(&after.id, &after.policy_rules);
        self.index.rule_sets.insert(after.id.clone(), after.clone());

        self.sync_rule_sets([after.id.clone()])?;
        Ok(after)
    }

    pub(super) fn delete_policy_rule_set(&mut self, id: &PolicyRuleSetId) -> Result<()> {
        self.index.rule_set(id)?;
        if self.index.deps.providers.has(id) || self.index.deps.consumers.has(id) {
            return Err(Error::PolicyRuleSetInUse(id.to_string()));
        }

        // Chains exist only between parties, so none remain once the parties are gone.
        self.index.security.remove(self.txn, id);
        self.index.deps.set_rule_set_rules(id, &[]);
        self.index.rule_sets.remove(id);
        Ok(())
    }

    fn check_rule(&self, pr: &PolicyRule) -> Result<()> {
        self.index.classifier(&pr.policy_classifier_id)?;
        for action in &pr.policy_actions {
            self.index.action(action)?;
        }
        Ok(())
    }

    fn check_rule_set(&self, prs: &PolicyRuleSet) -> Result<()> {
        if prs.shared {
            return Err(Error::InvalidSharedResource(ResourceKind::PolicyRuleSet));
        }
        for rule in &prs.policy_rules {
            self.index.rule(rule)?;
        }
        Ok(())
    }
}

fn check_action(pa: &PolicyAction) -> Result<()> {
    if pa.shared {
        return Err(Error::InvalidSharedResource(ResourceKind::PolicyAction));
    }
    if pa.action_type == ActionType::Redirect && pa.action_value.is_none() {
        return Err(Error::RedirectActionRequiresChainSpec);
    }
    Ok(())
}
