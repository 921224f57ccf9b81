use grouppolicy_core::{
    chain::ChainInstance, memory::MemoryChains, policy::PolicyAction, ChainInstanceId, ChainSpecId,
    PolicyRuleSetId, PolicyTargetGroupId,
};
use grouppolicy_mapping::{ChainKey, ChainState, Config};
use grouppolicy_policy_test::{fixtures, with_harness, Harness};
use pretty_assertions::assert_eq;

fn key(provider: &str, consumer: &str) -> ChainKey {
    ChainKey {
        provider: PolicyTargetGroupId::new(provider),
        consumer: PolicyTargetGroupId::new(consumer),
        rule_set: PolicyRuleSetId::new("fw"),
    }
}

fn pairs(instances: &[ChainInstance]) -> Vec<(String, String, String)> {
    instances
        .iter()
        .map(|i| {
            (
                i.provider_ptg_id.to_string(),
                i.consumer_ptg_id.to_string(),
                i.servicechain_spec.to_string(),
            )
        })
        .collect()
}

fn pair(provider: &str, consumer: &str, spec: &str) -> (String, String, String) {
    (provider.to_string(), consumer.to_string(), spec.to_string())
}

/// web provides a firewalled contract consumed by app and batch.
fn mk_firewalled(h: &Harness) {
    let t = &h.tenant;
    h.redirect_contract("fw", "spec-a");
    let groups = [
        fixtures::group(t, "web", &["fw"], &[]),
        fixtures::group(t, "app", &[], &["fw"]),
        fixtures::group(t, "batch", &[], &["fw"]),
    ];
    for ptg in groups {
        h.driver
            .create_policy_target_group(ptg)
            .expect("group must be created");
    }
}

fn respec(h: &Harness, spec: &str) {
    let before = fixtures::redirect(&h.tenant, "fw-pa", "spec-a");
    h.driver
        .update_policy_action(
            &before,
            PolicyAction {
                action_value: Some(ChainSpecId::new(spec)),
                ..before.clone()
            },
        )
        .expect("action must be updated");
}

#[test]
fn each_consumer_gets_a_chain() {
    with_harness(|h| {
        mk_firewalled(h);

        assert_eq!(
            pairs(&h.chains.instances()),
            vec![pair("web", "app", "spec-a"), pair("web", "batch", "spec-a")]
        );
        assert!(matches!(
            h.driver.chain_state(&key("web", "app")),
            ChainState::Instantiated { .. }
        ));
        assert_eq!(h.driver.chain_state(&key("app", "web")), ChainState::Absent);

        let metrics = h.metrics();
        assert!(
            metrics.contains(r#"grouppolicy_chain_transitions_total{transition="instantiate"} 2"#),
            "{metrics}"
        );
    });
}

#[test]
fn spec_changes_are_applied_in_place() {
    with_harness(|h| {
        mk_firewalled(h);
        let ids = h.chains.instances().into_iter().map(|i| i.id).collect::<Vec<_>>();

        respec(h, "spec-b");
        let instances = h.chains.instances();
        assert_eq!(instances.iter().map(|i| i.id.clone()).collect::<Vec<_>>(), ids);
        assert_eq!(
            pairs(&instances),
            vec![pair("web", "app", "spec-b"), pair("web", "batch", "spec-b")]
        );
        assert!(h
            .metrics()
            .contains(r#"grouppolicy_chain_transitions_total{transition="respecify"} 2"#));
    });
}

#[test]
fn spec_changes_replace_instances_the_orchestrator_cannot_update() {
    let h = Harness::with(Config::default(), MemoryChains::without_respecify());
    mk_firewalled(&h);

    respec(&h, "spec-b");
    let instances = h.chains.instances();
    assert_eq!(
        instances.iter().map(|i| i.id.clone()).collect::<Vec<_>>(),
        vec![ChainInstanceId::new("sci-3"), ChainInstanceId::new("sci-4")]
    );
    assert_eq!(
        pairs(&instances),
        vec![pair("web", "app", "spec-b"), pair("web", "batch", "spec-b")]
    );
    assert_eq!(
        h.driver.chain_state(&key("web", "batch")),
        ChainState::Instantiated {
            instance: ChainInstanceId::new("sci-4"),
            spec: ChainSpecId::new("spec-b"),
        }
    );
}

#[test]
fn chains_follow_membership() {
    with_harness(|h| {
        let t = &h.tenant;
        mk_firewalled(h);

        h.driver
            .delete_policy_target_group(&fixtures::group(t, "batch", &[], &["fw"]))
            .unwrap();
        assert_eq!(pairs(&h.chains.instances()), vec![pair("web", "app", "spec-a")]);
        assert_eq!(h.driver.chain_state(&key("web", "batch")), ChainState::Absent);

        // A group on both sides of the contract is only chained to others.
        let app = fixtures::group(t, "app", &[], &["fw"]);
        h.driver
            .update_policy_target_group(&app, fixtures::group(t, "app", &["fw"], &["fw"]))
            .unwrap();
        assert_eq!(pairs(&h.chains.instances()), vec![pair("web", "app", "spec-a")]);
        assert_eq!(h.driver.chain_state(&key("app", "app")), ChainState::Absent);

        h.driver
            .delete_policy_target_group(&fixtures::group(t, "web", &["fw"], &[]))
            .unwrap();
        assert!(h.chains.instances().is_empty());
    });
}
