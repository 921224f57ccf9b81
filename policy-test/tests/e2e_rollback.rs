use grouppolicy_core::policy::{PolicyTargetGroup, Protocol, ResourceKind};
use grouppolicy_mapping::{ChainState, ErrorClass};
use grouppolicy_policy_test::{fixtures, Harness};
use pretty_assertions::assert_eq;
use rstest::rstest;

/// web provides an allowed `api` contract and a redirected `fw` contract.
fn mk_provider(h: &Harness) {
    h.allow_contract("api", Protocol::Tcp, Some("8080"));
    h.redirect_contract("fw", "spec-a");
    h.driver
        .create_policy_target_group(fixtures::group(&h.tenant, "web", &["api", "fw"], &[]))
        .expect("web must be created");
}

fn app(h: &Harness) -> PolicyTargetGroup {
    fixtures::group(&h.tenant, "app", &[], &["api", "fw"])
}

#[rstest]
#[case::network("create_network", 0)]
#[case::subnet_listing("list_subnets", 0)]
#[case::subnet("create_subnet", 0)]
#[case::interface("add_router_interface", 0)]
#[case::security_group("create_security_group", 0)]
#[case::first_rule("add_security_group_rule", 0)]
#[case::second_rule("add_security_group_rule", 1)]
fn failed_consumer_creation_restores_platform(#[case] op: &'static str, #[case] after: usize) {
    let h = Harness::new();
    mk_provider(&h);
    let before = h.snapshot();

    h.platform.fail_after(op, after);
    let err = h
        .driver
        .create_policy_target_group(app(&h))
        .expect_err("platform must fail");
    assert_eq!(err.class(), ErrorClass::Collaborator);
    assert_eq!(h.snapshot(), before, "{op} after {after} calls left changes behind");
    assert_eq!(h.driver.get(ResourceKind::PolicyTargetGroup, "app"), None);

    // Faults fire once, so the retry applies the whole event.
    let app = h.driver.create_policy_target_group(app(&h)).unwrap();
    assert_eq!(h.subnet_cidr(&app.subnets[0]), fixtures::net("10.0.1.0/24"));
    assert_eq!(h.chains.instances().len(), 1);
}

#[test]
fn failed_chain_instantiation_restores_platform() {
    let h = Harness::new();
    mk_provider(&h);
    let before = h.snapshot();

    h.chains.fail_on("instantiate");
    let err = h
        .driver
        .create_policy_target_group(app(&h))
        .expect_err("orchestrator must fail");
    assert_eq!(err.class(), ErrorClass::Collaborator);
    assert_eq!(h.snapshot(), before);

    h.driver.create_policy_target_group(app(&h)).unwrap();
    let key = grouppolicy_mapping::ChainKey {
        provider: "web".into(),
        consumer: "app".into(),
        rule_set: "fw".into(),
    };
    assert!(matches!(
        h.driver.chain_state(&key),
        ChainState::Instantiated { .. }
    ));
}

#[rstest]
#[case::port("create_port")]
#[case::binding("bind_security_groups")]
fn failed_target_creation_restores_platform(#[case] op: &'static str) {
    let h = Harness::new();
    mk_provider(&h);
    let before = h.snapshot();

    h.platform.fail_on(op);
    h.driver
        .create_policy_target(fixtures::target(&h.tenant, "web-0", "web"))
        .expect_err("platform must fail");
    assert_eq!(h.snapshot(), before);
    assert_eq!(h.driver.get(ResourceKind::PolicyTarget, "web-0"), None);

    let pt = h
        .driver
        .create_policy_target(fixtures::target(&h.tenant, "web-0", "web"))
        .unwrap();
    assert_eq!(h.port_of(&pt).security_groups.len(), 3);
}

#[test]
fn failed_release_fails_the_event() {
    let h = Harness::new();
    mk_provider(&h);
    let web = fixtures::group(&h.tenant, "web", &["api", "fw"], &[]);
    let before = h.snapshot();

    h.platform.fail_on("delete_security_group");
    let err = h
        .driver
        .delete_policy_target_group(&web)
        .expect_err("platform must fail");
    assert_eq!(err.class(), ErrorClass::Collaborator);

    // The group's subnet was released before the failure. Everything else is intact.
    assert!(h.driver.get(ResourceKind::PolicyTargetGroup, "web").is_some());
    let snapshot = h.snapshot();
    assert_eq!(snapshot.security_groups, before.security_groups);
    assert_eq!(snapshot.networks, before.networks);
    assert_eq!(snapshot.subnets.len(), before.subnets.len() - 1);

    // Handling the event again completes the release.
    h.driver.delete_policy_target_group(&web).unwrap();
    assert_eq!(h.driver.get(ResourceKind::PolicyTargetGroup, "web"), None);
    let snapshot = h.snapshot();
    assert!(snapshot.networks.is_empty());
    assert!(snapshot.routers.is_empty());
    assert!(snapshot
        .security_groups
        .iter()
        .all(|(sg, _)| sg.name != "intra_web"));

    let metrics = h.metrics();
    assert!(
        metrics.contains(
            r#"grouppolicy_events_total{kind="policy_target_group",op="delete",result="PlatformFailure"} 1"#
        ),
        "{metrics}"
    );
    assert!(metrics
        .contains(r#"grouppolicy_events_total{kind="policy_target_group",op="delete",result="ok"} 1"#));
}
