use grouppolicy_core::{
    platform::{Ethertype, Remote, RuleDirection, SecurityGroupRule},
    policy::{PolicyTargetGroup, PortRange, Protocol},
    PolicyRuleSetId, TenantId,
};
use grouppolicy_policy_test::{
    fixtures::{self, net},
    with_harness, Harness,
};
use pretty_assertions::assert_eq;

fn tcp(direction: RuleDirection, port: u16, remote: &str) -> SecurityGroupRule {
    SecurityGroupRule {
        direction,
        ethertype: Ethertype::Ipv4,
        protocol: Some(Protocol::Tcp),
        port_range: Some(PortRange::single(port)),
        remote: Remote::Cidr(net(remote)),
    }
}

struct Tiers {
    web: PolicyTargetGroup,
    app: PolicyTargetGroup,
    db: PolicyTargetGroup,
}

/// web consumes `api` from app, which consumes `sql` from db. Clients reach web over `http`.
fn mk_tiers(h: &Harness) -> Tiers {
    let t = &h.tenant;
    h.allow_contract("http", Protocol::Tcp, Some("80"));
    h.allow_contract("api", Protocol::Tcp, Some("8080"));
    h.allow_contract("sql", Protocol::Tcp, Some("5432"));
    let web = h
        .driver
        .create_policy_target_group(fixtures::group(t, "web", &["http"], &["api"]))
        .expect("web must be created");
    let app = h
        .driver
        .create_policy_target_group(fixtures::group(t, "app", &["api"], &["sql"]))
        .expect("app must be created");
    let db = h
        .driver
        .create_policy_target_group(fixtures::group(t, "db", &["sql"], &[]))
        .expect("db must be created");
    Tiers { web, app, db }
}

fn provided(h: &Harness, rs: &str) -> Vec<SecurityGroupRule> {
    let sg = h
        .driver
        .security_groups(&PolicyRuleSetId::new(rs))
        .expect("rule set must be mapped")
        .provided;
    h.platform.rules(&sg)
}

fn consumed(h: &Harness, rs: &str) -> Vec<SecurityGroupRule> {
    let sg = h
        .driver
        .security_groups(&PolicyRuleSetId::new(rs))
        .expect("rule set must be mapped")
        .consumed;
    h.platform.rules(&sg)
}

#[test]
fn tiers_share_the_default_topology() {
    with_harness(|h| {
        let Tiers { web, app, db } = mk_tiers(h);

        let cidrs = [&web, &app, &db].map(|g| h.subnet_cidr(&g.subnets[0]));
        assert_eq!(
            cidrs,
            [net("10.0.0.0/24"), net("10.0.1.0/24"), net("10.0.2.0/24")]
        );

        // Each group has its own network, all behind the tenant's one router.
        assert_eq!(h.platform.networks().len(), 3);
        let routers = h.platform.routers();
        assert_eq!(routers.len(), 1);
        assert_eq!(routers[0].interfaces.len(), 3);
        assert_eq!(routers[0].name, "l3p_default");
    });
}

#[test]
fn contracts_admit_only_consumers() {
    with_harness(|h| {
        mk_tiers(h);

        assert_eq!(
            provided(h, "api"),
            vec![tcp(RuleDirection::Ingress, 8080, "10.0.0.0/24")]
        );
        assert_eq!(
            consumed(h, "api"),
            vec![tcp(RuleDirection::Egress, 8080, "10.0.1.0/24")]
        );
        assert_eq!(
            provided(h, "sql"),
            vec![tcp(RuleDirection::Ingress, 5432, "10.0.1.0/24")]
        );
        assert_eq!(
            consumed(h, "sql"),
            vec![tcp(RuleDirection::Egress, 5432, "10.0.2.0/24")]
        );
        // Nobody consumes http yet.
        assert!(provided(h, "http").is_empty());
        assert_eq!(
            consumed(h, "http"),
            vec![tcp(RuleDirection::Egress, 80, "10.0.0.0/24")]
        );
    });
}

#[test]
fn targets_carry_their_groups_contracts() {
    with_harness(|h| {
        let t = &h.tenant;
        let Tiers { app, .. } = mk_tiers(h);

        let pt = h
            .driver
            .create_policy_target(fixtures::target(t, "app-0", "app"))
            .unwrap();
        let port = h.port_of(&pt);
        let mapping = |rs: &str| h.driver.security_groups(&PolicyRuleSetId::new(rs)).unwrap();
        assert_eq!(
            port.security_groups,
            vec![
                h.driver.intra_group_security_group(&app.id).unwrap(),
                mapping("api").provided,
                mapping("sql").consumed,
            ]
        );

        // Dropping the sql contract rebinds the existing port and withdraws db's ingress rule.
        h.driver
            .update_policy_target_group(
                &app,
                PolicyTargetGroup {
                    consumed_policy_rule_sets: vec![],
                    ..app.clone()
                },
            )
            .unwrap();
        let port = h.port_of(&pt);
        assert_eq!(
            port.security_groups,
            vec![
                h.driver.intra_group_security_group(&app.id).unwrap(),
                mapping("api").provided,
            ]
        );
        assert!(provided(h, "sql").is_empty());
    });
}

#[test]
fn teardown_releases_everything() {
    with_harness(|h| {
        let t = &h.tenant;
        let Tiers { web, app, db } = mk_tiers(h);
        let targets = ["web", "app", "db"].map(|g| {
            h.driver
                .create_policy_target(fixtures::target(t, &format!("{g}-0"), g))
                .unwrap()
        });
        assert_eq!(h.platform.ports().len(), 3);

        for pt in &targets {
            h.driver.delete_policy_target(pt).unwrap();
        }
        for ptg in [&web, &app, &db] {
            h.driver.delete_policy_target_group(ptg).unwrap();
        }
        for rs in ["http", "api", "sql"] {
            h.driver
                .delete_policy_rule_set(&fixtures::rule_set(t, rs, &[]))
                .unwrap();
        }

        let snapshot = h.snapshot();
        assert!(snapshot.is_empty(), "{snapshot:#?}");
        assert_eq!(h.driver.default_l3_policy(t), None);

        let metrics = h.metrics();
        assert!(metrics.contains(
            r#"grouppolicy_events_total{kind="policy_target_group",op="create",result="ok"} 3"#
        ));
        assert!(metrics.contains(
            r#"grouppolicy_events_total{kind="policy_target_group",op="delete",result="ok"} 3"#
        ));
    });
}

#[test]
fn explicit_topology_carves_from_its_pool() {
    with_harness(|h| {
        let t = &h.tenant;
        h.driver
            .create_l3_policy(grouppolicy_core::policy::L3Policy {
                subnet_prefix_length: 26,
                ..fixtures::l3_policy(t, "l3p-0", "192.168.0.0/16")
            })
            .unwrap();
        let l2p = h
            .driver
            .create_l2_policy(fixtures::l2_policy(t, "l2p-0", Some("l3p-0")))
            .unwrap();
        let a = h
            .driver
            .create_policy_target_group(fixtures::group_on(t, "a", "l2p-0", &[], &[]))
            .unwrap();
        let b = h
            .driver
            .create_policy_target_group(fixtures::group_on(t, "b", "l2p-0", &[], &[]))
            .unwrap();

        assert_eq!(h.subnet_cidr(&a.subnets[0]), net("192.168.0.0/26"));
        assert_eq!(h.subnet_cidr(&b.subnets[0]), net("192.168.0.64/26"));
        let networks = h.platform.networks();
        assert_eq!(networks.len(), 1);
        assert_eq!(l2p.network_id, Some(networks[0].id.clone()));
        assert_eq!(h.driver.default_l3_policy(t), None);
    });
}

#[test]
fn tenants_do_not_share_topology() {
    with_harness(|h| {
        let other = TenantId::new("other");
        let mine = h
            .driver
            .create_policy_target_group(fixtures::group(&h.tenant, "mine", &[], &[]))
            .unwrap();
        let theirs = h
            .driver
            .create_policy_target_group(fixtures::group(&other, "theirs", &[], &[]))
            .unwrap();

        // Pools may overlap across tenants.
        assert_eq!(h.subnet_cidr(&mine.subnets[0]), net("10.0.0.0/24"));
        assert_eq!(h.subnet_cidr(&theirs.subnets[0]), net("10.0.0.0/24"));
        assert_ne!(
            h.driver.default_l3_policy(&h.tenant),
            h.driver.default_l3_policy(&other)
        );
        assert_eq!(h.platform.routers().len(), 2);
    });
}
