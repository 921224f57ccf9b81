use super::*;
use pretty_assertions::assert_eq;

#[test]
fn implicit_network_and_default_l3_policy() {
    let test = TestConfig::default();
    let l2p = test.driver.create_l2_policy(mk_l2p("l2p-0", None)).unwrap();

    let default = test
        .driver
        .default_l3_policy(&tenant())
        .expect("default L3 policy must be created");
    assert_eq!(l2p.l3_policy_id.as_ref(), Some(&default));
    let networks = test.platform.networks();
    assert_eq!(networks.len(), 1);
    assert_eq!(l2p.network_id.as_ref(), Some(&networks[0].id));
    assert_eq!(networks[0].name, "l2p_l2p-0");

    match test.driver.get(ResourceKind::L3Policy, default.as_str()) {
        Some(Resource::L3Policy(l3p)) => {
            assert_eq!(l3p.name, "default");
            assert_eq!(l3p.ip_pool, net("10.0.0.0/8"));
            assert_eq!(l3p.subnet_prefix_length, 24);
        }
        other => panic!("unexpected L3 policy: {other:?}"),
    }

    test.driver.delete_l2_policy(&l2p).unwrap();
    assert!(test.platform.is_empty());
    assert_eq!(test.driver.default_l3_policy(&tenant()), None);
    assert_eq!(
        test.driver.get(ResourceKind::L3Policy, default.as_str()),
        None
    );
}

#[test]
fn default_l3_policy_lives_while_referenced() {
    let test = TestConfig::default();
    let a = test.driver.create_l2_policy(mk_l2p("l2p-a", None)).unwrap();
    let b = test.driver.create_l2_policy(mk_l2p("l2p-b", None)).unwrap();
    assert_eq!(a.l3_policy_id, b.l3_policy_id);
    assert_eq!(test.platform.routers().len(), 1);

    test.driver.delete_l2_policy(&a).unwrap();
    assert_eq!(test.platform.routers().len(), 1);
    assert_eq!(test.driver.default_l3_policy(&tenant()), b.l3_policy_id);

    test.driver.delete_l2_policy(&b).unwrap();
    assert!(test.platform.is_empty());

    // A new default is created on next use.
    let c = test.driver.create_l2_policy(mk_l2p("l2p-c", None)).unwrap();
    assert_ne!(c.l3_policy_id, a.l3_policy_id);
}

#[test]
fn named_default_l3_policy_is_reused() {
    let test = TestConfig::default();
    let l3p = test
        .driver
        .create_l3_policy(L3Policy {
            name: "default".to_string(),
            ..mk_l3p("l3p-0", "192.168.0.0/16")
        })
        .unwrap();

    let l2p = test.driver.create_l2_policy(mk_l2p("l2p-0", None)).unwrap();
    assert_eq!(l2p.l3_policy_id, Some(l3p.id.clone()));

    // The caller's L3 policy is not removed with the L2 policy.
    test.driver.delete_l2_policy(&l2p).unwrap();
    assert!(test.driver.get(ResourceKind::L3Policy, "l3p-0").is_some());
    assert_eq!(test.platform.routers().len(), 1);
}

#[test]
fn explicit_network_is_kept() {
    let test = TestConfig::default();
    let subnet = test.mk_subnet("10.10.0.0/24");

    let l2p = test
        .driver
        .create_l2_policy(L2Policy {
            network_id: Some(subnet.network_id.clone()),
            ..mk_l2p("l2p-0", None)
        })
        .unwrap();
    assert_eq!(l2p.network_id, Some(subnet.network_id.clone()));

    test.driver.delete_l2_policy(&l2p).unwrap();
    assert_eq!(test.platform.networks().len(), 1);
    assert_eq!(test.platform.subnets(), vec![subnet]);
    assert!(test.platform.routers().is_empty());
}

#[test]
fn referenced_network_must_exist() {
    let test = TestConfig::default();
    let err = test
        .driver
        .create_l2_policy(L2Policy {
            network_id: Some(NetworkId::new("net-x")),
            ..mk_l2p("l2p-0", None)
        })
        .expect_err("net-x does not exist");
    assert_eq!(err, Error::ReferencedNetworkNotFound(NetworkId::new("net-x")));
    // The default L3 policy created along the way is rolled back.
    assert!(test.platform.is_empty());
    assert_eq!(test.driver.default_l3_policy(&tenant()), None);
}

#[test]
fn shared_policy_requires_shared_network() {
    let test = TestConfig::default();
    let subnet = test.mk_subnet("10.10.0.0/24");

    let err = test
        .driver
        .create_l2_policy(L2Policy {
            network_id: Some(subnet.network_id.clone()),
            shared: true,
            ..mk_l2p("l2p-0", None)
        })
        .expect_err("network is not shared");
    assert_eq!(
        err,
        Error::NonSharedNetworkOnSharedL2PolicyNotSupported {
            l2_policy: L2PolicyId::new("l2p-0"),
            network: subnet.network_id.clone(),
        }
    );

    let l2p = test.driver.create_l2_policy(mk_l2p("l2p-1", None)).unwrap();
    let err = test
        .driver
        .update_l2_policy(
            &l2p,
            L2Policy {
                shared: true,
                ..l2p.clone()
            },
        )
        .expect_err("implicit network is not shared");
    assert!(matches!(
        err,
        Error::NonSharedNetworkOnSharedL2PolicyNotSupported { .. }
    ));
}

#[test]
fn cross_tenant_l3_policy() {
    let test = TestConfig::default();
    test.driver
        .create_l3_policy(mk_l3p("l3p-0", "10.0.0.0/16"))
        .unwrap();

    let err = test
        .driver
        .create_l2_policy(L2Policy {
            tenant_id: TenantId::new("tenant-1"),
            ..mk_l2p("l2p-0", Some("l3p-0"))
        })
        .expect_err("l3p-0 belongs to tenant-0");
    assert_eq!(
        err,
        Error::CrossTenantL2PolicyL3PolicyNotSupported {
            l2_policy: L2PolicyId::new("l2p-0"),
            tenant: TenantId::new("tenant-1"),
            l3_policy: L3PolicyId::new("l3p-0"),
        }
    );

    let err = test
        .driver
        .create_l2_policy(L2Policy {
            shared: true,
            ..mk_l2p("l2p-1", Some("l3p-0"))
        })
        .expect_err("l3p-0 is not shared");
    assert!(matches!(
        err,
        Error::CrossTenantL2PolicyL3PolicyNotSupported { .. }
    ));
    assert_eq!(test.platform.networks().len(), 0);
}

#[test]
fn references_are_immutable() {
    let test = TestConfig::default();
    test.driver
        .create_l3_policy(mk_l3p("l3p-0", "10.0.0.0/16"))
        .unwrap();
    test.driver
        .create_l3_policy(mk_l3p("l3p-1", "10.1.0.0/16"))
        .unwrap();
    let l2p = test
        .driver
        .create_l2_policy(mk_l2p("l2p-0", Some("l3p-0")))
        .unwrap();

    let err = test
        .driver
        .update_l2_policy(
            &l2p,
            L2Policy {
                l3_policy_id: Some(L3PolicyId::new("l3p-1")),
                ..l2p.clone()
            },
        )
        .expect_err("L3 policy changed");
    assert_eq!(err, Error::L3PolicyUpdateOfL2PolicyNotSupported);

    let err = test
        .driver
        .update_l2_policy(
            &l2p,
            L2Policy {
                network_id: Some(NetworkId::new("net-x")),
                ..l2p.clone()
            },
        )
        .expect_err("network changed");
    assert_eq!(err, Error::L2PolicyNetworkUpdateNotSupported);

    let updated = test
        .driver
        .update_l2_policy(
            &l2p,
            L2Policy {
                l3_policy_id: None,
                network_id: None,
                name: "renamed".to_string(),
                ..l2p.clone()
            },
        )
        .unwrap();
    assert_eq!(updated.l3_policy_id, l2p.l3_policy_id);
    assert_eq!(updated.network_id, l2p.network_id);
}

#[test]
fn in_use_policy_is_not_deleted() {
    let test = TestConfig::default();
    let l2p = test.driver.create_l2_policy(mk_l2p("l2p-0", None)).unwrap();
    test.driver
        .create_policy_target_group(PolicyTargetGroup {
            l2_policy_id: Some(l2p.id.clone()),
            ..mk_ptg("ptg-0", NONE, NONE)
        })
        .unwrap();

    let err = test.driver.delete_l2_policy(&l2p).expect_err("ptg-0 uses l2p-0");
    assert_eq!(err, Error::L2PolicyInUse(l2p.id.clone()));
    assert_eq!(test.platform.networks().len(), 1);
}
