use super::*;
use pretty_assertions::assert_eq;
use grouppolicy_core::{platform::PortSpec, PortId};

#[test]
fn implicit_port_is_bound_and_released() {
    let test = TestConfig::default();
    let ptg = test
        .driver
        .create_policy_target_group(mk_ptg("ptg-0", NONE, NONE))
        .unwrap();
    let pt = test
        .driver
        .create_policy_target(mk_pt("pt-0", Some("ptg-0")))
        .unwrap();

    let ports = test.platform.ports();
    assert_eq!(ports.len(), 1);
    assert_eq!(pt.port_id.as_ref(), Some(&ports[0].id));
    assert_eq!(ports[0].fixed_ips[0].subnet_id, ptg.subnets[0]);
    assert_eq!(ports[0].fixed_ips[0].ip_address, ip("10.0.0.1"));
    assert_eq!(
        ports[0].security_groups,
        vec![test.driver.intra_group_security_group(&ptg.id).unwrap()]
    );

    test.driver.delete_policy_target(&pt).unwrap();
    assert!(test.platform.ports().is_empty());
    assert_eq!(test.driver.get(ResourceKind::PolicyTarget, "pt-0"), None);
}

#[test]
fn explicit_port_is_unbound_and_kept() {
    let test = TestConfig::default();
    let ptg = test
        .driver
        .create_policy_target_group(mk_ptg("ptg-0", NONE, NONE))
        .unwrap();
    let subnet = test.platform.get_subnet(&ptg.subnets[0]).unwrap();
    let port = test
        .platform
        .create_port(PortSpec {
            tenant_id: tenant(),
            network_id: subnet.network_id.clone(),
            subnet_id: subnet.id.clone(),
            name: "existing".to_string(),
        })
        .unwrap();

    let pt = test
        .driver
        .create_policy_target(PolicyTarget {
            port_id: Some(port.id.clone()),
            ..mk_pt("pt-0", Some("ptg-0"))
        })
        .unwrap();
    assert_eq!(pt.port_id, Some(port.id.clone()));
    assert_eq!(
        test.platform.get_port(&port.id).unwrap().security_groups.len(),
        1
    );

    test.driver.delete_policy_target(&pt).unwrap();
    let port = test.platform.get_port(&port.id).unwrap();
    assert!(port.security_groups.is_empty());
}

#[test]
fn explicit_port_deleted_out_of_band() {
    let test = TestConfig::default();
    let ptg = test
        .driver
        .create_policy_target_group(mk_ptg("ptg-0", NONE, NONE))
        .unwrap();
    let subnet = test.platform.get_subnet(&ptg.subnets[0]).unwrap();
    let port = test
        .platform
        .create_port(PortSpec {
            tenant_id: tenant(),
            network_id: subnet.network_id,
            subnet_id: subnet.id,
            name: "existing".to_string(),
        })
        .unwrap();
    let pt = test
        .driver
        .create_policy_target(PolicyTarget {
            port_id: Some(port.id.clone()),
            ..mk_pt("pt-0", Some("ptg-0"))
        })
        .unwrap();

    test.platform.delete_port(&port.id).unwrap();
    test.driver.delete_policy_target(&pt).unwrap();
    test.driver.delete_policy_target_group(&ptg).unwrap();
    assert!(test.platform.is_empty());
}

#[test]
fn explicit_port_must_be_on_group_subnet() {
    let test = TestConfig::default();
    test.driver
        .create_policy_target_group(mk_ptg("ptg-0", NONE, NONE))
        .unwrap();
    let stray = test.mk_subnet("10.200.0.0/24");
    let port = test
        .platform
        .create_port(PortSpec {
            tenant_id: tenant(),
            network_id: stray.network_id.clone(),
            subnet_id: stray.id.clone(),
            name: "stray".to_string(),
        })
        .unwrap();

    let err = test
        .driver
        .create_policy_target(PolicyTarget {
            port_id: Some(port.id.clone()),
            ..mk_pt("pt-0", Some("ptg-0"))
        })
        .expect_err("port is not on ptg-0");
    assert_eq!(
        err,
        Error::InvalidPortForPTG {
            port: port.id.clone(),
            group: PolicyTargetGroupId::new("ptg-0"),
        }
    );

    let err = test
        .driver
        .create_policy_target(PolicyTarget {
            port_id: Some(PortId::new("port-x")),
            ..mk_pt("pt-0", Some("ptg-0"))
        })
        .expect_err("port-x does not exist");
    assert_eq!(err, Error::ReferencedPortNotFound(PortId::new("port-x")));
    assert_eq!(err.class(), crate::ErrorClass::Internal);
}

#[test]
fn group_is_required() {
    let test = TestConfig::default();
    let err = test
        .driver
        .create_policy_target(mk_pt("pt-0", None))
        .expect_err("no group");
    assert_eq!(err, Error::PolicyTargetRequiresPolicyTargetGroup);
}

#[test]
fn group_and_port_are_immutable() {
    let test = TestConfig::default();
    test.driver
        .create_policy_target_group(mk_ptg("ptg-0", NONE, NONE))
        .unwrap();
    test.driver
        .create_policy_target_group(mk_ptg("ptg-1", NONE, NONE))
        .unwrap();
    let pt = test
        .driver
        .create_policy_target(mk_pt("pt-0", Some("ptg-0")))
        .unwrap();

    for group in [Some("ptg-1"), None] {
        let err = test
            .driver
            .update_policy_target(
                &pt,
                PolicyTarget {
                    policy_target_group_id: group.map(PolicyTargetGroupId::new),
                    ..pt.clone()
                },
            )
            .expect_err("group changed");
        assert_eq!(err, Error::PolicyTargetGroupUpdateOfPolicyTargetNotSupported);
    }

    let err = test
        .driver
        .update_policy_target(
            &pt,
            PolicyTarget {
                port_id: Some(PortId::new("port-x")),
                ..pt.clone()
            },
        )
        .expect_err("port changed");
    assert_eq!(err, Error::PolicyTargetPortUpdateNotSupported);

    let renamed = test
        .driver
        .update_policy_target(
            &pt,
            PolicyTarget {
                name: "renamed".to_string(),
                port_id: None,
                ..pt.clone()
            },
        )
        .unwrap();
    assert_eq!(renamed.port_id, pt.port_id);
}

#[test]
fn ports_follow_group_contracts() {
    let test = TestConfig::default();
    test.mk_allow_contract("prs-0");
    test.driver
        .create_policy_rule_set(mk_rule_set("prs-1", ["pr-0"]))
        .unwrap();
    let ptg = test
        .driver
        .create_policy_target_group(mk_ptg("ptg-0", ["prs-0"], NONE))
        .unwrap();
    let pt = test
        .driver
        .create_policy_target(mk_pt("pt-0", Some("ptg-0")))
        .unwrap();
    let port = pt.port_id.clone().unwrap();
    let intra = test.driver.intra_group_security_group(&ptg.id).unwrap();
    assert_eq!(
        test.platform.get_port(&port).unwrap().security_groups,
        vec![intra.clone(), test.provided_sg("prs-0")]
    );

    let ptg = test
        .driver
        .update_policy_target_group(
            &ptg,
            PolicyTargetGroup {
                consumed_policy_rule_sets: vec![PolicyRuleSetId::new("prs-1")],
                ..ptg.clone()
            },
        )
        .unwrap();
    assert_eq!(
        test.platform.get_port(&port).unwrap().security_groups,
        vec![
            intra.clone(),
            test.provided_sg("prs-0"),
            test.consumed_sg("prs-1")
        ]
    );

    test.driver
        .update_policy_target_group(
            &ptg,
            PolicyTargetGroup {
                provided_policy_rule_sets: vec![],
                consumed_policy_rule_sets: vec![],
                ..ptg.clone()
            },
        )
        .unwrap();
    assert_eq!(
        test.platform.get_port(&port).unwrap().security_groups,
        vec![intra]
    );
}
