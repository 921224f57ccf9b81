use grouppolicy_core::{
    cidr,
    platform::Remote,
    policy::{ExternalSegment, Protocol},
    ExternalSegmentId, IpNet, PolicyRuleSetId,
};
use grouppolicy_policy_test::{
    fixtures::{self, ip, net},
    with_harness, Harness,
};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;

/// A segment named `default`, so that the tenant's default L3 policy attaches to it.
fn mk_internet(h: &Harness) -> ExternalSegment {
    let subnet = h.external_subnet("172.16.0.0/24");
    h.driver
        .create_external_segment(ExternalSegment {
            name: "default".to_string(),
            ..fixtures::segment(
                &h.tenant,
                "internet",
                &subnet.id,
                &[("0.0.0.0/0", "172.16.0.254")],
            )
        })
        .expect("segment must be created")
}

fn provided_remotes(h: &Harness, rs: &str) -> BTreeSet<IpNet> {
    let sg = h
        .driver
        .security_groups(&PolicyRuleSetId::new(rs))
        .expect("rule set must be mapped")
        .provided;
    h.platform
        .rules(&sg)
        .into_iter()
        .filter_map(|r| match r.remote {
            Remote::Cidr(net) => Some(net),
            Remote::Group(_) => None,
        })
        .collect()
}

fn reachable(h: &Harness) -> BTreeSet<IpNet> {
    h.driver
        .external_cidrs(&ExternalSegmentId::new("internet"))
        .into_iter()
        .collect()
}

#[test]
fn published_service_admits_the_outside() {
    with_harness(|h| {
        let t = &h.tenant;
        let es = mk_internet(h);
        h.allow_contract("http", Protocol::Tcp, Some("443"));
        h.driver
            .create_policy_target_group(fixtures::group(t, "web", &["http"], &[]))
            .unwrap();
        h.driver
            .create_external_policy(fixtures::external_policy(t, "clients", "internet", &[], &["http"]))
            .unwrap();

        // The default L3 policy's router is attached to the default segment.
        let routers = h.platform.routers();
        assert_eq!(routers.len(), 1);
        let gateway = routers[0].gateway.clone().expect("router must have a gateway");
        assert_eq!(Some(gateway.network_id), es.network_id);
        assert_eq!(gateway.fixed_ips, vec![ip("172.16.0.1")]);
        assert_eq!(routers[0].routes.len(), 1);

        // Clients are everything the segment reaches, less the tenant's own pool.
        let outside = reachable(h);
        assert_eq!(outside.len(), 8);
        assert!(outside.iter().all(|n| !cidr::overlaps(n, &net("10.0.0.0/8"))));
        assert_eq!(provided_remotes(h, "http"), outside);

        // A new pool narrows what counts as outside.
        let l3p = h
            .driver
            .create_l3_policy(fixtures::l3_policy(t, "lab", "172.20.0.0/16"))
            .unwrap();
        assert!(reachable(h)
            .iter()
            .all(|n| !cidr::overlaps(n, &net("172.20.0.0/16"))));
        assert_eq!(provided_remotes(h, "http"), reachable(h));
        h.driver.delete_l3_policy(&l3p).unwrap();
        assert_eq!(provided_remotes(h, "http"), outside);
    });
}

#[test]
fn segment_routes_drive_reachability() {
    with_harness(|h| {
        let t = &h.tenant;
        let es = mk_internet(h);
        h.allow_contract("http", Protocol::Tcp, Some("443"));
        h.driver
            .create_policy_target_group(fixtures::group(t, "web", &["http"], &[]))
            .unwrap();
        h.driver
            .create_external_policy(fixtures::external_policy(t, "clients", "internet", &[], &["http"]))
            .unwrap();

        let es = h
            .driver
            .update_external_segment(
                &es,
                ExternalSegment {
                    external_routes: fixtures::segment(
                        t,
                        "internet",
                        es.subnet_id.as_ref().unwrap(),
                        &[("198.51.100.0/24", "172.16.0.254"), ("203.0.113.0/24", "172.16.0.253")],
                    )
                    .external_routes,
                    ..es.clone()
                },
            )
            .unwrap();
        assert_eq!(
            provided_remotes(h, "http"),
            [net("198.51.100.0/24"), net("203.0.113.0/24")].into_iter().collect()
        );
        let routes = h.platform.routers()[0].routes.clone();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[1].nexthop, ip("172.16.0.253"));
        assert_eq!(es.cidr, Some(net("172.16.0.0/24")));
    });
}

#[test]
fn teardown_detaches_and_releases() {
    with_harness(|h| {
        let t = &h.tenant;
        let es = mk_internet(h);
        h.allow_contract("http", Protocol::Tcp, Some("443"));
        let web = h
            .driver
            .create_policy_target_group(fixtures::group(t, "web", &["http"], &[]))
            .unwrap();
        let ep = h
            .driver
            .create_external_policy(fixtures::external_policy(t, "clients", "internet", &[], &["http"]))
            .unwrap();
        assert_eq!(h.snapshot().routers.len(), 1);

        h.driver.delete_external_policy(&ep).unwrap();
        assert!(provided_remotes(h, "http").is_empty());
        h.driver.delete_policy_target_group(&web).unwrap();
        h.driver.delete_external_segment(&es).unwrap();
        h.driver
            .delete_policy_rule_set(&fixtures::rule_set(t, "http", &[]))
            .unwrap();

        // Only the segment's own network and subnet remain.
        let snapshot = h.snapshot();
        assert!(snapshot.routers.is_empty());
        assert!(snapshot.security_groups.is_empty());
        assert_eq!(snapshot.subnets.len(), 1);
        assert_eq!(snapshot.networks.len(), 1);
    });
}
