//! Compiles classifiers into security-group rules.

use crate::security::RuleEntries;
use grouppolicy_core::{
    cidr::IpSet,
    platform::{Ethertype, Remote, RuleDirection, SecurityGroupRule},
    policy::{Direction, PolicyClassifier},
    IpNet,
};
use std::collections::BTreeSet;

/// The addresses of the parties on either side of a contract.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Scopes {
    pub providers: BTreeSet<IpNet>,
    pub consumers: BTreeSet<IpNet>,
}

/// Derives the rules an allow action with `classifier` contributes to each side of a contract.
///
/// Traffic flowing in to the provider is admitted on ingress by the provided group and on egress
/// by the consumed group; traffic flowing out of the provider is the mirror image.
pub(crate) fn compile(classifier: &PolicyClassifier, scopes: &Scopes) -> RuleEntries {
    let mut entries = RuleEntries::default();

    let inbound = matches!(classifier.direction, Direction::In | Direction::Bidirectional);
    let outbound = matches!(classifier.direction, Direction::Out | Direction::Bidirectional);

    if inbound {
        for cidr in &scopes.consumers {
            entries
                .provided
                .push(rule(classifier, RuleDirection::Ingress, cidr));
        }
        for cidr in &scopes.providers {
            entries
                .consumed
                .push(rule(classifier, RuleDirection::Egress, cidr));
        }
    }
    if outbound {
        for cidr in &scopes.consumers {
            entries
                .provided
                .push(rule(classifier, RuleDirection::Egress, cidr));
        }
        for cidr in &scopes.providers {
            entries
                .consumed
                .push(rule(classifier, RuleDirection::Ingress, cidr));
        }
    }

    entries
}

/// Rules admitting all traffic from each of a group's own subnets.
pub(crate) fn intra_group<'c>(cidrs: impl IntoIterator<Item = &'c IpNet>) -> Vec<SecurityGroupRule> {
    cidrs
        .into_iter()
        .map(|cidr| SecurityGroupRule {
            direction: RuleDirection::Ingress,
            ethertype: Ethertype::of(cidr),
            protocol: None,
            port_range: None,
            remote: Remote::Cidr(*cidr),
        })
        .collect()
}

/// The destinations routable through a segment that are not internal to any L3 policy.
pub(crate) fn external_reachable(
    routes: impl IntoIterator<Item = IpNet>,
    pools: impl IntoIterator<Item = IpNet>,
) -> IpSet {
    IpSet::new(routes).difference(&IpSet::new(pools))
}

fn rule(classifier: &PolicyClassifier, direction: RuleDirection, cidr: &IpNet) -> SecurityGroupRule {
    SecurityGroupRule {
        direction,
        ethertype: Ethertype::of(cidr),
        protocol: classifier.protocol,
        port_range: classifier.port_range,
        remote: Remote::Cidr(*cidr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grouppolicy_core::{
        policy::{PortRange, Protocol},
        PolicyClassifierId, TenantId,
    };
    use pretty_assertions::assert_eq;

    fn classifier(direction: Direction) -> PolicyClassifier {
        PolicyClassifier {
            id: PolicyClassifierId::new("pc-0"),
            tenant_id: TenantId::new("tenant-0"),
            name: "web".to_string(),
            protocol: Some(Protocol::Tcp),
            port_range: Some(PortRange::single(80)),
            direction,
            shared: false,
        }
    }

    fn scopes() -> Scopes {
        Scopes {
            providers: ["10.0.0.0/24".parse().unwrap()].into_iter().collect(),
            consumers: ["10.0.1.0/24".parse().unwrap(), "fd00::/64".parse().unwrap()]
                .into_iter()
                .collect(),
        }
    }

    fn directions(rules: &[SecurityGroupRule]) -> Vec<(RuleDirection, String)> {
        rules
            .iter()
            .map(|r| match &r.remote {
                Remote::Cidr(net) => (r.direction, net.to_string()),
                Remote::Group(id) => (r.direction, id.to_string()),
            })
            .collect()
    }

    #[test]
    fn inbound_classifier() {
        let entries = compile(&classifier(Direction::In), &scopes());
        assert_eq!(
            directions(&entries.provided),
            vec![
                (RuleDirection::Ingress, "10.0.1.0/24".to_string()),
                (RuleDirection::Ingress, "fd00::/64".to_string()),
            ],
        );
        assert_eq!(
            directions(&entries.consumed),
            vec![(RuleDirection::Egress, "10.0.0.0/24".to_string())],
        );
        assert_eq!(entries.provided[1].ethertype, Ethertype::Ipv6);
        assert!(entries
            .provided
            .iter()
            .all(|r| r.protocol == Some(Protocol::Tcp) && r.port_range == Some(PortRange::single(80))));
    }

    #[test]
    fn outbound_classifier() {
        let entries = compile(&classifier(Direction::Out), &scopes());
        assert_eq!(
            directions(&entries.provided),
            vec![
                (RuleDirection::Egress, "10.0.1.0/24".to_string()),
                (RuleDirection::Egress, "fd00::/64".to_string()),
            ],
        );
        assert_eq!(
            directions(&entries.consumed),
            vec![(RuleDirection::Ingress, "10.0.0.0/24".to_string())],
        );
    }

    #[test]
    fn bidirectional_classifier_expands_both_ways() {
        let pc = PolicyClassifier {
            protocol: None,
            port_range: None,
            ..classifier(Direction::Bidirectional)
        };
        let entries = compile(&pc, &scopes());
        assert_eq!(entries.provided.len(), 4);
        assert_eq!(entries.consumed.len(), 2);
        assert!(entries
            .provided
            .iter()
            .chain(&entries.consumed)
            .all(|r| r.protocol.is_none() && r.port_range.is_none()));
    }

    #[test]
    fn no_peers_no_rules() {
        let entries = compile(&classifier(Direction::Bidirectional), &Scopes::default());
        assert_eq!(entries, RuleEntries::default());
    }

    #[test]
    fn intra_group_rules_are_unrestricted_ingress() {
        let cidrs: Vec<IpNet> = vec!["10.0.0.0/26".parse().unwrap()];
        assert_eq!(
            intra_group(&cidrs),
            vec![SecurityGroupRule {
                direction: RuleDirection::Ingress,
                ethertype: Ethertype::Ipv4,
                protocol: None,
                port_range: None,
                remote: Remote::Cidr(cidrs[0]),
            }],
        );
    }

    #[test]
    fn external_reachable_excludes_pools() {
        let reachable = external_reachable(
            ["0.0.0.0/0".parse().unwrap()],
            ["11.0.0.0/8".parse().unwrap()],
        );
        assert!(!reachable.overlaps(&"11.0.0.0/8".parse().unwrap()));
        assert!(reachable.contains(&"12.0.0.0/8".parse().unwrap()));
        assert_eq!(reachable.len(), 8);
    }
}
