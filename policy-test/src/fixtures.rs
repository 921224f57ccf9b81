//! Builders for policy objects with the fields tests usually leave unset.

use crate::Harness;
use grouppolicy_core::{
    platform::{NetworkSpec, Platform, Port, Subnet, SubnetSpec},
    policy::*,
    IpNet, L2PolicyId, L3PolicyId, PolicyRuleSetId, PolicyTargetGroupId, SubnetId, TenantId,
};
use maplit::btreemap;
use std::net::IpAddr;

pub fn net(s: &str) -> IpNet {
    s.parse().expect("CIDR must be valid")
}

pub fn ip(s: &str) -> IpAddr {
    s.parse().expect("address must be valid")
}

fn rule_sets(ids: &[&str]) -> Vec<PolicyRuleSetId> {
    ids.iter().copied().map(PolicyRuleSetId::new).collect()
}

pub fn l3_policy(tenant: &TenantId, id: &str, pool: &str) -> L3Policy {
    L3Policy {
        id: id.into(),
        tenant_id: tenant.clone(),
        name: id.to_string(),
        ip_pool: net(pool),
        subnet_prefix_length: 24,
        routers: vec![],
        external_segments: btreemap! {},
        shared: false,
    }
}

pub fn l2_policy(tenant: &TenantId, id: &str, l3p: Option<&str>) -> L2Policy {
    L2Policy {
        id: id.into(),
        tenant_id: tenant.clone(),
        name: id.to_string(),
        l3_policy_id: l3p.map(L3PolicyId::new),
        network_id: None,
        shared: false,
    }
}

pub fn group(tenant: &TenantId, id: &str, provided: &[&str], consumed: &[&str]) -> PolicyTargetGroup {
    PolicyTargetGroup {
        id: id.into(),
        tenant_id: tenant.clone(),
        name: id.to_string(),
        l2_policy_id: None,
        subnets: vec![],
        provided_policy_rule_sets: rule_sets(provided),
        consumed_policy_rule_sets: rule_sets(consumed),
        shared: false,
    }
}

pub fn group_on(tenant: &TenantId, id: &str, l2p: &str, provided: &[&str], consumed: &[&str]) -> PolicyTargetGroup {
    PolicyTargetGroup {
        l2_policy_id: Some(L2PolicyId::new(l2p)),
        ..group(tenant, id, provided, consumed)
    }
}

pub fn target(tenant: &TenantId, id: &str, ptg: &str) -> PolicyTarget {
    PolicyTarget {
        id: id.into(),
        tenant_id: tenant.clone(),
        name: id.to_string(),
        policy_target_group_id: Some(PolicyTargetGroupId::new(ptg)),
        port_id: None,
    }
}

pub fn classifier(
    tenant: &TenantId,
    id: &str,
    protocol: Protocol,
    ports: Option<&str>,
    direction: Direction,
) -> PolicyClassifier {
    PolicyClassifier {
        id: id.into(),
        tenant_id: tenant.clone(),
        name: id.to_string(),
        protocol: Some(protocol),
        port_range: ports.map(|p| p.parse().expect("port range must be valid")),
        direction,
        shared: false,
    }
}

pub fn allow(tenant: &TenantId, id: &str) -> PolicyAction {
    PolicyAction {
        id: id.into(),
        tenant_id: tenant.clone(),
        name: id.to_string(),
        action_type: ActionType::Allow,
        action_value: None,
        shared: false,
    }
}

pub fn redirect(tenant: &TenantId, id: &str, spec: &str) -> PolicyAction {
    PolicyAction {
        action_type: ActionType::Redirect,
        action_value: Some(spec.into()),
        ..allow(tenant, id)
    }
}

pub fn rule(tenant: &TenantId, id: &str, classifier: &str, actions: &[&str]) -> PolicyRule {
    PolicyRule {
        id: id.into(),
        tenant_id: tenant.clone(),
        name: id.to_string(),
        policy_classifier_id: classifier.into(),
        policy_actions: actions.iter().copied().map(Into::into).collect(),
        shared: false,
    }
}

pub fn rule_set(tenant: &TenantId, id: &str, rules: &[&str]) -> PolicyRuleSet {
    PolicyRuleSet {
        id: id.into(),
        tenant_id: tenant.clone(),
        name: id.to_string(),
        policy_rules: rules.iter().copied().map(Into::into).collect(),
        shared: false,
    }
}

pub fn segment(tenant: &TenantId, id: &str, subnet: &SubnetId, routes: &[(&str, &str)]) -> ExternalSegment {
    ExternalSegment {
        id: id.into(),
        tenant_id: tenant.clone(),
        name: id.to_string(),
        subnet_id: Some(subnet.clone()),
        cidr: None,
        network_id: None,
        external_routes: routes
            .iter()
            .map(|(destination, nexthop)| ExternalRoute {
                destination: net(destination),
                nexthop: Some(ip(nexthop)),
            })
            .collect(),
        port_address_translation: false,
        shared: false,
    }
}

pub fn external_policy(
    tenant: &TenantId,
    id: &str,
    segment: &str,
    provided: &[&str],
    consumed: &[&str],
) -> ExternalPolicy {
    ExternalPolicy {
        id: id.into(),
        tenant_id: tenant.clone(),
        name: id.to_string(),
        external_segments: vec![segment.into()],
        provided_policy_rule_sets: rule_sets(provided),
        consumed_policy_rule_sets: rule_sets(consumed),
        shared: false,
    }
}

// === impl Harness ===

impl Harness {
    /// Creates a contract whose single rule admits `protocol` traffic on `ports` toward providers.
    ///
    /// The classifier, action and rule are named after the rule set: `{id}-pc`, `{id}-pa` and
    /// `{id}-pr`.
    pub fn allow_contract(&self, id: &str, protocol: Protocol, ports: Option<&str>) -> PolicyRuleSet {
        let t = &self.tenant;
        let (pc, pa, pr) = (format!("{id}-pc"), format!("{id}-pa"), format!("{id}-pr"));
        self.driver
            .create_policy_classifier(classifier(t, &pc, protocol, ports, Direction::In))
            .expect("classifier must be created");
        self.driver
            .create_policy_action(allow(t, &pa))
            .expect("action must be created");
        self.driver
            .create_policy_rule(rule(t, &pr, &pc, &[&pa]))
            .expect("rule must be created");
        self.driver
            .create_policy_rule_set(rule_set(t, id, &[&pr]))
            .expect("rule set must be created")
    }

    /// Creates a contract that redirects traffic toward providers through a service chain.
    pub fn redirect_contract(&self, id: &str, spec: &str) -> PolicyRuleSet {
        let t = &self.tenant;
        let (pc, pa, pr) = (format!("{id}-pc"), format!("{id}-pa"), format!("{id}-pr"));
        self.driver
            .create_policy_classifier(classifier(t, &pc, Protocol::Tcp, None, Direction::In))
            .expect("classifier must be created");
        self.driver
            .create_policy_action(redirect(t, &pa, spec))
            .expect("action must be created");
        self.driver
            .create_policy_rule(rule(t, &pr, &pc, &[&pa]))
            .expect("rule must be created");
        self.driver
            .create_policy_rule_set(rule_set(t, id, &[&pr]))
            .expect("rule set must be created")
    }

    /// Creates a network and subnet directly on the platform, outside of any policy.
    pub fn external_subnet(&self, cidr: &str) -> Subnet {
        let network = self
            .platform
            .create_network(NetworkSpec {
                tenant_id: self.tenant.clone(),
                name: format!("ext_{cidr}"),
                shared: false,
            })
            .expect("network must be created");
        self.platform
            .create_subnet(SubnetSpec {
                tenant_id: self.tenant.clone(),
                network_id: network.id,
                name: format!("ext_{cidr}"),
                cidr: net(cidr),
            })
            .expect("subnet must be created")
    }

    pub fn port_of(&self, pt: &PolicyTarget) -> Port {
        let id = pt.port_id.as_ref().expect("target must have a port");
        self.platform.get_port(id).expect("port must exist")
    }

    pub fn subnet_cidr(&self, id: &SubnetId) -> IpNet {
        self.platform
            .get_subnet(id)
            .expect("subnet must exist")
            .cidr
    }
}
