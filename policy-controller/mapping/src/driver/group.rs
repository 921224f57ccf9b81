use super::Reconcile;
use crate::{
    allocator,
    error::{Error, Result},
    index::{GroupState, GroupSubnet, Party, TargetState},
    security,
    txn::Primitive,
};
use grouppolicy_core::{
    platform::{PortSpec, SecurityGroupSpec},
    policy::{L2Policy, PolicyTarget, PolicyTargetGroup, ResourceKind},
    L2PolicyId, NetworkId, Owned, PolicyTargetGroupId, PolicyTargetId, RouterId, SubnetId,
};
use std::collections::BTreeSet;

impl Reconcile<'_, '_> {
    pub(super) fn create_policy_target_group(
        &mut self,
        mut ptg: PolicyTargetGroup,
    ) -> Result<PolicyTargetGroup> {
        dedup_subnets(&mut ptg.subnets);
        self.index.check_rule_sets(
            ptg.provided_policy_rule_sets
                .iter()
                .chain(&ptg.consumed_policy_rule_sets),
        )?;

        let l2_policy = match &ptg.l2_policy_id {
            Some(id) => {
                let l2p = &self.index.l2_policy(id)?.policy;
                if l2p.tenant_id != ptg.tenant_id || (ptg.shared && !l2p.shared) {
                    return Err(Error::CrossTenantPolicyTargetGroupL2PolicyNotSupported {
                        group: ptg.id.clone(),
                        tenant: ptg.tenant_id.clone(),
                        l2_policy: id.clone(),
                    });
                }
                Owned::explicit(id.clone())
            }
            None => {
                let l2p = self.create_l2_policy(L2Policy {
                    id: L2PolicyId::generate(),
                    tenant_id: ptg.tenant_id.clone(),
                    name: allocator::display_name(&ptg.name, ptg.id.as_str()).to_string(),
                    l3_policy_id: None,
                    network_id: None,
                    shared: ptg.shared,
                })?;
                tracing::debug!(ptg = %ptg.id, l2p = %l2p.id, "Created implicit L2 policy");
                Owned::implicit(l2p.id)
            }
        };

        let l2p = self.index.l2_policy(&l2_policy.id)?.clone();
        let l3p = self.index.l3_policy(&l2p.l3_policy.id)?.clone();
        let network = l2p.network.id.clone();
        let router = l3p.router.id.clone();

        let mut subnets = Vec::with_capacity(ptg.subnets.len().max(1));
        if ptg.subnets.is_empty() {
            let name = allocator::display_name(&ptg.name, ptg.id.as_str());
            let (subnet, cidr) = allocator::allocate_subnet(
                self.index,
                self.txn,
                &l3p.policy,
                &network,
                &ptg.tenant_id,
                name,
            )?;
            self.txn.add_router_interface(&router, &subnet.id)?;
            tracing::debug!(ptg = %ptg.id, subnet = %subnet.id, %cidr, "Allocated subnet");
            subnets.push(GroupSubnet {
                subnet,
                cidr,
                interface: true,
            });
        } else {
            for id in &ptg.subnets {
                subnets.push(self.attach_subnet(&network, &router, id)?);
            }
        }

        let intra_sg = self.txn.create_security_group(SecurityGroupSpec {
            tenant_id: ptg.tenant_id.clone(),
            name: format!("intra_{}", ptg.id),
        })?;

        ptg.l2_policy_id = Some(l2_policy.id.clone());
        ptg.subnets = subnets.iter().map(|s| s.subnet.id.clone()).collect();

        self.index
            .deps
            .l2_policy_groups
            .link(l2_policy.id.clone(), ptg.id.clone());
        let touched = self.index.deps.set_party(
            &Party::Group(ptg.id.clone()),
            &ptg.provided_policy_rule_sets,
            &ptg.consumed_policy_rule_sets,
        );
        self.index.groups.insert(
            ptg.id.clone(),
            GroupState {
                policy: ptg.clone(),
                l2_policy,
                subnets,
                intra_sg: intra_sg.id,
            },
        );

        security::sync_intra_group(self.index, self.txn, &ptg.id)?;
        self.sync_rule_sets(touched)?;
        Ok(ptg)
    }

    pub(super) fn update_policy_target_group(
        &mut self,
        mut after: PolicyTargetGroup,
    ) -> Result<PolicyTargetGroup> {
        dedup_subnets(&mut after.subnets);
        let current = self.index.group(&after.id)?.clone();
        if matches!(&after.l2_policy_id, Some(id) if *id != current.l2_policy.id) {
            return Err(Error::L2PolicyUpdateOfPolicyTargetGroupNotSupported);
        }
        // An empty subnet list leaves the subnets unchanged.
        if !after.subnets.is_empty()
            && current
                .policy
                .subnets
                .iter()
                .any(|s| !after.subnets.contains(s))
        {
            return Err(Error::PolicyTargetGroupSubnetRemovalNotSupported(
                after.id.clone(),
            ));
        }
        self.index.check_rule_sets(
            after
                .provided_policy_rule_sets
                .iter()
                .chain(&after.consumed_policy_rule_sets),
        )?;

        let mut subnets = current.subnets.clone();
        let added = after
            .subnets
            .iter()
            .filter(|s| !current.policy.subnets.contains(s))
            .cloned()
            .collect::<Vec<_>>();
        if !added.is_empty() {
            let l2p = self.index.l2_policy(&current.l2_policy.id)?;
            let network = l2p.network.id.clone();
            let router = self.index.l3_policy(&l2p.l3_policy.id)?.router.id.clone();
            for id in &added {
                subnets.push(self.attach_subnet(&network, &router, id)?);
            }
        }

        let contracts_changed = after.provided_policy_rule_sets
            != current.policy.provided_policy_rule_sets
            || after.consumed_policy_rule_sets != current.policy.consumed_policy_rule_sets;

        let policy = PolicyTargetGroup {
            l2_policy_id: Some(current.l2_policy.id.clone()),
            subnets: subnets.iter().map(|s| s.subnet.id.clone()).collect(),
            ..after
        };

        let mut touched = BTreeSet::new();
        if contracts_changed {
            touched = self.index.deps.set_party(
                &Party::Group(policy.id.clone()),
                &policy.provided_policy_rule_sets,
                &policy.consumed_policy_rule_sets,
            );
        }
        if !added.is_empty() {
            // The group's addresses changed, so every contract it is party to changed too.
            touched.extend(policy.provided_policy_rule_sets.iter().cloned());
            touched.extend(policy.consumed_policy_rule_sets.iter().cloned());
        }
        self.index.groups.insert(
            policy.id.clone(),
            GroupState {
                policy: policy.clone(),
                subnets,
                ..current
            },
        );

        if !added.is_empty() {
            security::sync_intra_group(self.index, self.txn, &policy.id)?;
        }
        if contracts_changed {
            self.rebind_group(&policy.id)?;
        }
        self.sync_rule_sets(touched)?;
        Ok(policy)
    }

    pub(super) fn delete_policy_target_group(&mut self, id: &PolicyTargetGroupId) -> Result<()> {
        let state = self.index.group(id)?.clone();
        if self.index.deps.group_targets.has(id) {
            return Err(Error::PolicyTargetGroupInUse(id.clone()));
        }

        let touched = self
            .index
            .deps
            .set_party(&Party::Group(id.clone()), &[], &[]);
        self.index.groups.remove(id);
        self.sync_rule_sets(touched)?;

        let l2p = self.index.l2_policy(&state.l2_policy.id)?;
        let router = self.index.l3_policy(&l2p.l3_policy.id)?.router.id.clone();
        for subnet in state.subnets {
            if subnet.interface {
                self.txn.remove_router_interface(&router, &subnet.subnet.id)?;
            }
            allocator::release_if_owned(self.txn, subnet.subnet);
        }
        self.txn.release(Primitive::SecurityGroup(state.intra_sg));

        self.index
            .deps
            .l2_policy_groups
            .unlink(&state.l2_policy.id, id);
        if state.l2_policy.is_implicit() {
            self.delete_l2_policy(&state.l2_policy.id)?;
        }
        Ok(())
    }

    pub(super) fn create_policy_target(&mut self, mut pt: PolicyTarget) -> Result<PolicyTarget> {
        let Some(ptg) = pt.policy_target_group_id.clone() else {
            return Err(Error::PolicyTargetRequiresPolicyTargetGroup);
        };
        let group = self.index.group(&ptg)?.clone();

        let port = match &pt.port_id {
            Some(id) => {
                let port = self.txn.platform().get_port(id).map_err(|error| {
                    if error.is_not_found() {
                        Error::ReferencedPortNotFound(id.clone())
                    } else {
                        error.into()
                    }
                })?;
                let on_group = port
                    .fixed_ips
                    .iter()
                    .any(|ip| group.subnets.iter().any(|s| s.subnet.id == ip.subnet_id));
                if !on_group {
                    return Err(Error::InvalidPortForPTG {
                        port: id.clone(),
                        group: ptg,
                    });
                }
                Owned::explicit(port.id)
            }
            None => {
                let network = self.index.l2_policy(&group.l2_policy.id)?.network.id.clone();
                // Groups always hold at least one subnet.
                let subnet = group
                    .subnets
                    .first()
                    .map(|s| s.subnet.id.clone())
                    .ok_or_else(|| Error::not_found(ResourceKind::PolicyTargetGroup, &ptg))?;
                let port = self.txn.create_port(PortSpec {
                    tenant_id: pt.tenant_id.clone(),
                    network_id: network,
                    subnet_id: subnet,
                    name: format!("pt_{}", allocator::display_name(&pt.name, pt.id.as_str())),
                })?;
                Owned::implicit(port.id)
            }
        };

        self.txn
            .bind_security_groups(&port.id, self.index.port_groups(&group))?;
        tracing::debug!(pt = %pt.id, port = %port.id, ownership = ?port.ownership, "Bound port");

        pt.port_id = Some(port.id.clone());
        self.index
            .deps
            .group_targets
            .link(ptg, pt.id.clone());
        self.index.targets.insert(
            pt.id.clone(),
            TargetState {
                policy: pt.clone(),
                port,
            },
        );
        Ok(pt)
    }

    pub(super) fn update_policy_target(&mut self, after: PolicyTarget) -> Result<PolicyTarget> {
        let current = self.index.target(&after.id)?.clone();
        if after.policy_target_group_id != current.policy.policy_target_group_id {
            return Err(Error::PolicyTargetGroupUpdateOfPolicyTargetNotSupported);
        }
        if matches!(&after.port_id, Some(id) if *id != current.port.id) {
            return Err(Error::PolicyTargetPortUpdateNotSupported);
        }

        let policy = PolicyTarget {
            port_id: Some(current.port.id.clone()),
            ..after
        };
        self.index.targets.insert(
            policy.id.clone(),
            TargetState {
                policy: policy.clone(),
                port: current.port,
            },
        );
        Ok(policy)
    }

    pub(super) fn delete_policy_target(&mut self, id: &PolicyTargetId) -> Result<()> {
        let state = self.index.target(id)?.clone();

        if state.port.is_implicit() {
            allocator::release_if_owned(self.txn, state.port);
        } else {
            // The caller may already have deleted its port.
            match self.txn.bind_security_groups(&state.port.id, Vec::new()) {
                Err(error) if error.is_not_found() => {
                    tracing::debug!(pt = %id, port = %state.port.id, "Port already deleted");
                }
                result => result?,
            }
        }

        if let Some(ptg) = &state.policy.policy_target_group_id {
            self.index.deps.group_targets.unlink(ptg, id);
        }
        self.index.targets.remove(id);
        Ok(())
    }

    /// Validates an explicit subnet and attaches it to the L3 policy's router.
    fn attach_subnet(
        &mut self,
        network: &NetworkId,
        router: &RouterId,
        id: &SubnetId,
    ) -> Result<GroupSubnet> {
        let subnet = self.txn.platform().get_subnet(id).map_err(|error| {
            if error.is_not_found() {
                Error::ReferencedSubnetNotFound(id.clone())
            } else {
                error.into()
            }
        })?;
        if subnet.network_id != *network {
            return Err(Error::InvalidSubnetForPTG {
                subnet: id.clone(),
                network: network.clone(),
            });
        }

        let attached = self
            .txn
            .platform()
            .get_router(router)?
            .interfaces
            .contains(id);
        if !attached {
            self.txn.add_router_interface(router, id)?;
        }
        Ok(GroupSubnet {
            subnet: Owned::explicit(subnet.id),
            cidr: subnet.cidr,
            interface: !attached,
        })
    }

    /// Binds every port of a group to its current security groups.
    fn rebind_group(&mut self, ptg: &PolicyTargetGroupId) -> Result<()> {
        let group = self.index.group(ptg)?;
        let sgs = self.index.port_groups(group);
        let ports = self
            .index
            .deps
            .group_targets
            .get(ptg)
            .iter()
            .filter_map(|pt| self.index.targets.get(pt))
            .map(|t| t.port.id.clone())
            .collect::<Vec<_>>();
        for port in ports {
            self.txn.bind_security_groups(&port, sgs.clone())?;
        }
        Ok(())
    }
}

/// Drops repeated subnet ids, keeping the first occurrence of each.
fn dedup_subnets(subnets: &mut Vec<SubnetId>) {
    let mut seen = BTreeSet::new();
    subnets.retain(|id| seen.insert(id.clone()));
}
