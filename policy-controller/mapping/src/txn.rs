//! Collaborator calls made on behalf of a single event.
//!
//! Every mutating call is journaled with its inverse so that a failed event can be unwound.
//! Deletions are not issued immediately. They are deferred until the handler has succeeded, so a
//! failing handler never destroys anything it cannot recreate.
//!
//! A deferred deletion that fails still fails the event: the journal is reverted and the error is
//! returned. Primitives deleted before the failure stay deleted. Deletions tolerate `NotFound`, so
//! handling the same event again completes the release.

use crate::{redirect::Transition, Error, Result};
use grouppolicy_core::{
    chain::{ChainInstance, ChainRequest, ServiceChains},
    platform::*,
    ChainInstanceId, ChainSpecId, NetworkId, PortId, RouterId, SecurityGroupId, SubnetId,
};

pub(crate) struct Txn<'p> {
    platform: &'p dyn Platform,
    chains: &'p dyn ServiceChains,
    undo: Vec<Undo>,
    deferred: Vec<Primitive>,
    stats: Stats,
}

/// The effects of a committed event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Stats {
    pub rules_added: u64,
    pub rules_removed: u64,
    pub transitions: Vec<Transition>,
}

/// A releasable platform or chain object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Primitive {
    Network(NetworkId),
    Subnet(SubnetId),
    Router(RouterId),
    Port(PortId),
    SecurityGroup(SecurityGroupId),
    Chain(ChainInstanceId),
}

#[derive(Debug)]
enum Undo {
    Created(Primitive),
    InterfaceAdded {
        router: RouterId,
        subnet: SubnetId,
    },
    InterfaceRemoved {
        router: RouterId,
        subnet: SubnetId,
    },
    Gateway {
        router: RouterId,
        previous: Option<RouterGateway>,
    },
    Routes {
        router: RouterId,
        previous: Vec<Route>,
    },
    Bound {
        port: PortId,
        previous: Vec<SecurityGroupId>,
    },
    RuleAdded(grouppolicy_core::SecurityGroupRuleId),
    RuleRemoved {
        group: SecurityGroupId,
        rule: SecurityGroupRule,
    },
    Respecified {
        instance: ChainInstanceId,
        previous: ChainSpecId,
    },
}

// === impl Txn ===

impl<'p> Txn<'p> {
    pub(crate) fn new(platform: &'p dyn Platform, chains: &'p dyn ServiceChains) -> Self {
        Self {
            platform,
            chains,
            undo: Vec::new(),
            deferred: Vec::new(),
            stats: Stats::default(),
        }
    }

    /// The platform, for read-only calls.
    pub(crate) fn platform(&self) -> &'p dyn Platform {
        self.platform
    }

    pub(crate) fn create_network(&mut self, spec: NetworkSpec) -> Result<Network> {
        let network = self.platform.create_network(spec)?;
        tracing::debug!(network = %network.id, shared = network.shared, "Created network");
        self.undo
            .push(Undo::Created(Primitive::Network(network.id.clone())));
        Ok(network)
    }

    pub(crate) fn create_subnet(&mut self, spec: SubnetSpec) -> Result<Subnet> {
        let subnet = self.platform.create_subnet(spec)?;
        tracing::debug!(subnet = %subnet.id, cidr = %subnet.cidr, "Created subnet");
        self.undo
            .push(Undo::Created(Primitive::Subnet(subnet.id.clone())));
        Ok(subnet)
    }

    pub(crate) fn create_router(&mut self, spec: RouterSpec) -> Result<Router> {
        let router = self.platform.create_router(spec)?;
        tracing::debug!(router = %router.id, "Created router");
        self.undo
            .push(Undo::Created(Primitive::Router(router.id.clone())));
        Ok(router)
    }

    pub(crate) fn create_port(&mut self, spec: PortSpec) -> Result<Port> {
        let port = self.platform.create_port(spec)?;
        tracing::debug!(port = %port.id, "Created port");
        self.undo.push(Undo::Created(Primitive::Port(port.id.clone())));
        Ok(port)
    }

    pub(crate) fn create_security_group(
        &mut self,
        spec: SecurityGroupSpec,
    ) -> Result<SecurityGroup> {
        let group = self.platform.create_security_group(spec)?;
        tracing::debug!(group = %group.id, name = %group.name, "Created security group");
        self.undo
            .push(Undo::Created(Primitive::SecurityGroup(group.id.clone())));
        Ok(group)
    }

    pub(crate) fn add_router_interface(
        &mut self,
        router: &RouterId,
        subnet: &SubnetId,
    ) -> Result<()> {
        self.platform.add_router_interface(router, subnet)?;
        tracing::debug!(%router, %subnet, "Attached router interface");
        self.undo.push(Undo::InterfaceAdded {
            router: router.clone(),
            subnet: subnet.clone(),
        });
        Ok(())
    }

    /// Detaches a subnet from a router. An interface that is already gone is ignored.
    pub(crate) fn remove_router_interface(
        &mut self,
        router: &RouterId,
        subnet: &SubnetId,
    ) -> Result<()> {
        match self.platform.remove_router_interface(router, subnet) {
            Ok(()) => {
                tracing::debug!(%router, %subnet, "Detached router interface");
                self.undo.push(Undo::InterfaceRemoved {
                    router: router.clone(),
                    subnet: subnet.clone(),
                });
                Ok(())
            }
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    pub(crate) fn set_router_gateway(
        &mut self,
        router: &RouterId,
        gateway: Option<GatewaySpec>,
    ) -> Result<Option<RouterGateway>> {
        let previous = self.platform.get_router(router)?.gateway;
        let gateway = self.platform.set_router_gateway(router, gateway)?;
        tracing::debug!(%router, gateway = ?gateway, "Set router gateway");
        self.undo.push(Undo::Gateway {
            router: router.clone(),
            previous,
        });
        Ok(gateway)
    }

    pub(crate) fn set_router_routes(&mut self, router: &RouterId, routes: Vec<Route>) -> Result<()> {
        let previous = self.platform.get_router(router)?.routes;
        if previous == routes {
            return Ok(());
        }
        tracing::debug!(%router, routes = routes.len(), "Set router routes");
        self.platform.set_router_routes(router, routes)?;
        self.undo.push(Undo::Routes {
            router: router.clone(),
            previous,
        });
        Ok(())
    }

    pub(crate) fn bind_security_groups(
        &mut self,
        port: &PortId,
        groups: Vec<SecurityGroupId>,
    ) -> Result<()> {
        let previous = self.platform.get_port(port)?.security_groups;
        if previous == groups {
            return Ok(());
        }
        tracing::debug!(%port, groups = ?groups, "Binding security groups");
        self.platform.bind_security_groups(port, groups)?;
        self.undo.push(Undo::Bound {
            port: port.clone(),
            previous,
        });
        Ok(())
    }

    pub(crate) fn add_rule(&mut self, group: &SecurityGroupId, rule: SecurityGroupRule) -> Result<()> {
        let installed = self.platform.add_security_group_rule(group, rule)?;
        tracing::trace!(%group, rule = ?installed.rule, "Added rule");
        self.undo.push(Undo::RuleAdded(installed.id));
        self.stats.rules_added += 1;
        Ok(())
    }

    pub(crate) fn remove_rule(&mut self, installed: InstalledRule) -> Result<()> {
        self.platform.remove_security_group_rule(&installed.id)?;
        tracing::trace!(group = %installed.security_group_id, rule = ?installed.rule, "Removed rule");
        self.undo.push(Undo::RuleRemoved {
            group: installed.security_group_id,
            rule: installed.rule,
        });
        self.stats.rules_removed += 1;
        Ok(())
    }

    pub(crate) fn instantiate(&mut self, request: ChainRequest) -> Result<ChainInstance> {
        let instance = self.chains.instantiate(request)?;
        self.undo
            .push(Undo::Created(Primitive::Chain(instance.id.clone())));
        Ok(instance)
    }

    /// Attempts to point `instance` at `spec` in place.
    pub(crate) fn respecify(
        &mut self,
        instance: &ChainInstanceId,
        previous: &ChainSpecId,
        spec: &ChainSpecId,
    ) -> Result<bool> {
        if !self.chains.respecify(instance, spec)? {
            return Ok(false);
        }
        self.undo.push(Undo::Respecified {
            instance: instance.clone(),
            previous: previous.clone(),
        });
        Ok(true)
    }

    /// Schedules `primitive` for deletion when the event commits.
    pub(crate) fn release(&mut self, primitive: Primitive) {
        tracing::debug!(?primitive, "Releasing");
        self.deferred.push(primitive);
    }

    pub(crate) fn record(&mut self, transition: Transition) {
        self.stats.transitions.push(transition);
    }

    /// Issues the deferred deletions and returns the event's effects.
    ///
    /// Chain instances are retired before any platform primitive is deleted. Otherwise deletions
    /// follow the order they were scheduled in. If one fails, the journal is reverted and the
    /// remaining deletions are not attempted.
    pub(crate) fn commit(mut self) -> Result<Stats> {
        let (chains, platform): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|p| matches!(p, Primitive::Chain(_)));
        for primitive in chains.into_iter().chain(platform) {
            match primitive.delete(self.platform, self.chains) {
                Ok(()) => tracing::debug!(?primitive, "Released"),
                Err(error) if error.is_not_found() => {}
                Err(error) => {
                    tracing::debug!(?primitive, %error, "Failed to release");
                    self.rollback();
                    return Err(error);
                }
            }
        }
        Ok(self.stats)
    }

    /// Reverts every journaled call, most recent first.
    pub(crate) fn rollback(self) {
        let Self {
            platform,
            chains,
            undo,
            ..
        } = self;
        tracing::debug!(steps = undo.len(), "Rolling back");
        for step in undo.into_iter().rev() {
            if let Err(error) = step.revert(platform, chains) {
                if !error.is_not_found() {
                    tracing::warn!(%error, "Failed to roll back");
                }
            }
        }
    }
}

// === impl Primitive ===

impl Primitive {
    fn delete(&self, platform: &dyn Platform, chains: &dyn ServiceChains) -> Result<()> {
        match self {
            Self::Network(id) => platform.delete_network(id)?,
            Self::Subnet(id) => platform.delete_subnet(id)?,
            Self::Router(id) => platform.delete_router(id)?,
            Self::Port(id) => platform.delete_port(id)?,
            Self::SecurityGroup(id) => platform.delete_security_group(id)?,
            Self::Chain(id) => chains.retire(id)?,
        }
        Ok(())
    }
}

impl From<NetworkId> for Primitive {
    fn from(id: NetworkId) -> Self {
        Self::Network(id)
    }
}

impl From<SubnetId> for Primitive {
    fn from(id: SubnetId) -> Self {
        Self::Subnet(id)
    }
}

impl From<RouterId> for Primitive {
    fn from(id: RouterId) -> Self {
        Self::Router(id)
    }
}

impl From<PortId> for Primitive {
    fn from(id: PortId) -> Self {
        Self::Port(id)
    }
}

impl From<SecurityGroupId> for Primitive {
    fn from(id: SecurityGroupId) -> Self {
        Self::SecurityGroup(id)
    }
}

// === impl Undo ===

impl Undo {
    fn revert(self, platform: &dyn Platform, chains: &dyn ServiceChains) -> Result<(), Error> {
        match self {
            Self::Created(primitive) => primitive.delete(platform, chains)?,
            Self::InterfaceAdded { router, subnet } => {
                platform.remove_router_interface(&router, &subnet)?
            }
            Self::InterfaceRemoved { router, subnet } => {
                platform.add_router_interface(&router, &subnet)?
            }
            Self::Gateway { router, previous } => {
                let previous = previous.map(|gw| GatewaySpec {
                    network_id: gw.network_id,
                    fixed_ips: gw.fixed_ips,
                });
                platform.set_router_gateway(&router, previous)?;
            }
            Self::Routes { router, previous } => platform.set_router_routes(&router, previous)?,
            Self::Bound { port, previous } => platform.bind_security_groups(&port, previous)?,
            Self::RuleAdded(id) => platform.remove_security_group_rule(&id)?,
            Self::RuleRemoved { group, rule } => {
                platform.add_security_group_rule(&group, rule)?;
            }
            Self::Respecified { instance, previous } => {
                chains.respecify(&instance, &previous)?;
            }
        }
        Ok(())
    }
}
