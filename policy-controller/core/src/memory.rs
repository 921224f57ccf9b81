//! In-memory platform and service-chain implementations.
//!
//! These back dry runs and tests. Identifiers are minted from a shared counter (`net-1`,
//! `subnet-2`, ...) so results are deterministic. Either collaborator may be told to fail a
//! named operation once, which lets callers exercise their error paths.

use crate::{
    chain::{ChainError, ChainFilter, ChainInstance, ChainRequest, ServiceChains},
    cidr,
    platform::*,
    ChainInstanceId, ChainSpecId, NetworkId, PortId, RouterId, SecurityGroupId,
    SecurityGroupRuleId, SubnetId,
};
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::net::IpAddr;

#[derive(Debug, Default)]
pub struct MemoryPlatform {
    state: Mutex<PlatformState>,
}

#[derive(Debug)]
pub struct MemoryChains {
    state: Mutex<ChainState>,
    respecify: bool,
}

#[derive(Debug, Default)]
struct Faults {
    // Operation name to the number of successful calls remaining before it fails.
    pending: HashMap<&'static str, usize>,
}

/// Objects are stored with their creation sequence number so listings are ordered.
#[derive(Debug, Default)]
struct PlatformState {
    seq: u64,
    networks: HashMap<NetworkId, (u64, Network)>,
    subnets: HashMap<SubnetId, (u64, Subnet)>,
    routers: HashMap<RouterId, (u64, Router)>,
    ports: HashMap<PortId, (u64, Port)>,
    security_groups: HashMap<SecurityGroupId, (u64, SecurityGroup)>,
    rules: HashMap<SecurityGroupRuleId, (u64, InstalledRule)>,
    faults: Faults,
}

#[derive(Debug, Default)]
struct ChainState {
    seq: u64,
    instances: HashMap<ChainInstanceId, (u64, ChainInstance)>,
    faults: Faults,
}

fn sorted<T: Clone>(items: impl Iterator<Item = (u64, T)>) -> Vec<T> {
    let mut items = items.collect::<Vec<_>>();
    items.sort_by_key(|(seq, _)| *seq);
    items.into_iter().map(|(_, item)| item).collect()
}

// === impl Faults ===

impl Faults {
    fn arm(&mut self, op: &'static str, after: usize) {
        self.pending.insert(op, after);
    }

    fn check(&mut self, op: &'static str) -> bool {
        match self.pending.get_mut(op) {
            None => false,
            Some(0) => {
                self.pending.remove(op);
                true
            }
            Some(n) => {
                *n -= 1;
                false
            }
        }
    }
}

// === impl MemoryPlatform ===

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Causes the next call of `op` (e.g. `"create_subnet"`) to fail.
    pub fn fail_on(&self, op: &'static str) {
        self.fail_after(op, 0);
    }

    /// Causes `op` to fail after `calls` more successful calls.
    pub fn fail_after(&self, op: &'static str, calls: usize) {
        self.state.lock().faults.arm(op, calls);
    }

    pub fn networks(&self) -> Vec<Network> {
        let state = self.state.lock();
        sorted(state.networks.values().cloned())
    }

    pub fn subnets(&self) -> Vec<Subnet> {
        let state = self.state.lock();
        sorted(state.subnets.values().cloned())
    }

    pub fn routers(&self) -> Vec<Router> {
        let state = self.state.lock();
        sorted(state.routers.values().cloned())
    }

    pub fn ports(&self) -> Vec<Port> {
        let state = self.state.lock();
        sorted(state.ports.values().cloned())
    }

    pub fn security_groups(&self) -> Vec<SecurityGroup> {
        let state = self.state.lock();
        sorted(state.security_groups.values().cloned())
    }

    /// Returns the rules installed in `group`, in installation order.
    pub fn rules(&self, group: &SecurityGroupId) -> Vec<SecurityGroupRule> {
        let state = self.state.lock();
        sorted(
            state
                .rules
                .values()
                .filter(|(_, r)| r.security_group_id == *group)
                .map(|(seq, r)| (*seq, r.rule.clone())),
        )
    }

    pub fn rule_count(&self) -> usize {
        self.state.lock().rules.len()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.networks.is_empty()
            && state.subnets.is_empty()
            && state.routers.is_empty()
            && state.ports.is_empty()
            && state.security_groups.is_empty()
    }
}

impl PlatformState {
    fn fault(&mut self, op: &'static str) -> Result<()> {
        if self.faults.check(op) {
            tracing::debug!(op, "Injected platform failure");
            return Err(PlatformError::Failed(format!("{op}: injected failure")));
        }
        Ok(())
    }

    fn next_id(&mut self, prefix: &str) -> (u64, String) {
        self.seq += 1;
        (self.seq, format!("{prefix}-{}", self.seq))
    }

    fn addresses_in_use(&self, subnet: &Subnet) -> Vec<IpAddr> {
        let ports = self
            .ports
            .values()
            .flat_map(|(_, p)| p.fixed_ips.iter())
            .filter(|ip| ip.subnet_id == subnet.id)
            .map(|ip| ip.ip_address);
        let gateways = self
            .routers
            .values()
            .filter_map(|(_, r)| r.gateway.as_ref())
            .flat_map(|gw| gw.fixed_ips.iter().copied())
            .filter(|ip| subnet.cidr.contains(ip));
        ports.chain(gateways).collect()
    }

    fn assign_address(&self, subnet: &Subnet) -> Result<IpAddr> {
        let used = self.addresses_in_use(subnet);
        subnet
            .cidr
            .hosts()
            .find(|addr| !used.contains(addr))
            .ok_or_else(|| PlatformError::Conflict(format!("subnet {} is full", subnet.id)))
    }

    fn network_subnets(&self, network: &NetworkId) -> Vec<Subnet> {
        sorted(
            self.subnets
                .values()
                .filter(|(_, s)| s.network_id == *network)
                .cloned(),
        )
    }
}

impl Platform for MemoryPlatform {
    fn create_network(&self, spec: NetworkSpec) -> Result<Network> {
        let mut state = self.state.lock();
        state.fault("create_network")?;
        let (seq, id) = state.next_id("net");
        let network = Network {
            id: NetworkId::new(id),
            tenant_id: spec.tenant_id,
            name: spec.name,
            shared: spec.shared,
        };
        state
            .networks
            .insert(network.id.clone(), (seq, network.clone()));
        Ok(network)
    }

    fn get_network(&self, id: &NetworkId) -> Result<Network> {
        let mut state = self.state.lock();
        state.fault("get_network")?;
        state
            .networks
            .get(id)
            .map(|(_, n)| n.clone())
            .ok_or_else(|| PlatformError::not_found("network", id))
    }

    fn delete_network(&self, id: &NetworkId) -> Result<()> {
        let mut state = self.state.lock();
        state.fault("delete_network")?;
        if !state.networks.contains_key(id) {
            return Err(PlatformError::not_found("network", id));
        }
        if state.subnets.values().any(|(_, s)| s.network_id == *id) {
            return Err(PlatformError::Conflict(format!("network {id} has subnets")));
        }
        state.networks.remove(id);
        Ok(())
    }

    fn create_subnet(&self, spec: SubnetSpec) -> Result<Subnet> {
        let mut state = self.state.lock();
        state.fault("create_subnet")?;
        if !state.networks.contains_key(&spec.network_id) {
            return Err(PlatformError::not_found("network", &spec.network_id));
        }
        let block = spec.cidr.trunc();
        if let Some((_, s)) = state
            .subnets
            .values()
            .find(|(_, s)| s.network_id == spec.network_id && cidr::overlaps(&s.cidr, &block))
        {
            return Err(PlatformError::Conflict(format!(
                "{block} overlaps subnet {} ({})",
                s.id, s.cidr
            )));
        }
        let (seq, id) = state.next_id("subnet");
        let subnet = Subnet {
            id: SubnetId::new(id),
            network_id: spec.network_id,
            tenant_id: spec.tenant_id,
            cidr: block,
        };
        state
            .subnets
            .insert(subnet.id.clone(), (seq, subnet.clone()));
        Ok(subnet)
    }

    fn get_subnet(&self, id: &SubnetId) -> Result<Subnet> {
        let mut state = self.state.lock();
        state.fault("get_subnet")?;
        state
            .subnets
            .get(id)
            .map(|(_, s)| s.clone())
            .ok_or_else(|| PlatformError::not_found("subnet", id))
    }

    fn list_subnets(&self, network: &NetworkId) -> Result<Vec<Subnet>> {
        let mut state = self.state.lock();
        state.fault("list_subnets")?;
        Ok(state.network_subnets(network))
    }

    fn delete_subnet(&self, id: &SubnetId) -> Result<()> {
        let mut state = self.state.lock();
        state.fault("delete_subnet")?;
        if !state.subnets.contains_key(id) {
            return Err(PlatformError::not_found("subnet", id));
        }
        if state
            .ports
            .values()
            .any(|(_, p)| p.fixed_ips.iter().any(|ip| ip.subnet_id == *id))
        {
            return Err(PlatformError::Conflict(format!("subnet {id} has ports")));
        }
        if let Some((_, r)) = state
            .routers
            .values()
            .find(|(_, r)| r.interfaces.contains(id))
        {
            return Err(PlatformError::Conflict(format!(
                "subnet {id} is attached to router {}",
                r.id
            )));
        }
        state.subnets.remove(id);
        Ok(())
    }

    fn create_router(&self, spec: RouterSpec) -> Result<Router> {
        let mut state = self.state.lock();
        state.fault("create_router")?;
        let (seq, id) = state.next_id("router");
        let router = Router {
            id: RouterId::new(id),
            tenant_id: spec.tenant_id,
            name: spec.name,
            gateway: None,
            routes: Vec::new(),
            interfaces: Vec::new(),
        };
        state
            .routers
            .insert(router.id.clone(), (seq, router.clone()));
        Ok(router)
    }

    fn get_router(&self, id: &RouterId) -> Result<Router> {
        let mut state = self.state.lock();
        state.fault("get_router")?;
        state
            .routers
            .get(id)
            .map(|(_, r)| r.clone())
            .ok_or_else(|| PlatformError::not_found("router", id))
    }

    fn delete_router(&self, id: &RouterId) -> Result<()> {
        let mut state = self.state.lock();
        state.fault("delete_router")?;
        let attached = match state.routers.get(id) {
            None => return Err(PlatformError::not_found("router", id)),
            Some((_, r)) => !r.interfaces.is_empty(),
        };
        if attached {
            return Err(PlatformError::Conflict(format!(
                "router {id} has attached interfaces"
            )));
        }
        state.routers.remove(id);
        Ok(())
    }

    fn add_router_interface(&self, router: &RouterId, subnet: &SubnetId) -> Result<()> {
        let mut state = self.state.lock();
        state.fault("add_router_interface")?;
        if !state.subnets.contains_key(subnet) {
            return Err(PlatformError::not_found("subnet", subnet));
        }
        let (_, r) = state
            .routers
            .get_mut(router)
            .ok_or_else(|| PlatformError::not_found("router", router))?;
        if r.interfaces.contains(subnet) {
            return Err(PlatformError::Conflict(format!(
                "subnet {subnet} is already attached to router {router}"
            )));
        }
        r.interfaces.push(subnet.clone());
        Ok(())
    }

    fn remove_router_interface(&self, router: &RouterId, subnet: &SubnetId) -> Result<()> {
        let mut state = self.state.lock();
        state.fault("remove_router_interface")?;
        let (_, r) = state
            .routers
            .get_mut(router)
            .ok_or_else(|| PlatformError::not_found("router", router))?;
        let before = r.interfaces.len();
        r.interfaces.retain(|s| s != subnet);
        if r.interfaces.len() == before {
            return Err(PlatformError::not_found("router interface", subnet));
        }
        Ok(())
    }

    fn set_router_gateway(
        &self,
        router: &RouterId,
        gateway: Option<GatewaySpec>,
    ) -> Result<Option<RouterGateway>> {
        let mut state = self.state.lock();
        state.fault("set_router_gateway")?;
        if !state.routers.contains_key(router) {
            return Err(PlatformError::not_found("router", router));
        }

        let gateway = match gateway {
            None => None,
            Some(GatewaySpec {
                network_id,
                fixed_ips,
            }) => {
                if !state.networks.contains_key(&network_id) {
                    return Err(PlatformError::not_found("network", &network_id));
                }
                let fixed_ips = if fixed_ips.is_empty() {
                    let subnet = state
                        .network_subnets(&network_id)
                        .into_iter()
                        .next()
                        .ok_or_else(|| {
                            PlatformError::Conflict(format!("network {network_id} has no subnets"))
                        })?;
                    vec![state.assign_address(&subnet)?]
                } else {
                    fixed_ips
                };
                Some(RouterGateway {
                    network_id,
                    fixed_ips,
                })
            }
        };

        if let Some((_, r)) = state.routers.get_mut(router) {
            r.gateway = gateway.clone();
        }
        Ok(gateway)
    }

    fn set_router_routes(&self, router: &RouterId, routes: Vec<Route>) -> Result<()> {
        let mut state = self.state.lock();
        state.fault("set_router_routes")?;
        let (_, r) = state
            .routers
            .get_mut(router)
            .ok_or_else(|| PlatformError::not_found("router", router))?;
        r.routes = routes;
        Ok(())
    }

    fn create_port(&self, spec: PortSpec) -> Result<Port> {
        let mut state = self.state.lock();
        state.fault("create_port")?;
        let subnet = state
            .subnets
            .get(&spec.subnet_id)
            .map(|(_, s)| s.clone())
            .ok_or_else(|| PlatformError::not_found("subnet", &spec.subnet_id))?;
        if subnet.network_id != spec.network_id {
            return Err(PlatformError::Conflict(format!(
                "subnet {} is not on network {}",
                subnet.id, spec.network_id
            )));
        }
        let ip_address = state.assign_address(&subnet)?;
        let (seq, id) = state.next_id("port");
        let port = Port {
            id: PortId::new(id),
            network_id: spec.network_id,
            tenant_id: spec.tenant_id,
            fixed_ips: vec![FixedIp {
                subnet_id: subnet.id,
                ip_address,
            }],
            security_groups: Vec::new(),
        };
        state.ports.insert(port.id.clone(), (seq, port.clone()));
        Ok(port)
    }

    fn get_port(&self, id: &PortId) -> Result<Port> {
        let mut state = self.state.lock();
        state.fault("get_port")?;
        state
            .ports
            .get(id)
            .map(|(_, p)| p.clone())
            .ok_or_else(|| PlatformError::not_found("port", id))
    }

    fn delete_port(&self, id: &PortId) -> Result<()> {
        let mut state = self.state.lock();
        state.fault("delete_port")?;
        state
            .ports
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| PlatformError::not_found("port", id))
    }

    fn bind_security_groups(&self, port: &PortId, groups: Vec<SecurityGroupId>) -> Result<()> {
        let mut state = self.state.lock();
        state.fault("bind_security_groups")?;
        if let Some(missing) = groups
            .iter()
            .find(|g| !state.security_groups.contains_key(*g))
        {
            return Err(PlatformError::not_found("security group", missing));
        }
        let (_, p) = state
            .ports
            .get_mut(port)
            .ok_or_else(|| PlatformError::not_found("port", port))?;
        p.security_groups = groups;
        Ok(())
    }

    fn create_security_group(&self, spec: SecurityGroupSpec) -> Result<SecurityGroup> {
        let mut state = self.state.lock();
        state.fault("create_security_group")?;
        let (seq, id) = state.next_id("sg");
        let group = SecurityGroup {
            id: SecurityGroupId::new(id),
            tenant_id: spec.tenant_id,
            name: spec.name,
        };
        state
            .security_groups
            .insert(group.id.clone(), (seq, group.clone()));
        Ok(group)
    }

    fn delete_security_group(&self, id: &SecurityGroupId) -> Result<()> {
        let mut state = self.state.lock();
        state.fault("delete_security_group")?;
        if !state.security_groups.contains_key(id) {
            return Err(PlatformError::not_found("security group", id));
        }
        if let Some((_, p)) = state
            .ports
            .values()
            .find(|(_, p)| p.security_groups.contains(id))
        {
            return Err(PlatformError::Conflict(format!(
                "security group {id} is bound to port {}",
                p.id
            )));
        }
        state.security_groups.remove(id);
        state.rules.retain(|_, (_, r)| r.security_group_id != *id);
        Ok(())
    }

    fn add_security_group_rule(
        &self,
        group: &SecurityGroupId,
        rule: SecurityGroupRule,
    ) -> Result<InstalledRule> {
        let mut state = self.state.lock();
        state.fault("add_security_group_rule")?;
        if !state.security_groups.contains_key(group) {
            return Err(PlatformError::not_found("security group", group));
        }
        if state
            .rules
            .values()
            .any(|(_, r)| r.security_group_id == *group && r.rule == rule)
        {
            return Err(PlatformError::Conflict(format!(
                "security group {group} already has rule {rule:?}"
            )));
        }
        let (seq, id) = state.next_id("sgr");
        let installed = InstalledRule {
            id: SecurityGroupRuleId::new(id),
            security_group_id: group.clone(),
            rule,
        };
        state
            .rules
            .insert(installed.id.clone(), (seq, installed.clone()));
        Ok(installed)
    }

    fn remove_security_group_rule(&self, id: &SecurityGroupRuleId) -> Result<()> {
        let mut state = self.state.lock();
        state.fault("remove_security_group_rule")?;
        state
            .rules
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| PlatformError::not_found("security group rule", id))
    }

    fn list_security_group_rules(&self, group: &SecurityGroupId) -> Result<Vec<InstalledRule>> {
        let mut state = self.state.lock();
        state.fault("list_security_group_rules")?;
        if !state.security_groups.contains_key(group) {
            return Err(PlatformError::not_found("security group", group));
        }
        Ok(sorted(
            state
                .rules
                .values()
                .filter(|(_, r)| r.security_group_id == *group)
                .cloned(),
        ))
    }
}

// === impl MemoryChains ===

impl Default for MemoryChains {
    fn default() -> Self {
        Self {
            state: Default::default(),
            respecify: true,
        }
    }
}

impl MemoryChains {
    pub fn new() -> Self {
        Self::default()
    }

    /// An orchestrator that cannot update instances in place.
    pub fn without_respecify() -> Self {
        Self {
            respecify: false,
            ..Self::default()
        }
    }

    /// Causes the next call of `op` (e.g. `"instantiate"`) to fail.
    pub fn fail_on(&self, op: &'static str) {
        self.fail_after(op, 0);
    }

    pub fn fail_after(&self, op: &'static str, calls: usize) {
        self.state.lock().faults.arm(op, calls);
    }

    pub fn instances(&self) -> Vec<ChainInstance> {
        let state = self.state.lock();
        sorted(state.instances.values().cloned())
    }
}

impl ChainState {
    fn fault(&mut self, op: &'static str) -> Result<(), ChainError> {
        if self.faults.check(op) {
            tracing::debug!(op, "Injected chain failure");
            return Err(ChainError::Failed(format!("{op}: injected failure")));
        }
        Ok(())
    }
}

impl ServiceChains for MemoryChains {
    fn instantiate(&self, request: ChainRequest) -> Result<ChainInstance, ChainError> {
        let mut state = self.state.lock();
        state.fault("instantiate")?;
        state.seq += 1;
        let seq = state.seq;
        let instance = ChainInstance {
            id: ChainInstanceId::new(format!("sci-{seq}")),
            tenant_id: request.tenant_id,
            name: request.name,
            provider_ptg_id: request.provider_ptg_id,
            consumer_ptg_id: request.consumer_ptg_id,
            servicechain_spec: request.servicechain_spec,
        };
        state
            .instances
            .insert(instance.id.clone(), (seq, instance.clone()));
        Ok(instance)
    }

    fn retire(&self, id: &ChainInstanceId) -> Result<(), ChainError> {
        let mut state = self.state.lock();
        state.fault("retire")?;
        state
            .instances
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ChainError::NotFound(id.clone()))
    }

    fn list_instances(&self, filter: &ChainFilter) -> Result<Vec<ChainInstance>, ChainError> {
        let mut state = self.state.lock();
        state.fault("list_instances")?;
        Ok(sorted(
            state
                .instances
                .values()
                .filter(|(_, i)| filter.matches(i))
                .cloned(),
        ))
    }

    fn respecify(&self, id: &ChainInstanceId, spec: &ChainSpecId) -> Result<bool, ChainError> {
        if !self.respecify {
            return Ok(false);
        }
        let mut state = self.state.lock();
        state.fault("respecify")?;
        let (_, instance) = state
            .instances
            .get_mut(id)
            .ok_or_else(|| ChainError::NotFound(id.clone()))?;
        instance.servicechain_spec = spec.clone();
        Ok(true)
    }
}
