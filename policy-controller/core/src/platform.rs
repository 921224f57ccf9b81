//! The network platform's primitives.

use crate::{
    policy::{PortRange, Protocol},
    NetworkId, PortId, RouterId, SecurityGroupId, SecurityGroupRuleId, SubnetId, TenantId,
};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;

pub type Result<T, E = PlatformError> = std::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("platform operation failed: {0}")]
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: NetworkId,
    pub tenant_id: TenantId,
    pub name: String,
    pub shared: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: SubnetId,
    pub network_id: NetworkId,
    pub tenant_id: TenantId,
    pub cidr: IpNet,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterGateway {
    pub network_id: NetworkId,
    pub fixed_ips: Vec<IpAddr>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    pub destination: IpNet,
    pub nexthop: IpAddr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub id: RouterId,
    pub tenant_id: TenantId,
    pub name: String,
    pub gateway: Option<RouterGateway>,
    pub routes: Vec<Route>,
    pub interfaces: Vec<SubnetId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedIp {
    pub subnet_id: SubnetId,
    pub ip_address: IpAddr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    pub network_id: NetworkId,
    pub tenant_id: TenantId,
    pub fixed_ips: Vec<FixedIp>,
    pub security_groups: Vec<SecurityGroupId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: SecurityGroupId,
    pub tenant_id: TenantId,
    pub name: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDirection {
    Ingress,
    Egress,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Ethertype {
    #[serde(rename = "IPv4")]
    Ipv4,
    #[serde(rename = "IPv6")]
    Ipv6,
}

/// The peer a security-group rule admits.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Remote {
    Cidr(IpNet),
    Group(SecurityGroupId),
}

/// A single allow rule. Two rules with equal fields are the same rule.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    pub direction: RuleDirection,
    pub ethertype: Ethertype,
    pub protocol: Option<Protocol>,
    pub port_range: Option<PortRange>,
    pub remote: Remote,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledRule {
    pub id: SecurityGroupRuleId,
    pub security_group_id: SecurityGroupId,
    pub rule: SecurityGroupRule,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkSpec {
    pub tenant_id: TenantId,
    pub name: String,
    pub shared: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubnetSpec {
    pub tenant_id: TenantId,
    pub network_id: NetworkId,
    pub name: String,
    pub cidr: IpNet,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouterSpec {
    pub tenant_id: TenantId,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSpec {
    pub tenant_id: TenantId,
    pub network_id: NetworkId,
    pub subnet_id: SubnetId,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityGroupSpec {
    pub tenant_id: TenantId,
    pub name: String,
}

/// Attaches a router to an external network.
///
/// When `fixed_ips` is empty the platform assigns an address on the network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewaySpec {
    pub network_id: NetworkId,
    pub fixed_ips: Vec<IpAddr>,
}

/// Networks, subnets, routers, ports and security groups.
///
/// Every operation either completes or fails with no effect.
pub trait Platform: Send + Sync {
    fn create_network(&self, spec: NetworkSpec) -> Result<Network>;
    fn get_network(&self, id: &NetworkId) -> Result<Network>;
    fn delete_network(&self, id: &NetworkId) -> Result<()>;

    fn create_subnet(&self, spec: SubnetSpec) -> Result<Subnet>;
    fn get_subnet(&self, id: &SubnetId) -> Result<Subnet>;
    fn list_subnets(&self, network: &NetworkId) -> Result<Vec<Subnet>>;
    fn delete_subnet(&self, id: &SubnetId) -> Result<()>;

    fn create_router(&self, spec: RouterSpec) -> Result<Router>;
    fn get_router(&self, id: &RouterId) -> Result<Router>;
    fn delete_router(&self, id: &RouterId) -> Result<()>;
    fn add_router_interface(&self, router: &RouterId, subnet: &SubnetId) -> Result<()>;
    fn remove_router_interface(&self, router: &RouterId, subnet: &SubnetId) -> Result<()>;

    /// Sets or clears the router's external gateway, returning the resulting gateway.
    fn set_router_gateway(
        &self,
        router: &RouterId,
        gateway: Option<GatewaySpec>,
    ) -> Result<Option<RouterGateway>>;

    /// Replaces the router's static routes.
    fn set_router_routes(&self, router: &RouterId, routes: Vec<Route>) -> Result<()>;

    fn create_port(&self, spec: PortSpec) -> Result<Port>;
    fn get_port(&self, id: &PortId) -> Result<Port>;
    fn delete_port(&self, id: &PortId) -> Result<()>;

    /// Replaces the port's security groups.
    fn bind_security_groups(&self, port: &PortId, groups: Vec<SecurityGroupId>) -> Result<()>;

    fn create_security_group(&self, spec: SecurityGroupSpec) -> Result<SecurityGroup>;
    fn delete_security_group(&self, id: &SecurityGroupId) -> Result<()>;
    fn add_security_group_rule(
        &self,
        group: &SecurityGroupId,
        rule: SecurityGroupRule,
    ) -> Result<InstalledRule>;
    fn remove_security_group_rule(&self, id: &SecurityGroupRuleId) -> Result<()>;
    fn list_security_group_rules(&self, group: &SecurityGroupId) -> Result<Vec<InstalledRule>>;
}

// === impl PlatformError ===

impl PlatformError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

// === impl Ethertype ===

impl Ethertype {
    pub fn of(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => Self::Ipv4,
            IpNet::V6(_) => Self::Ipv6,
        }
    }
}
