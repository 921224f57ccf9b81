//! Policy objects, as supplied by the policy API layer.
//!
//! Fields marked as derived are filled in by the resource-mapping driver and returned to the
//! caller to be persisted.

use crate::{
    ChainSpecId, ExternalPolicyId, ExternalSegmentId, L2PolicyId, L3PolicyId, NetworkId,
    PolicyActionId, PolicyClassifierId, PolicyRuleId, PolicyRuleSetId, PolicyTargetGroupId,
    PolicyTargetId, PortId, RouterId, SubnetId, TenantId,
};
use ipnet::IpNet;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{collections::BTreeMap, fmt, net::IpAddr, str::FromStr};
use thiserror::Error;

pub const DEFAULT_SUBNET_PREFIX_LENGTH: u8 = 24;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct L3Policy {
    pub id: L3PolicyId,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub name: String,
    pub ip_pool: IpNet,
    #[serde(default = "default_subnet_prefix_length")]
    pub subnet_prefix_length: u8,

    /// At most one router. Derived when not supplied.
    #[serde(default)]
    pub routers: Vec<RouterId>,

    /// External segments mapped to the router's addresses on each segment. An empty address list
    /// requests platform-assigned addresses, which are written back.
    #[serde(default)]
    pub external_segments: BTreeMap<ExternalSegmentId, Vec<IpAddr>>,

    #[serde(default)]
    pub shared: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct L2Policy {
    pub id: L2PolicyId,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub name: String,

    /// Derived (the tenant's default L3 policy) when not supplied.
    #[serde(default)]
    pub l3_policy_id: Option<L3PolicyId>,

    /// Derived when not supplied.
    #[serde(default)]
    pub network_id: Option<NetworkId>,

    #[serde(default)]
    pub shared: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTargetGroup {
    pub id: PolicyTargetGroupId,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub name: String,

    /// Derived (an implicit L2 policy) when not supplied.
    #[serde(default)]
    pub l2_policy_id: Option<L2PolicyId>,

    /// Derived (one subnet carved from the L3 policy's pool) when empty.
    #[serde(default)]
    pub subnets: Vec<SubnetId>,

    #[serde(default)]
    pub provided_policy_rule_sets: Vec<PolicyRuleSetId>,

    #[serde(default)]
    pub consumed_policy_rule_sets: Vec<PolicyRuleSetId>,

    #[serde(default)]
    pub shared: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTarget {
    pub id: PolicyTargetId,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub policy_target_group_id: Option<PolicyTargetGroupId>,

    /// Derived when not supplied.
    #[serde(default)]
    pub port_id: Option<PortId>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "in")]
    In,
    #[serde(rename = "out")]
    Out,
    #[default]
    #[serde(rename = "bi")]
    Bidirectional,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

/// An inclusive range of transport ports.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyClassifier {
    pub id: PolicyClassifierId,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub port_range: Option<PortRange>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub shared: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    #[default]
    Allow,
    Redirect,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyAction {
    pub id: PolicyActionId,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub action_type: ActionType,

    /// The chain specification of a redirect action.
    #[serde(default)]
    pub action_value: Option<ChainSpecId>,

    #[serde(default)]
    pub shared: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: PolicyRuleId,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub name: String,
    pub policy_classifier_id: PolicyClassifierId,
    #[serde(default)]
    pub policy_actions: Vec<PolicyActionId>,
    #[serde(default)]
    pub shared: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRuleSet {
    pub id: PolicyRuleSetId,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub policy_rules: Vec<PolicyRuleId>,
    #[serde(default)]
    pub shared: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRoute {
    pub destination: IpNet,
    #[serde(default)]
    pub nexthop: Option<IpAddr>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSegment {
    pub id: ExternalSegmentId,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub name: String,

    /// The segment's address block. Required.
    #[serde(default)]
    pub subnet_id: Option<SubnetId>,

    /// Derived from the subnet.
    #[serde(default)]
    pub cidr: Option<IpNet>,

    /// Derived from the subnet.
    #[serde(default)]
    pub network_id: Option<NetworkId>,

    #[serde(default)]
    pub external_routes: Vec<ExternalRoute>,

    #[serde(default)]
    pub port_address_translation: bool,

    #[serde(default)]
    pub shared: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalPolicy {
    pub id: ExternalPolicyId,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub external_segments: Vec<ExternalSegmentId>,
    #[serde(default)]
    pub provided_policy_rule_sets: Vec<PolicyRuleSetId>,
    #[serde(default)]
    pub consumed_policy_rule_sets: Vec<PolicyRuleSetId>,
    #[serde(default)]
    pub shared: bool,
}

/// Any policy object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    L3Policy(L3Policy),
    L2Policy(L2Policy),
    PolicyTargetGroup(PolicyTargetGroup),
    PolicyTarget(PolicyTarget),
    PolicyClassifier(PolicyClassifier),
    PolicyAction(PolicyAction),
    PolicyRule(PolicyRule),
    PolicyRuleSet(PolicyRuleSet),
    ExternalSegment(ExternalSegment),
    ExternalPolicy(ExternalPolicy),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    L3Policy,
    L2Policy,
    PolicyTargetGroup,
    PolicyTarget,
    PolicyClassifier,
    PolicyAction,
    PolicyRule,
    PolicyRuleSet,
    ExternalSegment,
    ExternalPolicy,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unsupported protocol: {0}")]
    Protocol(String),

    #[error("invalid port range: {0}")]
    PortRange(String),
}

fn default_subnet_prefix_length() -> u8 {
    DEFAULT_SUBNET_PREFIX_LENGTH
}

// === impl Protocol ===

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        }
    }
}

impl FromStr for Protocol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            _ => Err(ParseError::Protocol(s.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl Serialize for Protocol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// === impl PortRange ===

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            min: port,
            max: port,
        }
    }
}

/// Parses either a single port (`"22"`) or an inclusive range (`"50:100"`).
impl FromStr for PortRange {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::PortRange(s.to_string());
        let (min, max) = match s.split_once(':') {
            Some((min, max)) => (min.trim(), max.trim()),
            None => (s.trim(), s.trim()),
        };
        let min = min.parse::<u16>().map_err(|_| invalid())?;
        let max = max.parse::<u16>().map_err(|_| invalid())?;
        if min > max {
            return Err(invalid());
        }
        Ok(Self { min, max })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}:{}", self.min, self.max)
        }
    }
}

impl Serialize for PortRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PortRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// === impl PolicyAction ===

impl PolicyAction {
    pub fn redirect_spec(&self) -> Option<&ChainSpecId> {
        match self.action_type {
            ActionType::Redirect => self.action_value.as_ref(),
            ActionType::Allow => None,
        }
    }
}

// === impl Resource ===

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::L3Policy(_) => ResourceKind::L3Policy,
            Self::L2Policy(_) => ResourceKind::L2Policy,
            Self::PolicyTargetGroup(_) => ResourceKind::PolicyTargetGroup,
            Self::PolicyTarget(_) => ResourceKind::PolicyTarget,
            Self::PolicyClassifier(_) => ResourceKind::PolicyClassifier,
            Self::PolicyAction(_) => ResourceKind::PolicyAction,
            Self::PolicyRule(_) => ResourceKind::PolicyRule,
            Self::PolicyRuleSet(_) => ResourceKind::PolicyRuleSet,
            Self::ExternalSegment(_) => ResourceKind::ExternalSegment,
            Self::ExternalPolicy(_) => ResourceKind::ExternalPolicy,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::L3Policy(r) => r.id.as_str(),
            Self::L2Policy(r) => r.id.as_str(),
            Self::PolicyTargetGroup(r) => r.id.as_str(),
            Self::PolicyTarget(r) => r.id.as_str(),
            Self::PolicyClassifier(r) => r.id.as_str(),
            Self::PolicyAction(r) => r.id.as_str(),
            Self::PolicyRule(r) => r.id.as_str(),
            Self::PolicyRuleSet(r) => r.id.as_str(),
            Self::ExternalSegment(r) => r.id.as_str(),
            Self::ExternalPolicy(r) => r.id.as_str(),
        }
    }
}

// === impl ResourceKind ===

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::L3Policy => "l3_policy",
            Self::L2Policy => "l2_policy",
            Self::PolicyTargetGroup => "policy_target_group",
            Self::PolicyTarget => "policy_target",
            Self::PolicyClassifier => "policy_classifier",
            Self::PolicyAction => "policy_action",
            Self::PolicyRule => "policy_rule",
            Self::PolicyRuleSet => "policy_rule_set",
            Self::ExternalSegment => "external_segment",
            Self::ExternalPolicy => "external_policy",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}
