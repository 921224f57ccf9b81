use grouppolicy_core::{
    chain::ChainError,
    platform::PlatformError,
    policy::ResourceKind,
    ExternalSegmentId, IpNet, L2PolicyId, L3PolicyId, NetworkId, PolicyTargetGroupId, PortId,
    RouterId, SubnetId, TenantId,
};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error handling a lifecycle event. No derived state survives a failed event.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    // === Policy targets ===
    #[error("a policy target must reference a policy target group")]
    PolicyTargetRequiresPolicyTargetGroup,

    #[error("port {port} has no address on a subnet of policy target group {group}")]
    InvalidPortForPTG {
        port: PortId,
        group: PolicyTargetGroupId,
    },

    #[error("port {0} does not exist")]
    ReferencedPortNotFound(PortId),

    #[error("the policy target group of a policy target cannot be changed")]
    PolicyTargetGroupUpdateOfPolicyTargetNotSupported,

    #[error("the port of a policy target cannot be changed")]
    PolicyTargetPortUpdateNotSupported,

    // === Policy target groups ===
    #[error("subnets cannot be removed from policy target group {0}")]
    PolicyTargetGroupSubnetRemovalNotSupported(PolicyTargetGroupId),

    #[error("subnet {subnet} is not on network {network}")]
    InvalidSubnetForPTG { subnet: SubnetId, network: NetworkId },

    #[error("the L2 policy of a policy target group cannot be changed")]
    L2PolicyUpdateOfPolicyTargetGroupNotSupported,

    #[error("policy target group {group} in tenant {tenant} cannot use L2 policy {l2_policy}")]
    CrossTenantPolicyTargetGroupL2PolicyNotSupported {
        group: PolicyTargetGroupId,
        tenant: TenantId,
        l2_policy: L2PolicyId,
    },

    #[error("policy target group {0} has policy targets")]
    PolicyTargetGroupInUse(PolicyTargetGroupId),

    // === L2 policies ===
    #[error("L2 policy {l2_policy} in tenant {tenant} cannot use L3 policy {l3_policy}")]
    CrossTenantL2PolicyL3PolicyNotSupported {
        l2_policy: L2PolicyId,
        tenant: TenantId,
        l3_policy: L3PolicyId,
    },

    #[error("shared L2 policy {l2_policy} cannot use non-shared network {network}")]
    NonSharedNetworkOnSharedL2PolicyNotSupported {
        l2_policy: L2PolicyId,
        network: NetworkId,
    },

    #[error("the L3 policy of an L2 policy cannot be changed")]
    L3PolicyUpdateOfL2PolicyNotSupported,

    #[error("the network of an L2 policy cannot be changed")]
    L2PolicyNetworkUpdateNotSupported,

    #[error("L2 policy {0} has policy target groups")]
    L2PolicyInUse(L2PolicyId),

    // === L3 policies ===
    #[error("the routers of an L3 policy cannot be changed")]
    L3PolicyRoutersUpdateNotSupported,

    #[error("an L3 policy may have at most one router")]
    L3PolicyMultipleRoutersNotSupported,

    #[error("an L3 policy may have at most one external segment")]
    MultipleESPerL3PolicyNotSupported,

    #[error("the address pool of an L3 policy cannot be changed")]
    L3PolicyIpPoolUpdateNotSupported,

    #[error("subnet prefix length /{prefix_len} does not fit in pool {pool}")]
    InvalidSubnetPrefixLength { pool: IpNet, prefix_len: u8 },

    #[error("pool {pool} overlaps pool {existing} of L3 policy {l3_policy}")]
    OverlappingIPPoolsInSameTenant {
        pool: IpNet,
        existing: IpNet,
        l3_policy: L3PolicyId,
    },

    #[error("pool {pool} has no free /{prefix_len} block")]
    AddressPoolExhausted { pool: IpNet, prefix_len: u8 },

    #[error("router {router} is already attached to external segment {segment}")]
    MultipleExternalSegmentsPerRouter {
        router: RouterId,
        segment: ExternalSegmentId,
    },

    #[error("L3 policy {0} has L2 policies")]
    L3PolicyInUse(L3PolicyId),

    // === External segments and policies ===
    #[error("the {0} of an external segment cannot be changed")]
    InvalidAttributeUpdateForES(&'static str),

    #[error("an external segment requires an explicit subnet")]
    ImplicitSubnetNotSupported,

    #[error("external segment {0} is in use")]
    ExternalSegmentInUse(ExternalSegmentId),

    #[error("an external policy requires an external segment")]
    ESIdRequiredWhenCreatingEP,

    #[error("an external policy may have at most one external segment")]
    MultipleESPerEPNotSupported,

    #[error("the external segments of an external policy cannot be changed")]
    ESUpdateNotSupportedForEP,

    #[error("tenant {0} already has an external policy")]
    OnlyOneEPPerTenantAllowed(TenantId),

    #[error("{0} cannot be shared")]
    InvalidSharedResource(ResourceKind),

    // === Contracts ===
    #[error("policy rule set {0} is in use")]
    PolicyRuleSetInUse(String),

    #[error("policy rule {0} is in use")]
    PolicyRuleInUse(String),

    #[error("policy classifier {0} is in use")]
    PolicyClassifierInUse(String),

    #[error("policy action {0} is in use")]
    PolicyActionInUse(String),

    #[error("a redirect action requires a chain specification")]
    RedirectActionRequiresChainSpec,

    // === Referential integrity ===
    #[error("{kind} {id} does not exist")]
    ReferencedPolicyObjectNotFound { kind: ResourceKind, id: String },

    #[error("subnet {0} does not exist")]
    ReferencedSubnetNotFound(SubnetId),

    #[error("network {0} does not exist")]
    ReferencedNetworkNotFound(NetworkId),

    #[error("router {0} does not exist")]
    ReferencedRouterNotFound(RouterId),

    #[error("update of {0} does not match its prior state")]
    MismatchedUpdate(String),

    // === Collaborators ===
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// The broad categories of [`Error`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// An invariant of the policy model was violated. Nothing was changed.
    Validation,

    /// The requested addresses are not available. Nothing was changed.
    Exhausted,

    /// The platform or chain orchestrator failed. Partial changes were unwound.
    Collaborator,

    /// A reference that should exist did not, indicating the caller and platform disagree.
    Internal,
}

// === impl Error ===

impl Error {
    pub(crate) fn not_found(kind: ResourceKind, id: impl ToString) -> Self {
        Self::ReferencedPolicyObjectNotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// The error's canonical name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PolicyTargetRequiresPolicyTargetGroup => "PolicyTargetRequiresPolicyTargetGroup",
            Self::InvalidPortForPTG { .. } => "InvalidPortForPTG",
            Self::ReferencedPortNotFound(_) => "ReferencedPortNotFound",
            Self::PolicyTargetGroupUpdateOfPolicyTargetNotSupported => {
                "PolicyTargetGroupUpdateOfPolicyTargetNotSupported"
            }
            Self::PolicyTargetPortUpdateNotSupported => "PolicyTargetPortUpdateNotSupported",
            Self::PolicyTargetGroupSubnetRemovalNotSupported(_) => {
                "PolicyTargetGroupSubnetRemovalNotSupported"
            }
            Self::InvalidSubnetForPTG { .. } => "InvalidSubnetForPTG",
            Self::L2PolicyUpdateOfPolicyTargetGroupNotSupported => {
                "L2PolicyUpdateOfPolicyTargetGroupNotSupported"
            }
            Self::CrossTenantPolicyTargetGroupL2PolicyNotSupported { .. } => {
                "CrossTenantPolicyTargetGroupL2PolicyNotSupported"
            }
            Self::PolicyTargetGroupInUse(_) => "PolicyTargetGroupInUse",
            Self::CrossTenantL2PolicyL3PolicyNotSupported { .. } => {
                "CrossTenantL2PolicyL3PolicyNotSupported"
            }
            Self::NonSharedNetworkOnSharedL2PolicyNotSupported { .. } => {
                "NonSharedNetworkOnSharedL2PolicyNotSupported"
            }
            Self::L3PolicyUpdateOfL2PolicyNotSupported => "L3PolicyUpdateOfL2PolicyNotSupported",
            Self::L2PolicyNetworkUpdateNotSupported => "L2PolicyNetworkUpdateNotSupported",
            Self::L2PolicyInUse(_) => "L2PolicyInUse",
            Self::L3PolicyRoutersUpdateNotSupported => "L3PolicyRoutersUpdateNotSupported",
            Self::L3PolicyMultipleRoutersNotSupported => "L3PolicyMultipleRoutersNotSupported",
            Self::MultipleESPerL3PolicyNotSupported => "MultipleESPerL3PolicyNotSupported",
            Self::L3PolicyIpPoolUpdateNotSupported => "L3PolicyIpPoolUpdateNotSupported",
            Self::InvalidSubnetPrefixLength { .. } => "InvalidSubnetPrefixLength",
            Self::OverlappingIPPoolsInSameTenant { .. } => "OverlappingIPPoolsInSameTenant",
            Self::AddressPoolExhausted { .. } => "AddressPoolExhausted",
            Self::MultipleExternalSegmentsPerRouter { .. } => "MultipleExternalSegmentsPerRouter",
            Self::L3PolicyInUse(_) => "L3PolicyInUse",
            Self::InvalidAttributeUpdateForES(_) => "InvalidAttributeUpdateForES",
            Self::ImplicitSubnetNotSupported => "ImplicitSubnetNotSupported",
            Self::ExternalSegmentInUse(_) => "ExternalSegmentInUse",
            Self::ESIdRequiredWhenCreatingEP => "ESIdRequiredWhenCreatingEP",
            Self::MultipleESPerEPNotSupported => "MultipleESPerEPNotSupported",
            Self::ESUpdateNotSupportedForEP => "ESUpdateNotSupportedForEP",
            Self::OnlyOneEPPerTenantAllowed(_) => "OnlyOneEPPerTenantAllowed",
            Self::InvalidSharedResource(_) => "InvalidSharedResource",
            Self::PolicyRuleSetInUse(_) => "PolicyRuleSetInUse",
            Self::PolicyRuleInUse(_) => "PolicyRuleInUse",
            Self::PolicyClassifierInUse(_) => "PolicyClassifierInUse",
            Self::PolicyActionInUse(_) => "PolicyActionInUse",
            Self::RedirectActionRequiresChainSpec => "RedirectActionRequiresChainSpec",
            Self::ReferencedPolicyObjectNotFound { .. } => "ReferencedPolicyObjectNotFound",
            Self::ReferencedSubnetNotFound(_) => "ReferencedSubnetNotFound",
            Self::ReferencedNetworkNotFound(_) => "ReferencedNetworkNotFound",
            Self::ReferencedRouterNotFound(_) => "ReferencedRouterNotFound",
            Self::MismatchedUpdate(_) => "MismatchedUpdate",
            Self::Platform(_) => "PlatformFailure",
            Self::Chain(_) => "ChainFailure",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::OverlappingIPPoolsInSameTenant { .. } | Self::AddressPoolExhausted { .. } => {
                ErrorClass::Exhausted
            }

            Self::Platform(_) | Self::Chain(_) => ErrorClass::Collaborator,

            Self::ReferencedPortNotFound(_)
            | Self::ReferencedPolicyObjectNotFound { .. }
            | Self::ReferencedSubnetNotFound(_)
            | Self::ReferencedNetworkNotFound(_)
            | Self::ReferencedRouterNotFound(_)
            | Self::MismatchedUpdate(_) => ErrorClass::Internal,

            _ => ErrorClass::Validation,
        }
    }

    /// True if the error reports an object the collaborator no longer has.
    pub(crate) fn is_not_found(&self) -> bool {
        match self {
            Self::Platform(error) => error.is_not_found(),
            Self::Chain(error) => matches!(error, ChainError::NotFound(_)),
            _ => false,
        }
    }
}

// === impl ErrorClass ===

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Exhausted => "exhausted",
            Self::Collaborator => "collaborator",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}
