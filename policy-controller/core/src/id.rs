use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! ids {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(String);

            impl $name {
                pub fn new(id: impl Into<String>) -> Self {
                    Self(id.into())
                }

                /// Mints a new random identifier.
                pub fn generate() -> Self {
                    Self(uuid::Uuid::new_v4().to_string())
                }

                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    self.0.fmt(f)
                }
            }

            impl From<&str> for $name {
                fn from(id: &str) -> Self {
                    Self(id.to_string())
                }
            }

            impl From<String> for $name {
                fn from(id: String) -> Self {
                    Self(id)
                }
            }
        )+
    };
}

ids! {
    /// The owner of a policy object.
    TenantId,
    L3PolicyId,
    L2PolicyId,
    PolicyTargetGroupId,
    PolicyTargetId,
    PolicyClassifierId,
    PolicyActionId,
    PolicyRuleId,
    PolicyRuleSetId,
    ExternalSegmentId,
    ExternalPolicyId,

    // Platform primitives.
    NetworkId,
    SubnetId,
    RouterId,
    PortId,
    SecurityGroupId,
    SecurityGroupRuleId,

    // Service chains.
    ChainSpecId,
    ChainInstanceId,
}
