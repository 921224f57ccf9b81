use serde::{Deserialize, Serialize};

/// Records whether a referenced object was created on behalf of its owner.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    /// Created by the driver; released with the owning policy object.
    Implicit,

    /// Supplied by the caller; never released by the driver.
    Explicit,
}

/// A reference to a sub-object along with its ownership.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Owned<T> {
    pub id: T,
    pub ownership: Ownership,
}

// === impl Owned ===

impl<T> Owned<T> {
    pub fn implicit(id: T) -> Self {
        Self {
            id,
            ownership: Ownership::Implicit,
        }
    }

    pub fn explicit(id: T) -> Self {
        Self {
            id,
            ownership: Ownership::Explicit,
        }
    }

    pub fn is_implicit(&self) -> bool {
        self.ownership == Ownership::Implicit
    }
}
