//! Group-policy data model and collaborator interfaces.
//!
//! This crate describes the declarative policy objects (groups, contracts,
//! L2/L3 policies, external connectivity) consumed by the resource-mapping
//! engine, and the two collaborators the engine drives:
//!
//! - a [`platform::Platform`] providing networks, subnets, routers, ports and
//!   security groups;
//! - a [`chain::ServiceChains`] orchestrator instantiating service chains.
//!
//! In-memory implementations of both live in [`memory`].

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod chain;
pub mod cidr;
mod id;
pub mod memory;
mod owned;
pub mod platform;
pub mod policy;

pub use self::{
    id::*,
    owned::{Owned, Ownership},
};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};
