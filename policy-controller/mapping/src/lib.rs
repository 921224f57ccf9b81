//! Resource mapping for group policy.
//!
//! The [`Driver`] receives lifecycle events for every policy object, derives the platform
//! primitives that implement them (networks, subnets, routers, ports, security groups and their
//! rules) and triggers service chains for redirecting contracts. Every event is applied
//! atomically: when any step fails, the primitives already created for that event are removed
//! before the error is returned.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod allocator;
mod driver;
mod error;
mod index;
pub mod metrics;
mod redirect;
mod relation;
mod rules;
mod security;
mod txn;


pub use self::{
    driver::{Driver, Event, Op},
    error::{Error, ErrorClass, Result},
    metrics::DriverMetrics,
    redirect::{ChainKey, ChainState, Transition},
    security::{RuleEntries, SecurityGroupMapping},
};
use grouppolicy_core::{IpNet, Ipv4Net};
use std::net::Ipv4Addr;

/// Parameters for objects the driver creates on a tenant's behalf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// The address pool of a tenant's default L3 policy.
    pub default_ip_pool: IpNet,

    /// The prefix length of subnets carved from a default L3 policy.
    pub default_subnet_prefix_length: u8,

    pub default_l3_policy_name: String,

    /// L3 policies created without external segments are attached to the visible segment with
    /// this name, if one exists.
    pub default_external_segment_name: String,
}

impl Config {
    /// Fails with [`Error::InvalidSubnetPrefixLength`] when subnets of the default prefix length
    /// cannot be carved from the default pool.
    pub fn validate(&self) -> Result<()> {
        allocator::check_prefix_length(&self.default_ip_pool, self.default_subnet_prefix_length)
    }
}

impl Default for Config {
    fn default() -> Self {
        let pool =
            Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 8).expect("prefix length must be valid");
        Self {
            default_ip_pool: pool.into(),
            default_subnet_prefix_length: 24,
            default_l3_policy_name: "default".to_string(),
            default_external_segment_name: "default".to_string(),
        }
    }
}
