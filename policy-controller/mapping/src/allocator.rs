//! Allocation of networks, subnets and routers, and external segment attachment.

use crate::{
    error::{Error, Result},
    index::{Index, RouterAttachment, SegmentState},
    txn::{Primitive, Txn},
};
use grouppolicy_core::{
    cidr,
    platform::{GatewaySpec, NetworkSpec, Route, RouterSpec, SubnetSpec},
    policy::{L2Policy, L3Policy},
    ExternalSegmentId, IpNet, L3PolicyId, NetworkId, Owned, RouterId, SubnetId, TenantId,
};
use std::net::IpAddr;

/// Subnets must be strictly smaller than their pool.
pub(crate) fn check_prefix_length(pool: &IpNet, prefix_len: u8) -> Result<()> {
    if prefix_len <= pool.prefix_len() || prefix_len > pool.max_prefix_len() {
        return Err(Error::InvalidSubnetPrefixLength {
            pool: *pool,
            prefix_len,
        });
    }
    Ok(())
}

/// Fails if `l3p`'s pool intersects the pool of another L3 policy in the same tenant.
pub(crate) fn check_pool_overlap(index: &Index, l3p: &L3Policy) -> Result<()> {
    let conflict = index
        .l3_policies
        .values()
        .map(|s| &s.policy)
        .filter(|other| other.id != l3p.id && other.tenant_id == l3p.tenant_id)
        .filter(|other| cidr::overlaps(&other.ip_pool, &l3p.ip_pool))
        .min_by(|a, b| a.id.cmp(&b.id));
    match conflict {
        Some(existing) => Err(Error::OverlappingIPPoolsInSameTenant {
            pool: l3p.ip_pool,
            existing: existing.ip_pool,
            l3_policy: existing.id.clone(),
        }),
        None => Ok(()),
    }
}

pub(crate) fn allocate_router(txn: &mut Txn<'_>, l3p: &L3Policy) -> Result<Owned<RouterId>> {
    match l3p.routers.as_slice() {
        [] => {
            let router = txn.create_router(RouterSpec {
                tenant_id: l3p.tenant_id.clone(),
                name: format!("l3p_{}", display_name(&l3p.name, l3p.id.as_str())),
            })?;
            Ok(Owned::implicit(router.id))
        }
        [id] => {
            let router = txn.platform().get_router(id).map_err(|error| {
                if error.is_not_found() {
                    Error::ReferencedRouterNotFound(id.clone())
                } else {
                    error.into()
                }
            })?;
            Ok(Owned::explicit(router.id))
        }
        _ => Err(Error::L3PolicyMultipleRoutersNotSupported),
    }
}

pub(crate) fn allocate_network(txn: &mut Txn<'_>, l2p: &L2Policy) -> Result<Owned<NetworkId>> {
    let Some(id) = &l2p.network_id else {
        let network = txn.create_network(NetworkSpec {
            tenant_id: l2p.tenant_id.clone(),
            name: format!("l2p_{}", display_name(&l2p.name, l2p.id.as_str())),
            shared: l2p.shared,
        })?;
        return Ok(Owned::implicit(network.id));
    };

    let network = txn.platform().get_network(id).map_err(|error| {
        if error.is_not_found() {
            Error::ReferencedNetworkNotFound(id.clone())
        } else {
            error.into()
        }
    })?;
    if l2p.shared && !network.shared {
        return Err(Error::NonSharedNetworkOnSharedL2PolicyNotSupported {
            l2_policy: l2p.id.clone(),
            network: network.id,
        });
    }
    Ok(Owned::explicit(network.id))
}

/// Carves a subnet for `network` from an L3 policy's pool.
///
/// The block is the lowest one that overlaps no subnet on any network under the L3 policy.
pub(crate) fn allocate_subnet(
    index: &Index,
    txn: &mut Txn<'_>,
    l3p: &L3Policy,
    network: &NetworkId,
    tenant_id: &TenantId,
    name: &str,
) -> Result<(Owned<SubnetId>, IpNet)> {
    let mut networks = index.l3_policy_networks(&l3p.id);
    if !networks.contains(network) {
        networks.push(network.clone());
    }
    let mut exclude = Vec::new();
    for network in &networks {
        for subnet in txn.platform().list_subnets(network)? {
            exclude.push(subnet.cidr);
        }
    }

    let block = first_free_block(&l3p.ip_pool, l3p.subnet_prefix_length, &exclude).ok_or(
        Error::AddressPoolExhausted {
            pool: l3p.ip_pool,
            prefix_len: l3p.subnet_prefix_length,
        },
    )?;
    let subnet = txn.create_subnet(SubnetSpec {
        tenant_id: tenant_id.clone(),
        network_id: network.clone(),
        name: format!("ptg_{name}"),
        cidr: block,
    })?;
    Ok((Owned::implicit(subnet.id), subnet.cidr))
}

/// The lowest `prefix_len` block of `pool` that overlaps nothing in `exclude`.
pub(crate) fn first_free_block(pool: &IpNet, prefix_len: u8, exclude: &[IpNet]) -> Option<IpNet> {
    pool.trunc()
        .subnets(prefix_len)
        .ok()?
        .find(|block| !exclude.iter().any(|used| cidr::overlaps(block, used)))
}

/// Schedules an implicitly created object for deletion. Explicit objects are left alone.
pub(crate) fn release_if_owned<T>(txn: &mut Txn<'_>, owned: Owned<T>)
where
    Primitive: From<T>,
{
    if owned.is_implicit() {
        txn.release(owned.id.into());
    }
}

/// The routes a segment installs on attached routers.
///
/// Routes without a next-hop only declare reachability.
pub(crate) fn routes_for(segment: &SegmentState) -> Vec<Route> {
    segment
        .policy
        .external_routes
        .iter()
        .filter_map(|route| {
            Some(Route {
                destination: route.destination,
                nexthop: route.nexthop?,
            })
        })
        .collect()
}

/// Attaches an L3 policy's router to a segment, returning the router's addresses on it.
///
/// A router already attached to the segment by another L3 policy keeps its gateway unless
/// explicit addresses are requested.
pub(crate) fn attach_segment(
    index: &mut Index,
    txn: &mut Txn<'_>,
    l3p: &L3PolicyId,
    router: &RouterId,
    segment_id: &ExternalSegmentId,
    fixed_ips: &[IpAddr],
) -> Result<Vec<IpAddr>> {
    let segment = index.segment(segment_id)?.clone();

    if let Some(attachment) = index.router_segments.get(router) {
        let others = attachment.l3_policies.iter().any(|id| id != l3p);
        if attachment.segment != *segment_id && others {
            return Err(Error::MultipleExternalSegmentsPerRouter {
                router: router.clone(),
                segment: attachment.segment.clone(),
            });
        }
        if attachment.segment == *segment_id && others && fixed_ips.is_empty() {
            let current = txn
                .platform()
                .get_router(router)?
                .gateway
                .map(|gw| gw.fixed_ips)
                .unwrap_or_default();
            if let Some(attachment) = index.router_segments.get_mut(router) {
                attachment.l3_policies.insert(l3p.clone());
            }
            return Ok(current);
        }
    }

    let gateway = txn.set_router_gateway(
        router,
        Some(GatewaySpec {
            network_id: segment.network_id.clone(),
            fixed_ips: fixed_ips.to_vec(),
        }),
    )?;
    txn.set_router_routes(router, routes_for(&segment))?;
    tracing::debug!(%router, segment = %segment_id, "Attached router to external segment");

    let attachment = index
        .router_segments
        .entry(router.clone())
        .or_insert_with(|| RouterAttachment {
            segment: segment_id.clone(),
            l3_policies: Default::default(),
        });
    attachment.segment = segment_id.clone();
    attachment.l3_policies.insert(l3p.clone());
    Ok(gateway.map(|gw| gw.fixed_ips).unwrap_or_default())
}

/// Detaches an L3 policy from its router's segment. The router's gateway and routes are
/// cleared once no L3 policy uses the attachment.
pub(crate) fn detach_segment(
    index: &mut Index,
    txn: &mut Txn<'_>,
    l3p: &L3PolicyId,
    router: &RouterId,
) -> Result<()> {
    let Some(attachment) = index.router_segments.get_mut(router) else {
        return Ok(());
    };
    attachment.l3_policies.remove(l3p);
    if !attachment.l3_policies.is_empty() {
        return Ok(());
    }
    let segment = attachment.segment.clone();
    index.router_segments.remove(router);

    txn.set_router_routes(router, Vec::new())?;
    txn.set_router_gateway(router, None)?;
    tracing::debug!(%router, %segment, "Detached router from external segment");
    Ok(())
}

/// Re-derives the route table of every router attached to a segment.
pub(crate) fn reroute_segment(index: &Index, txn: &mut Txn<'_>, segment: &ExternalSegmentId) -> Result<()> {
    let state = index.segment(segment)?;
    let mut routers = index
        .router_segments
        .iter()
        .filter(|(_, a)| a.segment == *segment)
        .map(|(router, _)| router.clone())
        .collect::<Vec<_>>();
    routers.sort();
    for router in routers {
        txn.set_router_routes(&router, routes_for(state))?;
    }
    Ok(())
}

pub(crate) fn display_name<'n>(name: &'n str, id: &'n str) -> &'n str {
    if name.is_empty() {
        id
    } else {
        name
    }
}
