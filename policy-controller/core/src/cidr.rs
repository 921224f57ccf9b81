use ipnet::IpNet;

/// A set of addresses held as the minimal list of CIDRs covering it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct IpSet {
    nets: Vec<IpNet>,
}

/// Returns true if the two networks share at least one address.
pub fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    // CIDR blocks are either disjoint or nested.
    a.contains(&b.network()) || b.contains(&a.network())
}

// === impl IpSet ===

impl IpSet {
    pub fn new(nets: impl IntoIterator<Item = IpNet>) -> Self {
        let nets = nets.into_iter().map(|n| n.trunc()).collect::<Vec<_>>();
        Self {
            nets: IpNet::aggregate(&nets),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

    /// The minimal, sorted list of CIDRs describing this set.
    pub fn cidrs(&self) -> &[IpNet] {
        &self.nets
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpNet> + '_ {
        self.nets.iter()
    }

    pub fn contains(&self, net: &IpNet) -> bool {
        self.nets.iter().any(|n| n.contains(net))
    }

    pub fn overlaps(&self, net: &IpNet) -> bool {
        self.nets.iter().any(|n| overlaps(n, net))
    }

    pub fn union(&self, other: &IpSet) -> IpSet {
        Self::new(self.nets.iter().chain(other.nets.iter()).copied())
    }

    /// Returns the addresses in `self` that are not in `other`.
    pub fn difference(&self, other: &IpSet) -> IpSet {
        let mut remaining = Vec::new();
        for net in self.nets.iter() {
            exclude(*net, &other.nets, &mut remaining);
        }
        Self::new(remaining)
    }
}

impl FromIterator<IpNet> for IpSet {
    fn from_iter<T: IntoIterator<Item = IpNet>>(iter: T) -> Self {
        Self::new(iter)
    }
}

impl IntoIterator for IpSet {
    type Item = IpNet;
    type IntoIter = std::vec::IntoIter<IpNet>;

    fn into_iter(self) -> Self::IntoIter {
        self.nets.into_iter()
    }
}

/// Pushes the parts of `net` not covered by `holes` onto `out`.
///
/// A network that strictly contains a hole is split into its two halves until every piece is
/// either fully covered (and dropped) or disjoint from all holes (and kept).
fn exclude(net: IpNet, holes: &[IpNet], out: &mut Vec<IpNet>) {
    let mut split = false;
    for hole in holes.iter().filter(|h| overlaps(&net, h)) {
        if hole.contains(&net) {
            return;
        }
        split = true;
    }
    if !split {
        out.push(net);
        return;
    }

    // `net` strictly contains a hole, so it is never a host route and may always be split.
    if let Ok(halves) = net.subnets(net.prefix_len() + 1) {
        for half in halves {
            exclude(half, holes, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn nets(nets: &[&str]) -> Vec<IpNet> {
        nets.iter().map(|n| n.parse().unwrap()).collect()
    }

    #[test]
    fn overlap_is_symmetric() {
        let sup = "192.160.0.0/8".parse::<IpNet>().unwrap().trunc();
        let sub = "192.168.10.0/24".parse::<IpNet>().unwrap();
        assert!(overlaps(&sup, &sub));
        assert!(overlaps(&sub, &sup));
        assert!(!overlaps(&sub, &"192.168.11.0/24".parse().unwrap()));
        assert!(!overlaps(&sub, &"::/0".parse().unwrap()));
    }

    #[test]
    fn default_route_minus_pool() {
        let world = IpSet::new(nets(&["0.0.0.0/0"]));
        let pools = IpSet::new(nets(&["11.0.0.0/8"]));
        assert_eq!(
            world.difference(&pools).cidrs(),
            nets(&[
                "0.0.0.0/5",
                "8.0.0.0/7",
                "10.0.0.0/8",
                "12.0.0.0/6",
                "16.0.0.0/4",
                "32.0.0.0/3",
                "64.0.0.0/2",
                "128.0.0.0/1",
            ]),
        );
    }

    #[test]
    fn difference_of_disjoint_sets_is_identity() {
        let routes = IpSet::new(nets(&["172.0.0.0/8"]));
        let pools = IpSet::new(nets(&["192.168.0.0/16", "192.128.0.0/16"]));
        assert_eq!(routes.difference(&pools), routes);
    }

    #[test]
    fn covered_set_is_empty() {
        let routes = IpSet::new(nets(&["10.1.0.0/16", "10.2.0.0/16"]));
        let pools = IpSet::new(nets(&["10.0.0.0/8"]));
        assert!(routes.difference(&pools).is_empty());
    }

    #[test]
    fn adjacent_networks_are_aggregated() {
        let set = IpSet::new(nets(&["10.0.0.0/25", "10.0.0.128/25", "10.0.1.0/24"]));
        assert_eq!(set.cidrs(), nets(&["10.0.0.0/23"]));
        assert!(set.contains(&"10.0.1.0/26".parse().unwrap()));
        assert!(set.overlaps(&"10.0.0.0/16".parse().unwrap()));
    }

    #[test]
    fn difference_punches_multiple_holes() {
        let routes = IpSet::new(nets(&["192.0.0.0/8"]));
        let pools = IpSet::new(nets(&["192.168.0.0/16", "192.128.0.0/16", "192.64.0.0/16"]));
        let reachable = routes.difference(&pools);
        for pool in pools.iter() {
            assert!(!reachable.overlaps(pool));
        }
        // Every address outside of the pools remains reachable.
        for net in nets(&["192.0.0.0/10", "192.65.0.0/16", "192.169.0.0/16", "192.255.0.0/16"]) {
            assert!(reachable.contains(&net), "{net} must be reachable");
        }
        assert_eq!(reachable.union(&pools), routes);
    }
}
