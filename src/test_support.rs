#[cfg(test)]
pub mod test_support {
    use crate::core::identifier::{NodeID, NodeInfo};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    /// Small identifier, so a ring like 10 -> 40 -> 90 reads naturally in tests.
    pub fn id(v: u64) -> NodeID {
        NodeID::from_u64(v)
    }

    /// Address a test peer hosting identifier `v` would bind.
    pub fn addr_for(v: u64) -> SocketAddr {
        SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            10_000 + (v % 50_000) as u16,
        )
    }

    pub fn make_peer(v: u64) -> NodeInfo {
        NodeInfo::new(id(v), addr_for(v))
    }
}
