use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::identifier::NodeID;
use crate::error::Error;
use crate::protocol::RingParams;

/// A peer to join through. The identifier is optional: a request without
/// one is served by any connected virtual node on that peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapPeer {
    pub addr: SocketAddr,
    pub node_id: Option<NodeID>,
}

impl BootstrapPeer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            node_id: None,
        }
    }

    pub fn known(addr: SocketAddr, node_id: NodeID) -> Self {
        Self {
            addr,
            node_id: Some(node_id),
        }
    }
}

/// `host:port` or `host:port/0x<40 hex digits>`.
impl FromStr for BootstrapPeer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_part, id_part) = match s.split_once('/') {
            Some((addr, id)) => (addr, Some(id)),
            None => (s, None),
        };
        let addr = addr_part
            .to_socket_addrs()
            .map_err(|e| Error::InvalidState(format!("bad bootstrap address {addr_part}: {e}")))?
            .next()
            .ok_or_else(|| Error::InvalidState(format!("{addr_part} resolves to nothing")))?;
        let node_id = id_part.map(NodeID::from_str).transpose()?;
        Ok(Self { addr, node_id })
    }
}

impl fmt::Display for BootstrapPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node_id {
            Some(id) => write!(f, "{}/{}", self.addr, id),
            None => write!(f, "{}", self.addr),
        }
    }
}

/// Settings of one physical peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    pub bind_addr: SocketAddr,
    pub num_vnodes: usize,
    pub successor_list_len: usize,
    #[serde(with = "duration_millis")]
    pub stabilize_period: Duration,
    #[serde(with = "duration_millis")]
    pub rpc_timeout: Duration,
    pub max_lookup_hops: usize,
    pub successor_failure_threshold: u32,
    pub bootstrap: Vec<BootstrapPeer>,
    /// Start a new ring when no bootstrap peer can be reached.
    pub self_bootstrap: bool,
    pub vnodes_table_file: PathBuf,
    #[serde(with = "opt_duration_millis")]
    pub hibernate_period: Option<Duration>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8250)),
            num_vnodes: 32,
            successor_list_len: 8,
            stabilize_period: Duration::from_secs(1),
            rpc_timeout: Duration::from_secs(2),
            max_lookup_hops: 32,
            successor_failure_threshold: 3,
            bootstrap: Vec::new(),
            self_bootstrap: false,
            vnodes_table_file: PathBuf::from("vnodes-table.dat"),
            hibernate_period: None,
        }
    }
}

impl DhtConfig {
    pub fn ring_params(&self) -> RingParams {
        RingParams {
            successor_list_len: self.successor_list_len.max(1),
            max_lookup_hops: self.max_lookup_hops.max(1),
            successor_failure_threshold: self.successor_failure_threshold.max(1),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_peer_parses_with_and_without_id() {
        let plain: BootstrapPeer = "127.0.0.1:8250".parse().unwrap();
        assert_eq!(plain.addr, "127.0.0.1:8250".parse().unwrap());
        assert!(plain.node_id.is_none());

        let id = NodeID::from_hashed(&"bootstrap");
        let text = format!("127.0.0.1:9000/{id}");
        let known: BootstrapPeer = text.parse().unwrap();
        assert_eq!(known.node_id, Some(id));
        assert_eq!(known.to_string(), text);

        assert!("127.0.0.1:9000/0xabc".parse::<BootstrapPeer>().is_err());
        assert!("not an address".parse::<BootstrapPeer>().is_err());
    }

    #[test]
    fn config_encodes_and_clamps_ring_params() {
        let config: DhtConfig =
            rmp_serde::from_slice(&rmp_serde::to_vec_named(&DhtConfig::default()).unwrap()).unwrap();
        assert_eq!(config.num_vnodes, 32);
        assert_eq!(config.stabilize_period, Duration::from_secs(1));
        assert_eq!(config.vnodes_table_file, PathBuf::from("vnodes-table.dat"));
        assert!(config.hibernate_period.is_none());

        let params = DhtConfig {
            successor_list_len: 0,
            ..DhtConfig::default()
        }
        .ring_params();
        assert_eq!(params.successor_list_len, 1);
        assert_eq!(params.successor_failure_threshold, 3);
    }
}
