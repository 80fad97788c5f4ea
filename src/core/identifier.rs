use ethereum_types::H160;
use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::ops::{Add, Neg, Sub};
use std::str::FromStr;

use num_bigint::BigUint;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::Error;

/// Number of bits in the identifier space (SHA-1 output length).
pub const ID_BITS: usize = 160;
const ID_BYTES: usize = ID_BITS / 8;

/// A point on the ring, an unsigned integer modulo 2^160 stored big-endian.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeID(pub H160);

impl NodeID {
    /// Uniformly random identifier, used for fresh virtual nodes.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        NodeID(H160::from(bytes))
    }

    pub fn zero() -> Self {
        NodeID(H160::zero())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(H160::from_slice(bytes))
    }

    /// Small identifiers, mostly handy for reasoning about a tiny ring.
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; ID_BYTES];
        bytes[ID_BYTES - 8..].copy_from_slice(&value.to_be_bytes());
        NodeID(H160::from(bytes))
    }

    /// Key of a record: SHA-1 of its name.
    pub fn from_hashed<S: AsRef<[u8]>>(input: &S) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(input.as_ref());
        let digest = hasher.finalize();
        Self(H160::from_slice(&digest))
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        self.0.as_fixed_bytes()
    }

    /// 2^exp, for `exp < ID_BITS`.
    pub fn pow2(exp: usize) -> Self {
        debug_assert!(exp < ID_BITS);
        NodeID::from(BigUint::from(1u8) << exp)
    }

    /// `self + 2^exp`, the start of finger slot `exp`.
    pub fn add_pow2(&self, exp: usize) -> NodeID {
        *self + NodeID::pow2(exp)
    }

    /// Clockwise distance from `self` to `other`: `(other - self) mod 2^160`.
    pub fn distance(&self, other: &NodeID) -> Distance {
        Distance((*other - *self).0)
    }

    /// True iff `self` lies strictly inside the clockwise interval `(a, b)`.
    /// `(a, a)` covers the whole ring except `a`.
    pub fn is_between(&self, a: &NodeID, b: &NodeID) -> bool {
        if a == b {
            return self != a;
        }
        let d = a.distance(self);
        !d.is_zero() && d < a.distance(b)
    }

    /// True iff `self` lies inside `(a, b]`. `(a, a]` is the whole ring.
    pub fn is_between_right_incl(&self, a: &NodeID, b: &NodeID) -> bool {
        self == b || self.is_between(a, b)
    }

    /// Return a short, human-friendly hex for logging, like ab12cd34…ef90a1b2
    pub fn short_hex(&self) -> String {
        let b = self.as_bytes();
        format!(
            "{:02x}{:02x}{:02x}{:02x}…{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[16], b[17], b[18], b[19]
        )
    }
}

/// Free-function form of [`NodeID::is_between`].
pub fn between(k: &NodeID, a: &NodeID, b: &NodeID) -> bool {
    k.is_between(a, b)
}

fn ring_size() -> BigUint {
    BigUint::from(1u8) << ID_BITS
}

impl From<NodeID> for BigUint {
    fn from(id: NodeID) -> BigUint {
        BigUint::from_bytes_be(id.as_bytes())
    }
}

/// Reduces modulo 2^160.
impl From<BigUint> for NodeID {
    fn from(value: BigUint) -> Self {
        let digits = (value % ring_size()).to_bytes_be();
        let mut bytes = [0u8; ID_BYTES];
        bytes[ID_BYTES - digits.len()..].copy_from_slice(&digits);
        NodeID(H160::from(bytes))
    }
}

impl Neg for NodeID {
    type Output = Self;
    fn neg(self) -> Self {
        (ring_size() - BigUint::from(self)).into()
    }
}

impl Add for NodeID {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        (BigUint::from(self) + BigUint::from(rhs)).into()
    }
}

impl Sub for NodeID {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        self + (-rhs)
    }
}

impl fmt::Display for NodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.as_bytes()))
    }
}

impl fmt::Debug for NodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeID({})", self.short_hex())
    }
}

impl FromStr for NodeID {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(digits).map_err(|e| Error::InvalidIdentifier(e.to_string()))?;
        if bytes.len() != ID_BYTES {
            return Err(Error::InvalidIdentifier(format!(
                "expected {ID_BYTES} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(NodeID::from_bytes(&bytes))
    }
}

pub type Key = NodeID;

/// Clockwise ring distance. Orders like the unsigned integer it encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(H160);

impl Distance {
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Index of the highest set bit, i.e. the last finger slot this distance reaches.
    pub fn highest_bit(&self) -> Option<usize> {
        let bytes = self.0.as_bytes();
        bytes.iter().position(|b| *b != 0).map(|i| {
            let byte_bits = 7 - bytes[i].leading_zeros() as usize;
            (ID_BYTES - 1 - i) * 8 + byte_bits
        })
    }

    /// Share of the whole ring this distance covers, in `[0, 1)`.
    pub fn fraction_of_ring(&self) -> f64 {
        // the top 64 bits are all the precision an f64 can use
        let top = BigUint::from_bytes_be(self.0.as_bytes()) >> (ID_BITS - 64);
        let top = top.to_u64_digits().first().copied().unwrap_or(0);
        top as f64 / 2f64.powi(64)
    }
}

/// Ring identity plus the RPC endpoint of the physical peer hosting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(with = "serde_ipaddr")]
    pub ip_address: IpAddr,
    pub udp_port: u16,
    pub node_id: NodeID,
}

impl NodeInfo {
    pub fn new(node_id: NodeID, addr: SocketAddr) -> Self {
        Self {
            ip_address: addr.ip(),
            udp_port: addr.port(),
            node_id,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_address, self.udp_port)
    }

    /// Clockwise order of `a` and `b` as seen from this node.
    pub fn cmp_from(&self, a: &NodeInfo, b: &NodeInfo) -> Ordering {
        self.node_id
            .distance(&a.node_id)
            .cmp(&self.node_id.distance(&b.node_id))
    }
}

mod serde_ipaddr {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::IpAddr;

    pub fn serialize<S>(ip: &IpAddr, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&ip.to_string())
    }

    pub fn deserialize<'de, D>(d: D) -> Result<IpAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
