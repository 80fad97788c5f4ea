use serde::{Deserialize, Serialize};

use crate::{
    core::identifier::{Key, NodeID, NodeInfo},
    core::storage::Record,
    error::{Error, Result},
};

mod lookup;
pub mod stabilizer;
pub mod vnode;

pub use self::stabilizer::Stabilizer;
pub use self::vnode::{MembershipState, RingParams, VirtualNode};

/// A ring RPC addressed to one virtual node on the receiving peer.
///
/// `target` is `None` when the caller only knows the peer's address
/// (bootstrap); such requests go to any connected local virtual node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub target: Option<NodeID>,
    pub body: RequestBody,
}

impl Request {
    pub fn to(target: NodeID, body: RequestBody) -> Self {
        Self {
            target: Some(target),
            body,
        }
    }

    pub fn any(body: RequestBody) -> Self {
        Self { target: None, body }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum RequestBody {
    /// One step of an iterative successor lookup.
    FindSuccessor { key: Key },
    /// Same walk, but the caller wants the node preceding `key`.
    FindPredecessor { key: Key },
    GetPredecessor,
    GetSuccessorList,
    /// `node` thinks it might be our predecessor.
    Notify { node: NodeInfo },
    Ping,
    /// A joining node asks for the successor of its own identifier.
    JoinGetSucc { sender: NodeInfo },
    /// Sent to the predecessor of a leaving node.
    SuccessorLeaving {
        leaving: NodeID,
        successors: Vec<NodeInfo>,
    },
    /// Sent to the successor of a leaving node.
    PredecessorLeaving {
        leaving: NodeID,
        predecessor: Option<NodeInfo>,
    },
    Store {
        key: Key,
        record: Record,
        ttl_secs: u64,
    },
    Fetch { key: Key },
}

impl RequestBody {
    /// Short name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestBody::FindSuccessor { .. } => "find_successor",
            RequestBody::FindPredecessor { .. } => "find_predecessor",
            RequestBody::GetPredecessor => "get_predecessor",
            RequestBody::GetSuccessorList => "get_successor_list",
            RequestBody::Notify { .. } => "notify",
            RequestBody::Ping => "ping",
            RequestBody::JoinGetSucc { .. } => "join_get_succ",
            RequestBody::SuccessorLeaving { .. } => "successor_leaving",
            RequestBody::PredecessorLeaving { .. } => "predecessor_leaving",
            RequestBody::Store { .. } => "store",
            RequestBody::Fetch { .. } => "fetch",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// No virtual node with the requested identifier lives here (any more).
    UnknownTarget,
    /// The target exists but has not joined a ring yet.
    NotConnected,
    /// The request was understood but refused in the target's current state.
    Rejected,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub body: ResponseBody,
}

/// Answer to a lookup step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "hop")]
pub enum Hop {
    /// The key lies in `(predecessor, successor]`.
    Done {
        predecessor: NodeInfo,
        successor: NodeInfo,
    },
    /// Ask `node` next.
    Next { node: NodeInfo },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ResponseBody {
    Empty,
    Node { node: NodeInfo },
    MaybeNode { node: Option<NodeInfo> },
    Nodes { nodes: Vec<NodeInfo> },
    Hop { hop: Hop },
    Record { record: Option<Record> },
}

impl Response {
    pub fn ok(body: ResponseBody) -> Self {
        Self {
            status: Status::Ok,
            body,
        }
    }

    pub fn empty() -> Self {
        Self::ok(ResponseBody::Empty)
    }

    pub fn status(status: Status) -> Self {
        Self {
            status,
            body: ResponseBody::Empty,
        }
    }

    fn checked(self) -> Result<ResponseBody> {
        match self.status {
            Status::Ok => Ok(self.body),
            Status::UnknownTarget => Err(Error::UnreachablePeer),
            other => Err(Error::Rejected(other)),
        }
    }

    pub fn into_empty(self) -> Result<()> {
        self.checked().map(|_| ())
    }

    pub fn into_node(self) -> Result<NodeInfo> {
        match self.checked()? {
            ResponseBody::Node { node } => Ok(node),
            other => Err(unexpected("Node", &other)),
        }
    }

    pub fn into_maybe_node(self) -> Result<Option<NodeInfo>> {
        match self.checked()? {
            ResponseBody::MaybeNode { node } => Ok(node),
            other => Err(unexpected("MaybeNode", &other)),
        }
    }

    pub fn into_nodes(self) -> Result<Vec<NodeInfo>> {
        match self.checked()? {
            ResponseBody::Nodes { nodes } => Ok(nodes),
            other => Err(unexpected("Nodes", &other)),
        }
    }

    pub fn into_hop(self) -> Result<Hop> {
        match self.checked()? {
            ResponseBody::Hop { hop } => Ok(hop),
            other => Err(unexpected("Hop", &other)),
        }
    }

    pub fn into_record(self) -> Result<Option<Record>> {
        match self.checked()? {
            ResponseBody::Record { record } => Ok(record),
            other => Err(unexpected("Record", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &ResponseBody) -> Error {
    Error::MalformedResponse(format!("expected {wanted}, got {got:?}"))
}
