//! Errors surfaced by the overlay.
//!
//! Protocol-internal failures (a single RPC timing out, one peer being
//! unreachable) are absorbed by the stabilizer and only drive local state
//! transitions. Lifecycle operations on [`PeerNode`](crate::dht::PeerNode)
//! return them to the caller.

use crate::core::identifier::NodeID;
use crate::protocol::Status;
use crate::transport::RpcFailure;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("rpc did not complete in time")]
    Timeout,

    #[error("peer is unreachable")]
    UnreachablePeer,

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("persisted ring state is corrupt: {0}")]
    PersistenceCorrupt(String),

    #[error("no bootstrap peer could be joined")]
    NoBootstrapAvailable,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("lookup for {key} gave up after {hops} hops")]
    LookupExhausted { key: NodeID, hops: usize },

    #[error("remote answered with status {0:?}")]
    Rejected(Status),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error means the remote peer should be treated as failed.
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::UnreachablePeer | Error::MalformedResponse(_)
        )
    }
}

impl From<RpcFailure> for Error {
    fn from(failure: RpcFailure) -> Self {
        match failure {
            RpcFailure::Timeout => Error::Timeout,
            RpcFailure::UnreachablePeer => Error::UnreachablePeer,
            RpcFailure::MalformedResponse => {
                Error::MalformedResponse("undecodable reply".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_failures_map_to_peer_failures() {
        for failure in [
            RpcFailure::Timeout,
            RpcFailure::UnreachablePeer,
            RpcFailure::MalformedResponse,
        ] {
            let err: Error = failure.into();
            assert!(err.is_peer_failure(), "{err:?} should invalidate the peer");
        }
        assert!(!Error::NoBootstrapAvailable.is_peer_failure());
        assert!(!Error::InvalidState("leaving".into()).is_peer_failure());
    }
}
