//! Typed errors returned by store nodes.
//!
//! `StoreError` crosses the wire inside `Response::Error`, so callers match on
//! variants instead of parsing text. A rejected leader-only call carries the
//! best-known leader address as a field.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreError {
    /// Bootstrap has not completed on this node.
    #[error("store is not connected to the network yet")]
    Disconnected,

    /// Leader-only operation sent to a follower. `leader` is `None` while an
    /// election is in progress.
    #[error("not the leader; retry against {}", leader.as_deref().unwrap_or("<unknown>"))]
    NotLeader { leader: Option<String> },

    #[error("key {key} not found")]
    KeyNotFound { key: i64 },

    /// The write at `index` was acknowledged by `acks` peers, short of `required`.
    #[error("quorum unreachable for entry {index}: {acks}/{required} acknowledgements")]
    QuorumUnreachable {
        index: u64,
        acks: usize,
        required: usize,
    },

    #[error("peer {address} unreachable after {attempts} attempts")]
    PeerUnreachable { address: String, attempts: u32 },

    /// Malformed or unexpected reply from a peer.
    #[error("rpc failure: {message}")]
    Rpc { message: String },
}

impl StoreError {
    pub fn not_leader(leader: &str) -> Self {
        StoreError::NotLeader {
            leader: (!leader.is_empty()).then(|| leader.to_string()),
        }
    }

    pub fn rpc(message: impl Into<String>) -> Self {
        StoreError::Rpc {
            message: message.into(),
        }
    }

    /// Address a caller should retry against, if this error is a redirect.
    pub fn redirect(&self) -> Option<&str> {
        match self {
            StoreError::NotLeader { leader } => leader.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_treats_empty_address_as_unknown() {
        assert_eq!(StoreError::not_leader(""), StoreError::NotLeader { leader: None });
        assert_eq!(
            StoreError::not_leader("127.0.0.1:7001").redirect(),
            Some("127.0.0.1:7001")
        );
    }

    #[test]
    fn leader_address_survives_the_wire() {
        let err = StoreError::not_leader("10.0.0.1:9000");
        let json = serde_json::to_string(&err).expect("encode");
        assert!(json.contains("\"kind\":\"not_leader\""));
        let back: StoreError = serde_json::from_str(&json).expect("decode");
        assert_eq!(back.redirect(), Some("10.0.0.1:9000"));
    }
}
