use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::raft::state::{NodeId, Term};

const KNOWN_KINDS: [&str; 5] = ["discover", "discover_reply", "vote", "vote_ok", "heartbeat"];

/// Messages exchanged between members.
///
/// On the wire each message is a JSON object whose `rpc` field names the kind,
/// e.g. `{"rpc":"vote","term":3,"id":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rpc", rename_all = "snake_case")]
pub enum Rpc {
    /// Handshake sent by the connecting side once a link is up.
    Discover,
    DiscoverReply {
        leader: Option<NodeId>,
        term: Term,
        #[serde(default)]
        nodes: Vec<NodeId>,
    },
    /// Candidacy announcement.
    Vote { term: Term, id: NodeId },
    VoteOk,
    Heartbeat { term: Term, leader: NodeId },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unrecognized rpc kind '{0}'")]
    UnknownKind(String),
}

impl Rpc {
    pub fn kind(&self) -> &'static str {
        match self {
            Rpc::Discover => "discover",
            Rpc::DiscoverReply { .. } => "discover_reply",
            Rpc::Vote { .. } => "vote",
            Rpc::VoteOk => "vote_ok",
            Rpc::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // An enum of plain fields with string map keys cannot fail to serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_slice(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = value
            .get("rpc")
            .and_then(|k| k.as_str())
            .ok_or_else(|| ProtocolError::Malformed("missing 'rpc' field".to_string()))?;
        if !KNOWN_KINDS.contains(&kind) {
            return Err(ProtocolError::UnknownKind(kind.to_string()));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

impl std::fmt::Display for Rpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_kinds_are_bare_tags() {
        assert_eq!(Rpc::Discover.encode(), br#"{"rpc":"discover"}"#.to_vec());
        assert_eq!(Rpc::VoteOk.encode(), br#"{"rpc":"vote_ok"}"#.to_vec());
    }

    #[test]
    fn test_vote_wire_shape() {
        let id = NodeId::generate();
        let value: serde_json::Value =
            serde_json::from_slice(&Rpc::Vote { term: 4, id }.encode()).unwrap();
        assert_eq!(value["rpc"], "vote");
        assert_eq!(value["term"], 4);
        assert_eq!(value["id"], id.to_string());
    }

    #[test]
    fn test_decode_heartbeat() {
        let leader = NodeId::generate();
        let payload = format!(r#"{{"rpc":"heartbeat","term":2,"leader":"{}"}}"#, leader);
        let rpc = Rpc::decode(payload.as_bytes()).unwrap();
        assert_eq!(rpc, Rpc::Heartbeat { term: 2, leader });
    }

    #[test]
    fn test_decode_discover_reply_without_nodes() {
        let rpc = Rpc::decode(br#"{"rpc":"discover_reply","leader":null,"term":0}"#).unwrap();
        assert_eq!(
            rpc,
            Rpc::DiscoverReply {
                leader: None,
                term: 0,
                nodes: vec![]
            }
        );
    }

    #[test]
    fn test_decode_unknown_kind() {
        let err = Rpc::decode(br#"{"rpc":"append_entries","term":1}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownKind("append_entries".to_string()));
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            Rpc::decode(b"not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Rpc::decode(br#"{"term":1}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Rpc::decode(br#"{"rpc":"vote","term":"x"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
