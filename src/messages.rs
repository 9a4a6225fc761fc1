//! # Wire Protocol Messages
//!
//! Serializable message bodies exchanged between nodes. Messages are
//! serialized with bincode under a hard size limit so a hostile datagram can
//! never balloon during deserialization.
//!
//! ## Body model
//!
//! Every datagram carries one [`Body`]: a correlation id, the sender's node
//! id, and a [`Payload`] that is a tagged enum over the fixed set of
//! request/reply shapes. Requests and replies are paired variants; the
//! receiving transport tells them apart with [`Payload::is_reply`] plus a
//! lookup in its pending-request table.
//!
//! | Request | Reply | Timeout |
//! |---------|-------|---------|
//! | `Ping` | `PingReply` | 2 s |
//! | `FindNode` | `FindNodeReply` | 4 s |
//! | `Store` | `StoreReply` | 10 s |
//! | `FindValue` | `FindValueReply` | 10 s |
//! | `PingForward` | `PingForwardReply` | 4 s |
//! | `PartialValue` | `PartialValueReply` (one per chunk) | 2 s per round |
//!
//! ## Message ids
//!
//! Request ids are `"{counter}_{random-hex}"`. Partial-value chunk replies
//! are tagged `"{offset}_{original-id}"` so every outstanding chunk resolves
//! its own pending slot.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bincode::Options;
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::time::Duration;

use crate::identity::{NodeId, PeerInfo};
use crate::store::StoreAck;

/// Maximum serialized size of a raw (single-datagram) value.
/// Anything longer is announced as `Partial` and fetched in chunks.
pub const MAX_RAW_VALUE_SIZE: usize = 1024;

/// Size of one partial-value chunk.
pub const CHUNK_SIZE: usize = 1024;

/// Maximum buffer accepted during deserialization, with headroom for
/// framing, signatures, and the sealed-envelope overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = 8 * 1024;

/// Bincode options with size limits enforced.
/// Always use this for network input; never raw `bincode::deserialize`.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Serialize under the same options used for deserialization.
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

// ============================================================================
// Message Ids
// ============================================================================

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Fresh request id: monotone counter plus random suffix, unique per process
/// and unguessable across processes.
pub fn next_message_id() -> String {
    let n = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut rnd = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut rnd);
    format!("{}_{}", n, hex::encode(rnd))
}

/// Reply id for one chunk of a partial-value transfer.
pub fn chunk_reply_id(offset: u64, request_id: &str) -> String {
    format!("{}_{}", offset, request_id)
}

// ============================================================================
// Body and Payloads
// ============================================================================

/// One datagram's logical content: correlation id, claimed sender, payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Body {
    pub id: String,
    pub node_id: NodeId,
    pub payload: Payload,
}

/// The request families the transport dispatches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Ping,
    FindNode,
    Store,
    FindValue,
    PingForward,
    PartialValue,
}

impl MessageKind {
    /// Reply budget for a request of this kind. Partial-value rounds use
    /// their own ceiling on top of this (see the transfer module).
    pub fn timeout(self) -> Duration {
        match self {
            MessageKind::Ping => Duration::from_secs(2),
            MessageKind::FindNode => Duration::from_secs(4),
            MessageKind::Store => Duration::from_secs(10),
            MessageKind::FindValue => Duration::from_secs(10),
            MessageKind::PingForward => Duration::from_secs(4),
            MessageKind::PartialValue => Duration::from_secs(2),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Ping => "PING",
            MessageKind::FindNode => "FIND_NODE",
            MessageKind::Store => "STORE",
            MessageKind::FindValue => "FIND_VALUE",
            MessageKind::PingForward => "PING_FORWARD",
            MessageKind::PartialValue => "PARTIAL_VALUE",
        };
        write!(f, "{name}")
    }
}

/// A value as it appears in `FIND_VALUE` replies: inline when it fits one
/// datagram, length-only when it must be fetched through the chunk protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireValue {
    Raw(Vec<u8>),
    Partial { length: u64 },
}

/// `FIND_VALUE` either returns the value or the closest peers the responder
/// knows, never both.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FindValueResult {
    Peers(Vec<PeerInfo>),
    Value(WireValue),
}

/// Every request/reply shape on the wire, decoded exhaustively.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Payload {
    /// Liveness probe; carries the sender's raw public key so the recipient
    /// can learn it. Always sent unencrypted.
    Ping { public_key: [u8; 32] },
    PingReply { public_key: [u8; 32] },

    FindNode { target: NodeId },
    FindNodeReply { peers: Vec<PeerInfo> },

    Store { key: NodeId, value: Vec<u8> },
    StoreReply { ack: StoreAck },

    FindValue { key: NodeId },
    FindValueReply { result: FindValueResult },

    /// NAT hole-punch relay: ask the recipient to ping `target` on our
    /// behalf, reusing our message id one hop further.
    PingForward { target: PeerInfo },
    PingForwardReply { public_key: [u8; 32] },

    /// Request the chunks of a stored value. An empty offset list means
    /// "send everything".
    PartialValue { key: NodeId, offsets: Vec<u64> },
    PartialValueReply { offset: u64, chunk: Vec<u8> },
}

impl Payload {
    /// The request family this payload belongs to.
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Ping { .. } | Payload::PingReply { .. } => MessageKind::Ping,
            Payload::FindNode { .. } | Payload::FindNodeReply { .. } => MessageKind::FindNode,
            Payload::Store { .. } | Payload::StoreReply { .. } => MessageKind::Store,
            Payload::FindValue { .. } | Payload::FindValueReply { .. } => MessageKind::FindValue,
            Payload::PingForward { .. } | Payload::PingForwardReply { .. } => {
                MessageKind::PingForward
            }
            Payload::PartialValue { .. } | Payload::PartialValueReply { .. } => {
                MessageKind::PartialValue
            }
        }
    }

    /// Reply-side of the request/reply pairing (the `_REPLY` convention).
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            Payload::PingReply { .. }
                | Payload::FindNodeReply { .. }
                | Payload::StoreReply { .. }
                | Payload::FindValueReply { .. }
                | Payload::PingForwardReply { .. }
                | Payload::PartialValueReply { .. }
        )
    }

    /// Whether this payload is the reply form for a pending request of
    /// `kind`. A reply only resolves a pending entry when both the id and
    /// the kind line up.
    pub fn answers(&self, kind: MessageKind) -> bool {
        self.is_reply() && self.kind() == kind
    }

    /// `PING` (and only `PING`) travels unencrypted: it is the bootstrap
    /// step that teaches two nodes each other's keys, so requiring a key
    /// for it would never terminate. Replies to a `PING` are also plaintext
    /// because the pinging side may not have published its key yet.
    pub fn must_be_plaintext(&self) -> bool {
        matches!(self, Payload::Ping { .. } | Payload::PingReply { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn make_id(seed: u8) -> NodeId {
        NodeId::from_bytes([seed; 32])
    }

    fn peer_info(seed: u8) -> PeerInfo {
        PeerInfo {
            id: make_id(seed),
            addr: format!("127.0.0.1:{}", 9000 + seed as u16).parse().unwrap(),
        }
    }

    #[test]
    fn bounded_deserialization_accepts_normal_bodies() {
        let body = Body {
            id: next_message_id(),
            node_id: make_id(1),
            payload: Payload::Store {
                key: make_id(2),
                value: vec![0u8; 100],
            },
        };
        let bytes = serialize(&body).unwrap();
        let decoded: Body = deserialize_bounded(&bytes).unwrap();
        assert_eq!(decoded.node_id, make_id(1));
    }

    #[test]
    fn malformed_data_rejected() {
        let garbage = vec![0xFF, 0xFE, 0xFD, 0xFC, 0xFB];
        assert!(deserialize_bounded::<Body>(&garbage).is_err());

        let body = Body {
            id: next_message_id(),
            node_id: make_id(1),
            payload: Payload::FindNode { target: make_id(2) },
        };
        let bytes = serialize(&body).unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(deserialize_bounded::<Body>(truncated).is_err());
    }

    #[test]
    fn oversized_payload_rejected() {
        let body = Body {
            id: next_message_id(),
            node_id: make_id(1),
            payload: Payload::Store {
                key: make_id(2),
                value: vec![0u8; 2 * MAX_DESERIALIZE_SIZE as usize],
            },
        };
        assert!(serialize(&body).is_err());
    }

    #[test]
    fn kind_and_reply_pairing() {
        let req = Payload::FindValue { key: make_id(3) };
        let rep = Payload::FindValueReply {
            result: FindValueResult::Peers(vec![peer_info(4)]),
        };

        assert_eq!(req.kind(), MessageKind::FindValue);
        assert!(!req.is_reply());
        assert!(rep.answers(MessageKind::FindValue));
        assert!(!rep.answers(MessageKind::FindNode));
        assert!(!req.answers(MessageKind::FindValue));
    }

    #[test]
    fn only_ping_is_plaintext() {
        assert!(Payload::Ping { public_key: [0; 32] }.must_be_plaintext());
        assert!(Payload::PingReply { public_key: [0; 32] }.must_be_plaintext());
        assert!(!Payload::FindNode { target: make_id(1) }.must_be_plaintext());
        assert!(!Payload::PartialValueReply {
            offset: 0,
            chunk: vec![]
        }
        .must_be_plaintext());
    }

    #[test]
    fn message_ids_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| next_message_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn chunk_reply_ids_distinct_per_offset() {
        let id = next_message_id();
        assert_ne!(chunk_reply_id(0, &id), chunk_reply_id(1024, &id));
        assert_eq!(chunk_reply_id(512, &id), format!("512_{}", id));
    }
}
