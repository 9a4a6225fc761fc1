//! # Identity and Peer Records
//!
//! Core identity types used throughout grapnel:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`NodeId`]: 32-byte blake3 hash of the public key, doubling as a point
//!   in the DHT keyspace (stored values are addressed by the same space)
//! - [`Peer`]: a known remote node — id, socket address, and the public key
//!   once it has been learned via `PING`
//!
//! ## Identity model
//!
//! A node's id is `blake3(public_key)`, not the public key itself, so ids are
//! uniformly distributed in the keyspace regardless of key structure. The
//! binding is checked whenever a peer presents its key: a claimed id that is
//! not the hash of the presented key is rejected (see [`Peer::from_public_key`]).
//!
//! ## Wire form
//!
//! Peers travel in `FIND_NODE`/`FIND_VALUE` replies as [`PeerInfo`] — id and
//! address only. Public keys are never gossiped; a recipient that wants to
//! talk to a discovered peer pings it first, which both fetches the key and
//! opens a NAT mapping in the same exchange.

use std::fmt;
use std::net::SocketAddr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Width of the keyspace in bits; also the number of routing buckets.
pub const KEYSPACE_BITS: usize = 256;

/// A 256-bit node identifier / keyspace point.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive a node id from a raw Ed25519 public key.
    #[inline]
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    /// Keyspace point for a stored value addressed by arbitrary key material.
    #[inline]
    pub fn for_key(key_material: &[u8]) -> Self {
        Self(*blake3::hash(key_material).as_bytes())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Compare two XOR distances as 256-bit big-endian integers.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// Ed25519 keypair. The node id is the blake3 hash of the public key.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key
            .verifying_key()
            .verify(message, signature)
            .is_ok()
    }

    /// Clamped X25519 scalar for this key, used to open sealed datagrams.
    pub(crate) fn x25519_scalar_bytes(&self) -> [u8; 32] {
        self.signing_key.to_scalar_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

/// A known remote node.
///
/// `public_key` is `None` until the peer has answered a `PING`; operations
/// that need encryption or signature verification learn it first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub public_key: Option<[u8; 32]>,
}

impl Peer {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            public_key: None,
        }
    }

    /// Build a peer from a presented public key, checking the id binding.
    ///
    /// `claimed_id`, when present, must equal `blake3(public_key)`; a mismatch
    /// means the sender is lying about its identity.
    pub fn from_public_key(
        public_key: [u8; 32],
        addr: SocketAddr,
        claimed_id: Option<NodeId>,
    ) -> Result<Self, IdentityMismatch> {
        let id = NodeId::from_public_key(&public_key);
        if let Some(claimed) = claimed_id {
            if claimed != id {
                return Err(IdentityMismatch {
                    claimed,
                    derived: id,
                });
            }
        }
        Ok(Self {
            id,
            addr,
            public_key: Some(public_key),
        })
    }

    /// Wire form: id and address only, no public key.
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            addr: self.addr,
        }
    }
}

impl From<PeerInfo> for Peer {
    fn from(info: PeerInfo) -> Self {
        Peer::new(info.id, info.addr)
    }
}

/// Serializable peer record as carried in lookup replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// A peer presented a public key that does not hash to its claimed id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityMismatch {
    pub claimed: NodeId,
    pub derived: NodeId,
}

impl fmt::Display for IdentityMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node id {} did not originate from the presented public key (derived {})",
            self.claimed, self.derived
        )
    }
}

impl std::error::Error for IdentityMismatch {}
