//! # Grapnel - Kademlia DHT Node
//!
//! Grapnel is a peer-to-peer key/value overlay: content-addressed values are
//! located and replicated across untrusted nodes with no central
//! coordinator, using XOR-metric routing over signed (and, where both keys
//! are known, hybrid-encrypted) UDP datagrams.
//!
//! ## Architecture
//!
//! The transport uses the **Actor Pattern** for safe concurrent state:
//! - [`rpc::RpcNode`] is a cheap-to-clone handle; an internal actor owns the
//!   socket, routing table, and pending-request table and processes
//!   commands sequentially
//! - [`dht::Dht`] is the facade the rest of a node calls into
//!
//! ## Security Model
//!
//! - Identity = hash of an Ed25519 public key; a peer's claimed id must
//!   match the key it presents
//! - Every datagram is signed; unverifiable datagrams are dropped and a
//!   failed signature evicts the claimed sender
//! - Non-`PING` traffic is sealed to the recipient's key (X25519 +
//!   ChaCha20-Poly1305) once that key is known
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Keypairs, node ids, peer records |
//! | `crypto` | Body signatures and hybrid sealing |
//! | `messages` | Wire payload types, message ids, per-kind timeouts |
//! | `envelope` | Datagram framing: flag byte, signature, optional seal |
//! | `routing` | 256 k-buckets with per-bucket replacement caches |
//! | `rpc` | UDP transport actor: pending table, intake, request handlers |
//! | `transfer` | Chunked download of values larger than one datagram |
//! | `store` | `ValueStore` collaborator trait and in-memory backend |
//! | `dht` | Facade: bootstrap, save/fetch, lookups, maintenance timers |

pub mod crypto;
pub mod dht;
pub mod envelope;
pub mod identity;
pub mod messages;
pub mod routing;
pub mod rpc;
pub mod store;
pub mod transfer;

pub use dht::{Dht, DhtConfig, DhtError, SaveOutcome};
pub use identity::{Keypair, NodeId, Peer, PeerInfo};
pub use rpc::{RpcError, RpcNode};
pub use store::{MemoryValueStore, StoreAck, Value, ValueStore};
