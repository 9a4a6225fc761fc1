//! # RPC Transport
//!
//! Owns the UDP socket and the routing table, correlates requests with
//! replies by message id, and dispatches verified inbound requests to their
//! handlers.
//!
//! ## Architecture
//!
//! The transport uses the actor pattern:
//! - [`RpcNode`]: public handle (cheap to clone) for sending requests and
//!   querying the routing table
//! - `RpcActor`: internal actor owning the socket read loop, the routing
//!   table, and the pending-request table
//!
//! Every request is `SENT -> (REPLIED | TIMED_OUT)`, terminal either way.
//! The pending entry for a message id is removed exactly once: by a matching
//! reply or by the caller's timeout, whichever fires first; the loser is a
//! no-op. A timeout also evicts the unresponsive peer from its bucket.
//!
//! Inbound datagrams go through a fixed pipeline: open the envelope, resolve
//! the sender's public key (carried inline for `PING`, otherwise looked up in
//! the routing table), verify the signature, offer the sender to the routing
//! table, then resolve a pending reply or dispatch a request handler. A
//! datagram from a sender whose key is not yet known is held while a ping
//! learns it, then fed back through the intake once; a failed signature
//! check drops the datagram and evicts the claimed sender.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::envelope;
use crate::identity::{Keypair, NodeId, Peer, KEYSPACE_BITS};
use crate::messages::{next_message_id, Body, FindValueResult, MessageKind, Payload, WireValue};
use crate::routing::{
    AddOutcome, RoutingTable, DEFAULT_NODES_PER_BUCKET, DEFAULT_REPLACEMENT_CACHE_SIZE,
};
use crate::store::ValueStore;

/// Largest datagram we will read off the socket.
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Command channel depth between handles and the actor.
const COMMAND_CHANNEL_SIZE: usize = 256;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum RpcError {
    /// No reply within the kind's budget; the peer was evicted from its
    /// bucket.
    Timeout { kind: MessageKind, peer: NodeId },
    /// The transport actor is gone, or it could not frame the request (an
    /// oversized body fails here rather than idling out the timeout).
    Closed,
    /// The peer answered with a payload that does not fit the request.
    UnexpectedReply { kind: MessageKind, peer: NodeId },
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Timeout { kind, peer } => {
                write!(f, "{kind} to {peer} timed out")
            }
            RpcError::Closed => write!(f, "rpc transport is shut down"),
            RpcError::UnexpectedReply { kind, peer } => {
                write!(f, "{peer} sent a malformed reply to {kind}")
            }
        }
    }
}

impl std::error::Error for RpcError {}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct RpcConfig {
    pub bind_addr: SocketAddr,
    pub num_buckets: usize,
    pub nodes_per_bucket: usize,
    pub replacement_cache_size: usize,
    pub chunk_size: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".parse().expect("static addr"),
            num_buckets: KEYSPACE_BITS,
            nodes_per_bucket: DEFAULT_NODES_PER_BUCKET,
            replacement_cache_size: DEFAULT_REPLACEMENT_CACHE_SIZE,
            chunk_size: crate::messages::CHUNK_SIZE,
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

enum Command {
    /// Seal and transmit a body; when `pending` is set, register it in the
    /// pending table under the body's id first.
    Request {
        to: SocketAddr,
        body: Body,
        recipient_key: Option<[u8; 32]>,
        pending: Option<oneshot::Sender<Body>>,
    },
    /// Register a reply slot without transmitting anything (chunk replies
    /// arrive under derived ids the sender never used for a request).
    RegisterSlot {
        id: String,
        kind: MessageKind,
        tx: oneshot::Sender<Body>,
    },
    /// Drop a pending entry if it is still unresolved; `evict` additionally
    /// removes that peer from the routing table (the timeout path).
    CancelPending {
        id: String,
        evict: Option<NodeId>,
    },
    /// Feed a held datagram back through the intake once its sender's key
    /// was learned.
    Redeliver {
        data: Vec<u8>,
        from: SocketAddr,
    },
    AddCandidate {
        peer: Peer,
    },
    GetNode {
        id: NodeId,
        reply: oneshot::Sender<Option<Peer>>,
    },
    ClosestNodes {
        target: NodeId,
        limit: usize,
        reply: oneshot::Sender<Vec<Peer>>,
    },
    OneNodePerBucket {
        reply: oneshot::Sender<Vec<Peer>>,
    },
    AllPeers {
        reply: oneshot::Sender<Vec<Peer>>,
    },
    RemoveNode {
        id: NodeId,
    },
    NodeCount {
        reply: oneshot::Sender<usize>,
    },
    Quit,
}

// ============================================================================
// RpcNode handle
// ============================================================================

/// Handle to a running transport. Clones share the socket, routing table,
/// and pending table.
#[derive(Clone)]
pub struct RpcNode {
    cmd_tx: mpsc::Sender<Command>,
    node_id: NodeId,
    public_key: [u8; 32],
    local_addr: SocketAddr,
}

impl fmt::Debug for RpcNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcNode")
            .field("node_id", &self.node_id)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl RpcNode {
    /// Bind the socket and start the transport actor.
    pub async fn bind(
        keypair: Keypair,
        store: Arc<dyn ValueStore>,
        config: RpcConfig,
    ) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let local_addr = socket.local_addr()?;
        let node_id = keypair.node_id();
        let public_key = keypair.public_key_bytes();

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let handle = Self {
            cmd_tx,
            node_id,
            public_key,
            local_addr,
        };

        let actor = RpcActor {
            socket,
            keypair: Arc::new(keypair),
            table: RoutingTable::new(
                node_id,
                config.num_buckets,
                config.nodes_per_bucket,
                config.replacement_cache_size,
            ),
            pending: HashMap::new(),
            store,
            handle: handle.clone(),
            nodes_per_bucket: config.nodes_per_bucket,
            chunk_size: config.chunk_size,
        };
        tokio::spawn(actor.run(cmd_rx));

        debug!(node = %node_id, addr = %local_addr, "rpc transport listening");
        Ok(handle)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public_key
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// This node as a peer record (what we tell bootstrap partners).
    pub fn local_peer(&self) -> Peer {
        let mut peer = Peer::new(self.node_id, self.local_addr);
        peer.public_key = Some(self.public_key);
        peer
    }

    // ------------------------------------------------------------------
    // Request primitives
    // ------------------------------------------------------------------

    /// Send a request and wait for its reply within the kind's budget.
    /// Encrypts whenever the payload allows it, pinging first if the peer's
    /// public key is not yet known. A timeout evicts the peer.
    pub async fn send_and_wait(
        &self,
        peer: &Peer,
        payload: Payload,
        id: Option<String>,
    ) -> Result<Body, RpcError> {
        let kind = payload.kind();
        let recipient_key = self.resolve_recipient_key(peer, &payload).await?;
        let id = id.unwrap_or_else(next_message_id);
        let body = Body {
            id: id.clone(),
            node_id: self.node_id,
            payload,
        };

        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request {
                to: peer.addr,
                body,
                recipient_key,
                pending: Some(tx),
            })
            .await
            .map_err(|_| RpcError::Closed)?;

        match tokio::time::timeout(kind.timeout(), rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => {
                let _ = self
                    .cmd_tx
                    .send(Command::CancelPending {
                        id,
                        evict: Some(peer.id),
                    })
                    .await;
                Err(RpcError::Timeout {
                    kind,
                    peer: peer.id,
                })
            }
        }
    }

    /// Send a request without waiting for any reply. Returns the message id
    /// so derived reply slots can be keyed off it.
    pub async fn send(
        &self,
        peer: &Peer,
        payload: Payload,
        id: Option<String>,
    ) -> Result<String, RpcError> {
        let recipient_key = self.resolve_recipient_key(peer, &payload).await?;
        let id = id.unwrap_or_else(next_message_id);
        let body = Body {
            id: id.clone(),
            node_id: self.node_id,
            payload,
        };
        self.cmd_tx
            .send(Command::Request {
                to: peer.addr,
                body,
                recipient_key,
                pending: None,
            })
            .await
            .map_err(|_| RpcError::Closed)?;
        Ok(id)
    }

    /// Register a bare reply slot for a derived message id (partial-value
    /// chunks). The caller owns the timeout and must cancel unresolved
    /// slots.
    pub async fn register_reply_slot(
        &self,
        id: String,
        kind: MessageKind,
    ) -> Result<oneshot::Receiver<Body>, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RegisterSlot { id, kind, tx })
            .await
            .map_err(|_| RpcError::Closed)?;
        Ok(rx)
    }

    async fn redeliver(&self, data: Vec<u8>, from: SocketAddr) {
        let _ = self.cmd_tx.send(Command::Redeliver { data, from }).await;
    }

    /// Drop a still-unresolved reply slot without evicting anyone.
    pub async fn cancel_reply_slot(&self, id: String) {
        let _ = self
            .cmd_tx
            .send(Command::CancelPending { id, evict: None })
            .await;
    }

    // ------------------------------------------------------------------
    // Typed requests
    // ------------------------------------------------------------------

    /// Liveness probe; returns the peer's public key on success. Always
    /// travels plaintext, which is how two nodes learn each other's keys.
    pub async fn ping(&self, peer: &Peer) -> Result<[u8; 32], RpcError> {
        self.ping_with_id(peer, None).await
    }

    /// `ping` with a caller-chosen message id (the hole-punch relay reuses
    /// the requester's id one hop further).
    pub async fn ping_with_id(
        &self,
        peer: &Peer,
        id: Option<String>,
    ) -> Result<[u8; 32], RpcError> {
        let payload = Payload::Ping {
            public_key: self.public_key,
        };
        let reply = self.send_and_wait(peer, payload, id).await?;
        match reply.payload {
            Payload::PingReply { public_key } => Ok(public_key),
            _ => Err(RpcError::UnexpectedReply {
                kind: MessageKind::Ping,
                peer: peer.id,
            }),
        }
    }

    pub async fn find_node(&self, peer: &Peer, target: NodeId) -> Result<Vec<Peer>, RpcError> {
        let reply = self
            .send_and_wait(peer, Payload::FindNode { target }, None)
            .await?;
        match reply.payload {
            Payload::FindNodeReply { peers } => Ok(peers.into_iter().map(Peer::from).collect()),
            _ => Err(RpcError::UnexpectedReply {
                kind: MessageKind::FindNode,
                peer: peer.id,
            }),
        }
    }

    pub async fn store(
        &self,
        peer: &Peer,
        key: NodeId,
        value: Vec<u8>,
    ) -> Result<crate::store::StoreAck, RpcError> {
        let reply = self
            .send_and_wait(peer, Payload::Store { key, value }, None)
            .await?;
        match reply.payload {
            Payload::StoreReply { ack } => Ok(ack),
            _ => Err(RpcError::UnexpectedReply {
                kind: MessageKind::Store,
                peer: peer.id,
            }),
        }
    }

    pub async fn find_value(&self, peer: &Peer, key: NodeId) -> Result<FindValueResult, RpcError> {
        let reply = self
            .send_and_wait(peer, Payload::FindValue { key }, None)
            .await?;
        match reply.payload {
            Payload::FindValueReply { result } => Ok(result),
            _ => Err(RpcError::UnexpectedReply {
                kind: MessageKind::FindValue,
                peer: peer.id,
            }),
        }
    }

    /// Ask `via` to ping `target` on our behalf (NAT hole punch). Returns
    /// the target's public key as relayed back.
    pub async fn ping_forward(&self, via: &Peer, target: Peer) -> Result<[u8; 32], RpcError> {
        let payload = Payload::PingForward {
            target: target.info(),
        };
        let reply = self.send_and_wait(via, payload, None).await?;
        match reply.payload {
            Payload::PingForwardReply { public_key } => Ok(public_key),
            _ => Err(RpcError::UnexpectedReply {
                kind: MessageKind::PingForward,
                peer: via.id,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Routing table access
    // ------------------------------------------------------------------

    pub async fn add_candidate(&self, peer: Peer) {
        let _ = self.cmd_tx.send(Command::AddCandidate { peer }).await;
    }

    pub async fn get_node(&self, id: NodeId) -> Option<Peer> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::GetNode { id, reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    pub async fn closest_nodes(&self, target: NodeId, limit: usize) -> Vec<Peer> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::ClosestNodes {
                target,
                limit,
                reply,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn one_node_per_bucket(&self) -> Vec<Peer> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::OneNodePerBucket { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn all_peers(&self) -> Vec<Peer> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::AllPeers { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn remove_node(&self, id: NodeId) {
        let _ = self.cmd_tx.send(Command::RemoveNode { id }).await;
    }

    pub async fn node_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::NodeCount { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Stop the actor. In-flight requests resolve as `Closed`.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    // ------------------------------------------------------------------

    /// The key to encrypt an outbound payload for: `None` for payloads that
    /// must travel plaintext, otherwise the peer's known key, learned via a
    /// plaintext `PING` if necessary (the recursion bottoms out because
    /// `PING` itself never needs a key).
    async fn resolve_recipient_key(
        &self,
        peer: &Peer,
        payload: &Payload,
    ) -> Result<Option<[u8; 32]>, RpcError> {
        if payload.must_be_plaintext() {
            return Ok(None);
        }
        if let Some(key) = peer.public_key {
            return Ok(Some(key));
        }
        if let Some(known) = self.get_node(peer.id).await {
            if let Some(key) = known.public_key {
                return Ok(Some(key));
            }
        }
        // Boxed: `ping` lands back here via `send_and_wait`, and the
        // compiler cannot size the recursive future even though `PING`
        // itself takes the plaintext early return.
        let key = Box::pin(self.ping(peer)).await?;
        Ok(Some(key))
    }
}

// ============================================================================
// Actor
// ============================================================================

struct PendingEntry {
    kind: MessageKind,
    tx: oneshot::Sender<Body>,
}

struct RpcActor {
    socket: Arc<UdpSocket>,
    keypair: Arc<Keypair>,
    table: RoutingTable,
    /// In-flight requests and registered chunk slots, keyed by message id.
    pending: HashMap<String, PendingEntry>,
    store: Arc<dyn ValueStore>,
    /// Handle to ourselves, cloned into spawned handler tasks.
    handle: RpcNode,
    nodes_per_bucket: usize,
    chunk_size: usize,
}

impl RpcActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Quit) | None => {
                            debug!(node = %self.handle.node_id, "rpc transport shutting down");
                            break;
                        }
                        Some(cmd) => self.on_command(cmd).await,
                    }
                }
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, from)) => self.on_datagram(&buf[..len], from).await,
                        Err(err) => warn!(error = %err, "socket receive failed"),
                    }
                }
            }
        }
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Request {
                to,
                body,
                recipient_key,
                pending,
            } => {
                // Seal before registering anything pending: a local framing
                // failure must fail the caller immediately, not idle out the
                // timeout and evict a peer that was never contacted.
                let datagram =
                    match envelope::seal_body(&body, &self.keypair, recipient_key.as_ref()) {
                        Ok(datagram) => datagram,
                        Err(err) => {
                            debug!(to = %to, id = %body.id, error = %err, "cannot frame request");
                            drop(pending);
                            return;
                        }
                    };
                if let Some(tx) = pending {
                    self.pending.insert(
                        body.id.clone(),
                        PendingEntry {
                            kind: body.payload.kind(),
                            tx,
                        },
                    );
                }
                trace!(to = %to, kind = %body.payload.kind(), id = %body.id, "sending request");
                if let Err(err) = self.socket.send_to(&datagram, to).await {
                    debug!(to = %to, error = %err, "datagram send failed");
                }
            }
            Command::RegisterSlot { id, kind, tx } => {
                self.pending.insert(id, PendingEntry { kind, tx });
            }
            Command::CancelPending { id, evict } => {
                if self.pending.remove(&id).is_some() {
                    if let Some(peer_id) = evict {
                        debug!(peer = %peer_id, "evicting unresponsive peer");
                        self.table.remove_node(&peer_id);
                    }
                }
            }
            Command::Redeliver { data, from } => {
                self.process_datagram(&data, from, false).await;
            }
            Command::AddCandidate { peer } => self.offer_candidate(peer),
            Command::GetNode { id, reply } => {
                let _ = reply.send(self.table.get_node(&id).cloned());
            }
            Command::ClosestNodes {
                target,
                limit,
                reply,
            } => {
                let _ = reply.send(self.table.closest_nodes(&target, limit));
            }
            Command::OneNodePerBucket { reply } => {
                let _ = reply.send(self.table.one_node_per_bucket());
            }
            Command::AllPeers { reply } => {
                let _ = reply.send(self.table.all_peers());
            }
            Command::RemoveNode { id } => {
                self.table.remove_node(&id);
            }
            Command::NodeCount { reply } => {
                let _ = reply.send(self.table.node_count());
            }
            Command::Quit => unreachable!("handled in run"),
        }
    }

    // ------------------------------------------------------------------
    // Inbound pipeline
    // ------------------------------------------------------------------

    async fn on_datagram(&mut self, data: &[u8], from: SocketAddr) {
        self.process_datagram(data, from, true).await;
    }

    /// `may_learn` guards the unknown-key hold-and-ping path so a redelivered
    /// datagram whose sender still has no table entry (full bucket) is
    /// dropped instead of looping.
    async fn process_datagram(&mut self, data: &[u8], from: SocketAddr, may_learn: bool) {
        let opened = match envelope::open(data, &self.keypair) {
            Ok(opened) => opened,
            Err(err) => {
                trace!(from = %from, error = %err, "dropping malformed datagram");
                return;
            }
        };

        // Resolve the claimed sender. PING traffic carries the key inline
        // (and must hash to the claimed id); everything else relies on the
        // routing table having seen this peer before.
        let peer = match &opened.body.payload {
            Payload::Ping { public_key } | Payload::PingReply { public_key } => {
                match Peer::from_public_key(*public_key, from, Some(opened.body.node_id)) {
                    Ok(peer) => peer,
                    Err(err) => {
                        debug!(from = %from, error = %err, "dropping datagram with forged id");
                        return;
                    }
                }
            }
            _ => match self.table.get_node(&opened.body.node_id) {
                Some(known) => {
                    let mut peer = known.clone();
                    peer.addr = from;
                    peer
                }
                None => Peer::new(opened.body.node_id, from),
            },
        };

        let Some(public_key) = peer.public_key else {
            if !may_learn {
                trace!(peer = %peer.id, "sender key still unknown, dropping datagram");
                return;
            }
            // Unknown key means unverifiable. Hold the datagram, learn the
            // key with a direct ping, then feed it back through the intake.
            trace!(peer = %peer.id, "unknown sender key, pinging to learn it");
            let handle = self.handle.clone();
            let held = data.to_vec();
            tokio::spawn(async move {
                if handle.ping(&peer).await.is_ok() {
                    handle.redeliver(held, from).await;
                }
            });
            return;
        };

        if let Err(err) = opened.verify(&public_key) {
            debug!(peer = %peer.id, error = %err, "signature check failed, evicting sender");
            self.table.remove_node(&opened.body.node_id);
            return;
        }

        let body = opened.body;
        self.offer_candidate(peer.clone());

        if body.payload.is_reply() {
            self.resolve_pending(body);
        } else {
            self.handle_request(peer, public_key, body).await;
        }
    }

    /// Resolve a pending request if both the id and the kind line up; late
    /// or unknown replies fall through silently.
    fn resolve_pending(&mut self, body: Body) {
        let answers = self
            .pending
            .get(&body.id)
            .map(|entry| body.payload.answers(entry.kind))
            .unwrap_or(false);
        if !answers {
            trace!(id = %body.id, kind = %body.payload.kind(), "ignoring late or unmatched reply");
            return;
        }
        if let Some(entry) = self.pending.remove(&body.id) {
            // Receiver may have timed out between our check and this send.
            let _ = entry.tx.send(body);
        }
    }

    /// Offer a verified sender to the routing table. On a full bucket the
    /// candidate sits in the replacement cache while a background task
    /// liveness-checks the least-recently-seen members; the first eviction
    /// promotes the candidate. Never blocks the datagram that triggered it.
    fn offer_candidate(&mut self, peer: Peer) {
        match self.table.add_candidate(peer) {
            AddOutcome::Added | AddOutcome::SelfId => {}
            AddOutcome::BucketFull { members } => {
                let handle = self.handle.clone();
                tokio::spawn(async move {
                    for member in members.into_iter().rev() {
                        match handle.ping(&member).await {
                            // Timeout already evicted the member, which
                            // promoted the cached candidate.
                            Err(RpcError::Timeout { .. }) => break,
                            Err(_) => break,
                            Ok(_) => {}
                        }
                    }
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Request handlers
    // ------------------------------------------------------------------

    async fn handle_request(&mut self, peer: Peer, peer_key: [u8; 32], body: Body) {
        trace!(peer = %peer.id, kind = %body.payload.kind(), id = %body.id, "handling request");
        let Body { id, payload, .. } = body;
        match payload {
            Payload::Ping { .. } => {
                let reply = Body {
                    id,
                    node_id: self.handle.node_id,
                    payload: Payload::PingReply {
                        public_key: self.handle.public_key,
                    },
                };
                transmit(&self.socket, &self.keypair, &reply, None, peer.addr).await;
            }

            Payload::FindNode { target } => {
                let peers = self
                    .table
                    .closest_nodes(&target, self.nodes_per_bucket)
                    .iter()
                    .map(Peer::info)
                    .collect();
                let reply = Body {
                    id,
                    node_id: self.handle.node_id,
                    payload: Payload::FindNodeReply { peers },
                };
                transmit(&self.socket, &self.keypair, &reply, Some(&peer_key), peer.addr).await;
            }

            Payload::Store { key, value } => {
                let store = self.store.clone();
                let socket = self.socket.clone();
                let keypair = self.keypair.clone();
                let node_id = self.handle.node_id;
                tokio::spawn(async move {
                    let ack = match store.save_raw(key, value).await {
                        Ok(ack) => ack,
                        Err(err) => {
                            debug!(key = %key, error = %err, "store rejected a value");
                            crate::store::StoreAck::WillNotStore
                        }
                    };
                    let reply = Body {
                        id,
                        node_id,
                        payload: Payload::StoreReply { ack },
                    };
                    transmit(&socket, &keypair, &reply, Some(&peer_key), peer.addr).await;
                });
            }

            Payload::FindValue { key } => {
                // Fallback peers are computed now; the store probe runs off
                // the actor loop.
                let closest: Vec<_> = self
                    .table
                    .closest_nodes(&key, self.nodes_per_bucket)
                    .iter()
                    .map(Peer::info)
                    .collect();
                let store = self.store.clone();
                let socket = self.socket.clone();
                let keypair = self.keypair.clone();
                let node_id = self.handle.node_id;
                tokio::spawn(async move {
                    let result = match store.get_value(&key).await {
                        Ok(Some(crate::store::Value::Raw(data))) => {
                            FindValueResult::Value(WireValue::Raw(data))
                        }
                        Ok(Some(crate::store::Value::Partial { length })) => {
                            FindValueResult::Value(WireValue::Partial { length })
                        }
                        Ok(None) => FindValueResult::Peers(closest),
                        Err(err) => {
                            debug!(key = %key, error = %err, "value lookup failed locally");
                            FindValueResult::Peers(closest)
                        }
                    };
                    let reply = Body {
                        id,
                        node_id,
                        payload: Payload::FindValueReply { result },
                    };
                    transmit(&socket, &keypair, &reply, Some(&peer_key), peer.addr).await;
                });
            }

            Payload::PingForward { target } => {
                // Relay a ping to the target, reusing the requester's
                // message id one hop further, then report the target's key
                // back. Best-effort on both hops.
                let handle = self.handle.clone();
                let socket = self.socket.clone();
                let keypair = self.keypair.clone();
                let node_id = self.handle.node_id;
                tokio::spawn(async move {
                    let target_peer = Peer::from(target);
                    match handle.ping_with_id(&target_peer, Some(id.clone())).await {
                        Ok(target_key) => {
                            let reply = Body {
                                id,
                                node_id,
                                payload: Payload::PingForwardReply {
                                    public_key: target_key,
                                },
                            };
                            transmit(&socket, &keypair, &reply, Some(&peer_key), peer.addr).await;
                        }
                        Err(err) => {
                            debug!(target = %target_peer.id, error = %err, "ping forward failed");
                        }
                    }
                });
            }

            Payload::PartialValue { key, offsets } => {
                let store = self.store.clone();
                let socket = self.socket.clone();
                let keypair = self.keypair.clone();
                let node_id = self.handle.node_id;
                let chunk_size = self.chunk_size;
                tokio::spawn(async move {
                    let chunks = match store.for_each_chunk(&key, &offsets, chunk_size).await {
                        Ok(chunks) => chunks,
                        Err(err) => {
                            debug!(key = %key, error = %err, "cannot serve chunks");
                            return;
                        }
                    };
                    // One individually addressed reply per chunk; the
                    // requester may have given up already.
                    for (offset, chunk) in chunks {
                        let reply = Body {
                            id: crate::messages::chunk_reply_id(offset, &id),
                            node_id,
                            payload: Payload::PartialValueReply { offset, chunk },
                        };
                        transmit(&socket, &keypair, &reply, Some(&peer_key), peer.addr).await;
                    }
                });
            }

            // Replies never reach this path.
            _ => {}
        }
    }
}

/// Seal and transmit one body. Failures are logged and swallowed; datagram
/// delivery is best-effort by nature.
async fn transmit(
    socket: &UdpSocket,
    keypair: &Keypair,
    body: &Body,
    recipient: Option<&[u8; 32]>,
    to: SocketAddr,
) {
    match envelope::seal_body(body, keypair, recipient) {
        Ok(datagram) => {
            if let Err(err) = socket.send_to(&datagram, to).await {
                debug!(to = %to, error = %err, "datagram send failed");
            }
        }
        Err(err) => {
            debug!(to = %to, error = %err, "failed to seal outbound datagram");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryValueStore, StoreAck};

    async fn test_node() -> (RpcNode, Arc<MemoryValueStore>) {
        let store = Arc::new(MemoryValueStore::new());
        let node = RpcNode::bind(
            Keypair::generate(),
            store.clone(),
            RpcConfig::default(),
        )
        .await
        .unwrap();
        (node, store)
    }

    #[tokio::test]
    async fn ping_learns_keys_and_populates_tables() {
        let (a, _) = test_node().await;
        let (b, _) = test_node().await;

        let b_as_seen_by_a = Peer::new(b.node_id(), b.local_addr());
        let key = a.ping(&b_as_seen_by_a).await.unwrap();
        assert_eq!(key, b.public_key());

        // Both sides saw verified traffic from the other.
        assert_eq!(a.node_count().await, 1);
        assert_eq!(b.node_count().await, 1);
        assert_eq!(
            a.get_node(b.node_id()).await.unwrap().public_key,
            Some(b.public_key())
        );
    }

    #[tokio::test]
    async fn find_node_returns_known_peers() {
        let (a, _) = test_node().await;
        let (b, _) = test_node().await;
        let (c, _) = test_node().await;

        // b learns about c, then a asks b for nodes near c's id.
        b.ping(&Peer::new(c.node_id(), c.local_addr())).await.unwrap();
        let peers = a
            .find_node(&Peer::new(b.node_id(), b.local_addr()), c.node_id())
            .await
            .unwrap();
        assert!(peers.iter().any(|p| p.id == c.node_id()));
    }

    #[tokio::test]
    async fn store_then_find_value_round_trip() {
        let (a, _) = test_node().await;
        let (b, b_store) = test_node().await;

        let key = NodeId::for_key(b"round-trip");
        let b_peer = Peer::new(b.node_id(), b.local_addr());

        let ack = a.store(&b_peer, key, b"hello".to_vec()).await.unwrap();
        assert_eq!(ack, StoreAck::Stored);
        assert_eq!(b_store.len().await, 1);

        let ack = a.store(&b_peer, key, b"hello".to_vec()).await.unwrap();
        assert_eq!(ack, StoreAck::Exists);

        match a.find_value(&b_peer, key).await.unwrap() {
            FindValueResult::Value(WireValue::Raw(data)) => assert_eq!(data, b"hello"),
            other => panic!("expected raw value, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn find_value_miss_returns_peers() {
        let (a, _) = test_node().await;
        let (b, _) = test_node().await;

        let key = NodeId::for_key(b"nowhere");
        match a
            .find_value(&Peer::new(b.node_id(), b.local_addr()), key)
            .await
            .unwrap()
        {
            FindValueResult::Peers(_) => {}
            other => panic!("expected peer list, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn timeout_evicts_the_unresponsive_peer() {
        let (a, _) = test_node().await;
        let (b, _) = test_node().await;

        let b_peer = Peer::new(b.node_id(), b.local_addr());
        a.ping(&b_peer).await.unwrap();
        assert_eq!(a.node_count().await, 1);

        b.quit().await;
        // Give the actor a moment to drop the socket.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let err = a.ping(&b_peer).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));
        assert_eq!(a.node_count().await, 0);
    }

    #[tokio::test]
    async fn unframeable_request_fails_fast_without_evicting() {
        let (a, _) = test_node().await;
        let (b, _) = test_node().await;

        let b_peer = Peer::new(b.node_id(), b.local_addr());
        a.ping(&b_peer).await.unwrap();
        assert_eq!(a.node_count().await, 1);

        // Far past the serialize bound, so the request can never be framed.
        let started = std::time::Instant::now();
        let err = a
            .store(&b_peer, NodeId::for_key(b"too-big"), vec![0u8; 64 * 1024])
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Closed));
        assert!(started.elapsed() < MessageKind::Store.timeout());
        // b was never contacted and must not be evicted.
        assert_eq!(a.node_count().await, 1);
    }

    #[tokio::test]
    async fn request_from_a_forgotten_sender_is_held_until_its_key_returns() {
        let (a, _) = test_node().await;
        let (b, _) = test_node().await;

        let b_peer = Peer::new(b.node_id(), b.local_addr());
        a.ping(&b_peer).await.unwrap();

        // b forgets a entirely; a's next encrypted request arrives from a
        // sender b cannot verify yet.
        b.remove_node(a.node_id()).await;
        assert_eq!(b.node_count().await, 0);

        let peers = a.find_node(&b_peer, a.node_id()).await.unwrap();
        assert!(peers.iter().any(|p| p.id == a.node_id()));
        // b re-learned a while answering the held request.
        assert!(b.get_node(a.node_id()).await.is_some());
    }

    #[tokio::test]
    async fn duplicate_reply_resolves_a_pending_entry_only_once() {
        let keypair = Keypair::generate();
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let local_addr = socket.local_addr().unwrap();
        let (cmd_tx, _cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let handle = RpcNode {
            cmd_tx,
            node_id: keypair.node_id(),
            public_key: keypair.public_key_bytes(),
            local_addr,
        };
        let table = RoutingTable::with_defaults(handle.node_id());
        let mut actor = RpcActor {
            socket,
            keypair: Arc::new(keypair),
            table,
            pending: HashMap::new(),
            store: Arc::new(MemoryValueStore::new()),
            handle,
            nodes_per_bucket: DEFAULT_NODES_PER_BUCKET,
            chunk_size: crate::messages::CHUNK_SIZE,
        };

        let responder = Keypair::generate();
        let (tx, mut rx) = oneshot::channel();
        actor.pending.insert(
            "7_deadbeef".to_string(),
            PendingEntry {
                kind: MessageKind::Ping,
                tx,
            },
        );

        let reply = Body {
            id: "7_deadbeef".to_string(),
            node_id: responder.node_id(),
            payload: Payload::PingReply {
                public_key: responder.public_key_bytes(),
            },
        };
        actor.resolve_pending(reply.clone());
        assert!(rx.try_recv().is_ok());
        assert!(actor.pending.is_empty());

        // A late duplicate falls through without a second resolution.
        actor.resolve_pending(reply);
        assert!(actor.pending.is_empty());
    }

    #[tokio::test]
    async fn garbage_datagrams_are_ignored() {
        let (a, _) = test_node().await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"not an envelope", a.local_addr()).await.unwrap();
        sender.send_to(&[1, 2, 3, 4], a.local_addr()).await.unwrap();

        // Still healthy afterwards.
        let (b, _) = test_node().await;
        a.ping(&Peer::new(b.node_id(), b.local_addr())).await.unwrap();
        assert_eq!(a.node_count().await, 1);
    }

    #[tokio::test]
    async fn ping_forward_relays_through_a_middleman() {
        let (a, _) = test_node().await;
        let (b, _) = test_node().await;
        let (c, _) = test_node().await;

        let b_peer = Peer::new(b.node_id(), b.local_addr());
        a.ping(&b_peer).await.unwrap();

        let key = a
            .ping_forward(&b_peer, Peer::new(c.node_id(), c.local_addr()))
            .await
            .unwrap();
        assert_eq!(key, c.public_key());
        // The relay learned the target along the way.
        assert!(b.get_node(c.node_id()).await.is_some());
    }
}
