//! # DHT Facade and Lookup Engine
//!
//! The only component the rest of a node calls into. [`Dht::bootstrap`]
//! binds the transport, joins the overlay through an optional bootstrap
//! peer, and arms the maintenance timers; [`Dht::save`] and [`Dht::fetch`]
//! move values in and out of the overlay.
//!
//! The lookup engine is the canonical iterative Kademlia search: each round
//! takes the closest known unqueried peers, fans out at most α concurrent
//! `FIND_NODE`/`FIND_VALUE` queries, folds the answers back into the routing
//! table, and stops exactly when no unqueried presumed-closer peer remains.
//! Termination is driven by growth of the `already_queried` set, not a fixed
//! round count.
//!
//! Newly learned peers are not trusted blindly: each is staged with a direct
//! `PING` (and a `PING_FORWARD` relayed through whoever reported it, so both
//! sides of a NAT get a working mapping) and only enters the routing table
//! once its verified reply arrives through the normal intake path.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::identity::{Keypair, NodeId, Peer, KEYSPACE_BITS};
use crate::messages::{FindValueResult, WireValue, CHUNK_SIZE};
use crate::routing::{DEFAULT_NODES_PER_BUCKET, DEFAULT_REPLACEMENT_CACHE_SIZE};
use crate::rpc::{RpcConfig, RpcNode};
use crate::store::{StoreAck, Value, ValueStore};
use crate::transfer;

/// Lookup fan-out per round (the Kademlia α).
pub const DEFAULT_CONCURRENCY: usize = 5;

/// NAT keep-alive sweep period.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Bucket refresh period.
const REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Republish period for locally saved keys.
const REPUBLISH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Largest value length a peer may advertise before `fetch` refuses to
/// start a transfer from it.
pub const DEFAULT_MAX_VALUE_LENGTH: u64 = 16 * 1024 * 1024;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct DhtConfig {
    pub bind_addr: SocketAddr,
    /// Address of a node already in the overlay, if joining one.
    pub bootstrap: Option<SocketAddr>,
    pub concurrency: usize,
    pub nodes_per_bucket: usize,
    pub num_buckets: usize,
    pub chunk_size: usize,
    pub replacement_cache_size: usize,
    /// Ceiling on peer-advertised value lengths.
    pub max_value_length: u64,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".parse().expect("static addr"),
            bootstrap: None,
            concurrency: DEFAULT_CONCURRENCY,
            nodes_per_bucket: DEFAULT_NODES_PER_BUCKET,
            num_buckets: KEYSPACE_BITS,
            chunk_size: CHUNK_SIZE,
            replacement_cache_size: DEFAULT_REPLACEMENT_CACHE_SIZE,
            max_value_length: DEFAULT_MAX_VALUE_LENGTH,
        }
    }
}

impl DhtConfig {
    fn rpc_config(&self) -> RpcConfig {
        RpcConfig {
            bind_addr: self.bind_addr,
            num_buckets: self.num_buckets,
            nodes_per_bucket: self.nodes_per_bucket,
            replacement_cache_size: self.replacement_cache_size,
            chunk_size: self.chunk_size,
        }
    }
}

// ============================================================================
// Errors and results
// ============================================================================

#[derive(Debug)]
pub enum DhtError {
    /// Lookup exhausted every candidate without finding the value.
    ValueNotFound { key: NodeId },
    Store(anyhow::Error),
    Io(std::io::Error),
}

impl fmt::Display for DhtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DhtError::ValueNotFound { key } => write!(f, "value not found for {key}"),
            DhtError::Store(err) => write!(f, "store failed: {err}"),
            DhtError::Io(err) => write!(f, "io failed: {err}"),
        }
    }
}

impl std::error::Error for DhtError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DhtError::Store(err) => err.source(),
            DhtError::Io(err) => Some(err),
            DhtError::ValueNotFound { .. } => None,
        }
    }
}

/// Per-peer tally of a `save` replication pass. `STORED` and `EXISTS`
/// acknowledgements count as success; `WILL_NOT_STORE` and timeouts as
/// failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SaveOutcome {
    pub success: usize,
    pub fail: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LookupMode {
    Node,
    Value,
}

/// What one lookup invocation produced.
#[derive(Debug)]
struct LookupOutcome {
    /// Closest known peers at termination (NODE mode result).
    closest: Vec<Peer>,
    /// The value and every peer that reported it, when VALUE mode hit.
    found: Option<(WireValue, Vec<Peer>)>,
}

enum QueryAnswer {
    Peers(Vec<Peer>),
    Value(WireValue),
}

// ============================================================================
// Dht
// ============================================================================

/// A running DHT node. Cheap to clone; clones share the transport and
/// store.
#[derive(Clone)]
pub struct Dht {
    rpc: RpcNode,
    store: Arc<dyn ValueStore>,
    config: DhtConfig,
    /// Keys saved through this node, re-replicated by the republish timer.
    saved_keys: Arc<Mutex<HashSet<NodeId>>>,
    timers: Arc<Vec<JoinHandle<()>>>,
}

impl Dht {
    /// Bind the transport, optionally join an overlay through a bootstrap
    /// peer (ping, self-lookup, bucket refresh), and arm the maintenance
    /// timers.
    pub async fn bootstrap(
        keypair: Keypair,
        store: Arc<dyn ValueStore>,
        config: DhtConfig,
    ) -> Result<Self, DhtError> {
        let rpc = RpcNode::bind(keypair, store.clone(), config.rpc_config())
            .await
            .map_err(DhtError::Io)?;

        let mut dht = Self {
            rpc,
            store,
            config,
            saved_keys: Arc::new(Mutex::new(HashSet::new())),
            timers: Arc::new(Vec::new()),
        };

        if let Some(addr) = dht.config.bootstrap {
            dht.join(addr).await?;
        }
        dht.timers = Arc::new(dht.spawn_timers());

        info!(
            node = %dht.rpc.node_id(),
            addr = %dht.rpc.local_addr(),
            bootstrap = ?dht.config.bootstrap,
            "dht node up"
        );
        Ok(dht)
    }

    pub fn node_id(&self) -> NodeId {
        self.rpc.node_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.rpc.local_addr()
    }

    pub fn rpc(&self) -> &RpcNode {
        &self.rpc
    }

    /// Stop timers and the transport. In-flight calls resolve as closed.
    pub async fn shutdown(&self) {
        for timer in self.timers.iter() {
            timer.abort();
        }
        self.rpc.quit().await;
    }

    async fn join(&self, addr: SocketAddr) -> Result<(), DhtError> {
        // The bootstrap peer's id is unknown until it answers; the ping
        // reply carries its key and the intake derives and verifies the id.
        let placeholder = Peer::new(NodeId::for_key(addr.to_string().as_bytes()), addr);
        if let Err(err) = self.rpc.ping(&placeholder).await {
            // A dead bootstrap peer is not fatal; run standalone and let
            // inbound traffic populate the table.
            warn!(addr = %addr, error = %err, "bootstrap peer not answering, continuing standalone");
            return Ok(());
        }

        // Populate the table around our own id, then seed every occupied
        // distance range.
        self.find_closest_nodes(self.rpc.node_id(), LookupMode::Node)
            .await?;
        self.refresh_buckets().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // save / fetch
    // ------------------------------------------------------------------

    /// Store a value locally and replicate it to the closest nodes to its
    /// key. The key is remembered for periodic republish.
    pub async fn save(&self, key: NodeId, value: Vec<u8>) -> Result<SaveOutcome, DhtError> {
        self.store
            .save_raw(key, value.clone())
            .await
            .map_err(DhtError::Store)?;
        self.saved_keys.lock().await.insert(key);
        Ok(self.replicate(key, value).await)
    }

    async fn replicate(&self, key: NodeId, value: Vec<u8>) -> SaveOutcome {
        let closest = match self.find_closest_nodes(key, LookupMode::Node).await {
            Ok(outcome) => outcome.closest,
            Err(_) => Vec::new(),
        };

        let mut outcome = SaveOutcome::default();
        let mut set = JoinSet::new();
        for peer in closest {
            let rpc = self.rpc.clone();
            let value = value.clone();
            set.spawn(async move { rpc.store(&peer, key, value).await });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(StoreAck::Stored)) | Ok(Ok(StoreAck::Exists)) => outcome.success += 1,
                Ok(Ok(StoreAck::WillNotStore)) | Ok(Err(_)) | Err(_) => outcome.fail += 1,
            }
        }
        debug!(key = %key, success = outcome.success, fail = outcome.fail, "replicated value");
        outcome
    }

    /// Resolve a key. Raw values are persisted locally and returned inline;
    /// partial values are downloaded chunk-wise from the peers that
    /// reported them (tried in turn) and persisted, with the length
    /// returned. Exhausting every candidate is `ValueNotFound`.
    pub async fn fetch(&self, key: NodeId) -> Result<Value, DhtError> {
        if let Some(local) = self.store.get_value(&key).await.map_err(DhtError::Store)? {
            return Ok(local);
        }

        let outcome = self.find_closest_nodes(key, LookupMode::Value).await?;
        let (value, reporters) = outcome
            .found
            .ok_or(DhtError::ValueNotFound { key })?;

        match value {
            WireValue::Raw(data) => {
                self.store
                    .save_raw(key, data.clone())
                    .await
                    .map_err(DhtError::Store)?;
                Ok(Value::Raw(data))
            }
            WireValue::Partial { length } => {
                for reporter in &reporters {
                    match transfer::download(
                        &self.rpc,
                        reporter,
                        key,
                        length,
                        self.config.max_value_length,
                        self.config.chunk_size,
                        &self.store,
                    )
                    .await
                    {
                        Ok(()) => return Ok(Value::Partial { length }),
                        Err(err) => {
                            debug!(key = %key, peer = %reporter.id, error = %err, "transfer failed, trying next reporter");
                        }
                    }
                }
                Err(DhtError::ValueNotFound { key })
            }
        }
    }

    // ------------------------------------------------------------------
    // Lookup engine
    // ------------------------------------------------------------------

    async fn find_closest_nodes(
        &self,
        target: NodeId,
        mode: LookupMode,
    ) -> Result<LookupOutcome, DhtError> {
        let k = self.config.nodes_per_bucket;
        let alpha = self.config.concurrency.max(1);

        let mut already_queried: HashSet<NodeId> = HashSet::new();
        already_queried.insert(self.rpc.node_id());

        loop {
            let known = self.rpc.closest_nodes(target, k).await;
            let candidates: Vec<Peer> = known
                .iter()
                .filter(|p| !already_queried.contains(&p.id))
                .take(alpha)
                .cloned()
                .collect();

            if candidates.is_empty() {
                // No unqueried presumed-closer peer remains.
                return match mode {
                    LookupMode::Node => Ok(LookupOutcome {
                        closest: known,
                        found: None,
                    }),
                    LookupMode::Value => Err(DhtError::ValueNotFound { key: target }),
                };
            }

            let mut round = JoinSet::new();
            for peer in candidates {
                already_queried.insert(peer.id);
                let rpc = self.rpc.clone();
                round.spawn(async move {
                    let answer = match mode {
                        LookupMode::Node => rpc
                            .find_node(&peer, target)
                            .await
                            .map(QueryAnswer::Peers),
                        LookupMode::Value => {
                            rpc.find_value(&peer, target).await.map(|result| match result {
                                FindValueResult::Peers(peers) => QueryAnswer::Peers(
                                    peers.into_iter().map(Peer::from).collect(),
                                ),
                                FindValueResult::Value(value) => QueryAnswer::Value(value),
                            })
                        }
                    };
                    (peer, answer)
                });
            }

            let mut found: Option<(WireValue, Vec<Peer>)> = None;
            while let Some(joined) = round.join_next().await {
                let (responder, answer) = match joined {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "lookup query task failed");
                        continue;
                    }
                };
                match answer {
                    Ok(QueryAnswer::Peers(peers)) => {
                        self.stage_discovered_peers(&responder, peers, &already_queried)
                            .await;
                    }
                    Ok(QueryAnswer::Value(value)) => match &mut found {
                        Some((_, reporters)) => reporters.push(responder),
                        None => found = Some((value, vec![responder])),
                    },
                    // Timeouts already evicted the peer; the next round's
                    // candidate set reflects that.
                    Err(err) => {
                        trace!(peer = %responder.id, error = %err, "lookup query failed");
                    }
                }
            }

            if found.is_some() {
                return Ok(LookupOutcome {
                    closest: known,
                    found,
                });
            }
        }
    }

    /// Make freshly reported peers reachable before the next round relies
    /// on them: a direct ping opens our side of the NAT mapping and, once
    /// answered, puts the peer in the routing table through the verified
    /// intake path; a relayed `PING_FORWARD` through the reporter opens the
    /// other side. The relay leg is fire-and-forget.
    async fn stage_discovered_peers(
        &self,
        reporter: &Peer,
        peers: Vec<Peer>,
        already_queried: &HashSet<NodeId>,
    ) {
        let mut staging = JoinSet::new();
        for peer in peers {
            if peer.id == self.rpc.node_id() || already_queried.contains(&peer.id) {
                continue;
            }
            if self.rpc.get_node(peer.id).await.is_some() {
                continue;
            }

            let rpc = self.rpc.clone();
            let via = reporter.clone();
            let forwarded = peer.clone();
            tokio::spawn(async move {
                let _ = rpc.ping_forward(&via, forwarded).await;
            });

            let rpc = self.rpc.clone();
            staging.spawn(async move {
                if let Err(err) = rpc.ping(&peer).await {
                    trace!(peer = %peer.id, error = %err, "staged peer unreachable");
                }
            });
        }
        while staging.join_next().await.is_some() {}
    }

    /// Run a closest-node lookup seeded from one random peer per non-empty
    /// bucket, keeping stale distance ranges populated.
    pub async fn refresh_buckets(&self) {
        for peer in self.rpc.one_node_per_bucket().await {
            if let Err(err) = self.find_closest_nodes(peer.id, LookupMode::Node).await {
                debug!(seed = %peer.id, error = %err, "bucket refresh lookup failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Maintenance timers
    // ------------------------------------------------------------------

    fn spawn_timers(&self) -> Vec<JoinHandle<()>> {
        let keep_alive = {
            let dht = self.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(KEEP_ALIVE_INTERVAL);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    dht.keep_alive_sweep().await;
                }
            })
        };
        let refresh = {
            let dht = self.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(REFRESH_INTERVAL);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    dht.refresh_buckets().await;
                }
            })
        };
        let republish = {
            let dht = self.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(REPUBLISH_INTERVAL);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    dht.republish().await;
                }
            })
        };
        vec![keep_alive, refresh, republish]
    }

    /// Ping every known peer to keep NAT bindings open. Unresponsive peers
    /// are evicted by the normal timeout path.
    async fn keep_alive_sweep(&self) {
        let peers = self.rpc.all_peers().await;
        trace!(peers = peers.len(), "keep-alive sweep");
        let mut set = JoinSet::new();
        for peer in peers {
            let rpc = self.rpc.clone();
            set.spawn(async move {
                let _ = rpc.ping(&peer).await;
            });
        }
        while set.join_next().await.is_some() {}
    }

    /// Re-replicate every key saved through this node to the current
    /// closest nodes. Only raw values can be pushed whole; chunked values
    /// are served on demand instead.
    async fn republish(&self) {
        let keys: Vec<NodeId> = self.saved_keys.lock().await.iter().copied().collect();
        debug!(keys = keys.len(), "republishing saved keys");
        for key in keys {
            match self.store.get_value(&key).await {
                Ok(Some(Value::Raw(data))) => {
                    let _ = self.replicate(key, data).await;
                }
                Ok(Some(Value::Partial { .. })) | Ok(None) => {}
                Err(err) => warn!(key = %key, error = %err, "republish read failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryValueStore;

    async fn lone_node() -> Dht {
        Dht::bootstrap(
            Keypair::generate(),
            Arc::new(MemoryValueStore::new()),
            DhtConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn empty_table_node_lookup_terminates_empty() {
        let dht = lone_node().await;
        let outcome = dht
            .find_closest_nodes(NodeId::for_key(b"anything"), LookupMode::Node)
            .await
            .unwrap();
        assert!(outcome.closest.is_empty());
        assert!(outcome.found.is_none());
    }

    #[tokio::test]
    async fn empty_table_value_lookup_fails_not_found() {
        let dht = lone_node().await;
        let err = dht
            .find_closest_nodes(NodeId::for_key(b"anything"), LookupMode::Value)
            .await
            .unwrap_err();
        assert!(matches!(err, DhtError::ValueNotFound { .. }));
    }

    #[tokio::test]
    async fn fetch_prefers_a_local_copy() {
        let dht = lone_node().await;
        let key = NodeId::for_key(b"local");
        dht.save(key, b"already here".to_vec()).await.unwrap();

        match dht.fetch(key).await.unwrap() {
            Value::Raw(data) => assert_eq!(data, b"already here"),
            other => panic!("expected raw value, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn save_tallies_per_peer_acknowledgements() {
        let a = lone_node().await;
        let b = Dht::bootstrap(
            Keypair::generate(),
            Arc::new(MemoryValueStore::new()),
            DhtConfig {
                bootstrap: Some(a.local_addr()),
                ..DhtConfig::default()
            },
        )
        .await
        .unwrap();

        let outcome = b.save(NodeId::for_key(b"tallied"), b"v".to_vec()).await.unwrap();
        assert_eq!(outcome.success, 1);
        assert_eq!(outcome.fail, 0);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn bootstrap_against_a_dead_address_continues_standalone() {
        let dht = Dht::bootstrap(
            Keypair::generate(),
            Arc::new(MemoryValueStore::new()),
            DhtConfig {
                bootstrap: Some("127.0.0.1:1".parse().unwrap()),
                ..DhtConfig::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(dht.rpc().node_count().await, 0);
        dht.shutdown().await;
    }
}
