//! # Routing Table
//!
//! A fixed array of 256 buckets indexed by shared-prefix length between the
//! local id and a candidate id. Each bucket keeps at most `k` peers ordered
//! most-recently-verified first, plus a bounded LRU replacement cache of
//! overflow candidates.
//!
//! The table itself never does I/O. When a bucket is full, `add_candidate`
//! parks the newcomer in the cache and hands the current members back to the
//! caller, which pings the least-recently-seen ones and calls `remove_node`
//! for non-responders; removal pulls the freshest cache entry in to fill the
//! vacancy.

use std::num::NonZeroUsize;

use lru::LruCache;
use rand::seq::SliceRandom;

use crate::identity::{distance_cmp, NodeId, Peer, KEYSPACE_BITS};

/// Peers per bucket (the Kademlia `k`).
pub const DEFAULT_NODES_PER_BUCKET: usize = 20;

/// Replacement cache entries per bucket.
pub const DEFAULT_REPLACEMENT_CACHE_SIZE: usize = 100;

/// Outcome of offering a peer to the table.
#[derive(Debug)]
pub enum AddOutcome {
    /// Inserted, or an existing entry moved to the front of its bucket.
    Added,
    /// The local node's own id is never stored.
    SelfId,
    /// The bucket is full. The candidate went into the replacement cache;
    /// `members` is the bucket's current occupancy, least-recently-seen
    /// last, for the caller to liveness-check.
    BucketFull { members: Vec<Peer> },
}

// ============================================================================
// Bucket
// ============================================================================

struct Bucket {
    /// Most-recently-verified first.
    peers: Vec<Peer>,
    cache: LruCache<NodeId, Peer>,
}

impl Bucket {
    fn new(cache_size: usize) -> Self {
        let cap = NonZeroUsize::new(cache_size.max(1)).unwrap();
        Self {
            peers: Vec::new(),
            cache: LruCache::new(cap),
        }
    }

    /// Move an existing entry to the front, refreshing its key/address if
    /// the caller learned newer ones.
    fn refresh(&mut self, peer: &Peer) -> bool {
        if let Some(pos) = self.peers.iter().position(|p| p.id == peer.id) {
            let mut existing = self.peers.remove(pos);
            existing.addr = peer.addr;
            if peer.public_key.is_some() {
                existing.public_key = peer.public_key;
            }
            self.peers.insert(0, existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &NodeId) -> Option<Peer> {
        let pos = self.peers.iter().position(|p| &p.id == id)?;
        let removed = self.peers.remove(pos);
        // Vacancy: promote the freshest cached candidate.
        if let Some(key) = self.cache.iter().next().map(|(id, _)| *id) {
            if let Some(promoted) = self.cache.pop(&key) {
                self.peers.push(promoted);
            }
        }
        Some(removed)
    }
}

// ============================================================================
// RoutingTable
// ============================================================================

pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, num_buckets: usize, k: usize, cache_size: usize) -> Self {
        let mut buckets = Vec::with_capacity(num_buckets);
        for _ in 0..num_buckets {
            buckets.push(Bucket::new(cache_size));
        }
        Self {
            self_id,
            k,
            buckets,
        }
    }

    pub fn with_defaults(self_id: NodeId) -> Self {
        Self::new(
            self_id,
            KEYSPACE_BITS,
            DEFAULT_NODES_PER_BUCKET,
            DEFAULT_REPLACEMENT_CACHE_SIZE,
        )
    }

    /// Bucket slot for an id: `num_buckets - shared_prefix_bits - 1`,
    /// clamped into range. Deterministic in the XOR distance alone.
    pub fn bucket_index(&self, id: &NodeId) -> usize {
        let dist = self.self_id.xor_distance(id);
        let mut shared = 0usize;
        for byte in dist.iter() {
            if *byte == 0 {
                shared += 8;
            } else {
                shared += byte.leading_zeros() as usize;
                break;
            }
        }
        let num_buckets = self.buckets.len();
        num_buckets.saturating_sub(shared + 1).min(num_buckets - 1)
    }

    /// Offer a peer. Re-offers of a known id are a move-to-front, not a
    /// duplicate; a full bucket parks the candidate in its cache.
    pub fn add_candidate(&mut self, peer: Peer) -> AddOutcome {
        if peer.id == self.self_id {
            return AddOutcome::SelfId;
        }
        let idx = self.bucket_index(&peer.id);
        let bucket = &mut self.buckets[idx];

        if bucket.refresh(&peer) {
            return AddOutcome::Added;
        }
        if bucket.peers.len() < self.k {
            bucket.peers.insert(0, peer);
            return AddOutcome::Added;
        }

        let members = bucket.peers.clone();
        bucket.cache.put(peer.id, peer);
        AddOutcome::BucketFull { members }
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&Peer> {
        let idx = self.bucket_index(id);
        self.buckets[idx].peers.iter().find(|p| &p.id == id)
    }

    /// Remove a peer (timeout or failed signature), refilling the vacancy
    /// from the bucket's replacement cache.
    pub fn remove_node(&mut self, id: &NodeId) -> Option<Peer> {
        let idx = self.bucket_index(id);
        self.buckets[idx].remove(id)
    }

    /// Up to `limit` peers near `target`, gathered by walking buckets
    /// outward from the target's home slot in alternating offsets
    /// (+1, -2, +3, -4, ...). Approximates XOR-closest order without a
    /// full sort; the collected set is sorted exactly before returning.
    pub fn closest_nodes(&self, target: &NodeId, limit: usize) -> Vec<Peer> {
        if limit == 0 {
            return Vec::new();
        }
        let home = self.bucket_index(target) as isize;
        let num_buckets = self.buckets.len() as isize;

        let mut collected: Vec<Peer> = Vec::new();
        let mut idx = home;
        let mut step = 1isize;
        let mut visited = 0isize;
        while visited < num_buckets {
            if (0..num_buckets).contains(&idx) {
                collected.extend(self.buckets[idx as usize].peers.iter().cloned());
                visited += 1;
                if collected.len() >= limit {
                    break;
                }
            }
            idx += step;
            step = -(step + step.signum());
        }

        collected.sort_by(|a, b| {
            let da = a.id.xor_distance(target);
            let db = b.id.xor_distance(target);
            distance_cmp(&da, &db)
        });
        collected.truncate(limit);
        collected
    }

    /// One randomly chosen peer per non-empty bucket (bucket refresh seeds).
    pub fn one_node_per_bucket(&self) -> Vec<Peer> {
        let mut rng = rand::thread_rng();
        self.buckets
            .iter()
            .filter_map(|bucket| bucket.peers.choose(&mut rng).cloned())
            .collect()
    }

    /// Every active peer in the table (keep-alive sweep).
    pub fn all_peers(&self) -> Vec<Peer> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.peers.iter().cloned())
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.node_count() == 0
    }
}
