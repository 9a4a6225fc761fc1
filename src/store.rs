//! # Value Store Collaborator
//!
//! The DHT core does not persist values itself; it delegates to a
//! [`ValueStore`] implementation behind this seam. The block/Merkle encoding
//! layer and the filesystem backend live outside this crate — what the core
//! needs is narrow:
//!
//! - store a fully-known value (`save_raw`)
//! - ask whether a key resolves locally, and whether the value fits in one
//!   datagram (`get_value` returning [`Value::Raw`] or [`Value::Partial`])
//! - assemble an incoming chunked value through a [`PartialWriter`]
//! - stream chunks back out for serving partial-value requests
//!   (`for_each_chunk`)
//!
//! [`MemoryValueStore`] is the in-process implementation used by tests and
//! by nodes that do not need durability.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::identity::NodeId;
use crate::messages::MAX_RAW_VALUE_SIZE;

/// Acknowledgement sentinels for a `STORE` request.
///
/// `Stored` and `Exists` both count as success for the saving side;
/// `WillNotStore` (or a timeout) counts as failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreAck {
    Stored,
    Exists,
    WillNotStore,
}

/// A locally-resolved value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// Fits in a single datagram; content is inline.
    Raw(Vec<u8>),
    /// Too large for one datagram; only the length is known to lookups, the
    /// content moves through the partial-value protocol.
    Partial { length: u64 },
}

/// Write handle for an in-flight chunked download.
///
/// `start` must be called before any `write_at`; `commit` makes the value
/// visible, `abort` discards it. Exactly one of commit/abort ends the
/// writer's life.
#[async_trait]
pub trait PartialWriter: Send + Sync {
    async fn start(&mut self) -> Result<()>;
    async fn write_at(&mut self, chunk: &[u8], offset: u64) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// Storage collaborator the DHT core persists through.
#[async_trait]
pub trait ValueStore: Send + Sync + 'static {
    /// Store a value whose content is already fully known.
    async fn save_raw(&self, key: NodeId, data: Vec<u8>) -> Result<StoreAck>;

    /// Resolve a key locally. `Raw` carries the content; `Partial` only the
    /// total length.
    async fn get_value(&self, key: &NodeId) -> Result<Option<Value>>;

    /// Open a writer for an incoming chunked value of known total length.
    async fn create_partial_writer(
        &self,
        key: NodeId,
        length: u64,
    ) -> Result<Box<dyn PartialWriter>>;

    /// Return the requested chunks of a stored value in offset order. An
    /// empty `offsets` slice means every chunk. Missing keys yield an error;
    /// the caller treats serving as best-effort.
    async fn for_each_chunk(
        &self,
        key: &NodeId,
        offsets: &[u64],
        chunk_size: usize,
    ) -> Result<Vec<(u64, Vec<u8>)>>;
}

// ============================================================================
// MemoryValueStore
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    values: HashMap<NodeId, Vec<u8>>,
    partials: HashMap<NodeId, Vec<u8>>,
}

/// In-memory [`ValueStore`]. Bounded by `max_entries`; a full store answers
/// `WillNotStore`.
#[derive(Clone)]
pub struct MemoryValueStore {
    inner: Arc<RwLock<MemoryInner>>,
    max_entries: usize,
}

impl MemoryValueStore {
    pub fn new() -> Self {
        Self::with_capacity(100_000)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryInner::default())),
            max_entries,
        }
    }

    /// Number of committed values (test/introspection helper).
    pub async fn len(&self) -> usize {
        self.inner.read().await.values.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ValueStore for MemoryValueStore {
    async fn save_raw(&self, key: NodeId, data: Vec<u8>) -> Result<StoreAck> {
        let mut inner = self.inner.write().await;
        if inner.values.contains_key(&key) {
            return Ok(StoreAck::Exists);
        }
        if inner.values.len() >= self.max_entries {
            return Ok(StoreAck::WillNotStore);
        }
        inner.values.insert(key, data);
        Ok(StoreAck::Stored)
    }

    async fn get_value(&self, key: &NodeId) -> Result<Option<Value>> {
        let inner = self.inner.read().await;
        Ok(inner.values.get(key).map(|data| {
            if data.len() <= MAX_RAW_VALUE_SIZE {
                Value::Raw(data.clone())
            } else {
                Value::Partial {
                    length: data.len() as u64,
                }
            }
        }))
    }

    async fn create_partial_writer(
        &self,
        key: NodeId,
        length: u64,
    ) -> Result<Box<dyn PartialWriter>> {
        Ok(Box::new(MemoryPartialWriter {
            store: self.inner.clone(),
            key,
            length,
            started: false,
        }))
    }

    async fn for_each_chunk(
        &self,
        key: &NodeId,
        offsets: &[u64],
        chunk_size: usize,
    ) -> Result<Vec<(u64, Vec<u8>)>> {
        let inner = self.inner.read().await;
        let data = inner
            .values
            .get(key)
            .ok_or_else(|| anyhow!("no value stored under {}", key))?;

        let wanted: Vec<u64> = if offsets.is_empty() {
            (0..data.len() as u64).step_by(chunk_size).collect()
        } else {
            offsets.to_vec()
        };

        let mut chunks = Vec::with_capacity(wanted.len());
        for offset in wanted {
            let start = offset as usize;
            if start >= data.len() {
                continue;
            }
            let end = (start + chunk_size).min(data.len());
            chunks.push((offset, data[start..end].to_vec()));
        }
        Ok(chunks)
    }
}

struct MemoryPartialWriter {
    store: Arc<RwLock<MemoryInner>>,
    key: NodeId,
    length: u64,
    started: bool,
}

#[async_trait]
impl PartialWriter for MemoryPartialWriter {
    async fn start(&mut self) -> Result<()> {
        let mut inner = self.store.write().await;
        inner
            .partials
            .insert(self.key, vec![0u8; self.length as usize]);
        self.started = true;
        Ok(())
    }

    async fn write_at(&mut self, chunk: &[u8], offset: u64) -> Result<()> {
        if !self.started {
            return Err(anyhow!("partial writer not started"));
        }
        let mut inner = self.store.write().await;
        let buffer = inner
            .partials
            .get_mut(&self.key)
            .ok_or_else(|| anyhow!("partial buffer missing for {}", self.key))?;

        let start = offset as usize;
        let end = start
            .checked_add(chunk.len())
            .filter(|end| *end <= buffer.len())
            .ok_or_else(|| anyhow!("chunk at offset {} overruns value length", offset))?;
        buffer[start..end].copy_from_slice(chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut inner = self.store.write().await;
        let buffer = inner
            .partials
            .remove(&self.key)
            .ok_or_else(|| anyhow!("partial buffer missing for {}", self.key))?;
        inner.values.insert(self.key, buffer);
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let mut inner = self.store.write().await;
        inner.partials.remove(&self.key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> NodeId {
        NodeId::from_bytes([seed; 32])
    }

    #[tokio::test]
    async fn save_raw_ack_progression() {
        let store = MemoryValueStore::with_capacity(1);

        assert_eq!(
            store.save_raw(key(1), b"hello".to_vec()).await.unwrap(),
            StoreAck::Stored
        );
        assert_eq!(
            store.save_raw(key(1), b"hello".to_vec()).await.unwrap(),
            StoreAck::Exists
        );
        assert_eq!(
            store.save_raw(key(2), b"more".to_vec()).await.unwrap(),
            StoreAck::WillNotStore
        );
    }

    #[tokio::test]
    async fn small_values_resolve_raw_large_resolve_partial() {
        let store = MemoryValueStore::new();
        store.save_raw(key(1), vec![1u8; 100]).await.unwrap();
        store.save_raw(key(2), vec![2u8; 5000]).await.unwrap();

        assert_eq!(
            store.get_value(&key(1)).await.unwrap(),
            Some(Value::Raw(vec![1u8; 100]))
        );
        assert_eq!(
            store.get_value(&key(2)).await.unwrap(),
            Some(Value::Partial { length: 5000 })
        );
        assert_eq!(store.get_value(&key(3)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn partial_writer_assembles_value() {
        let store = MemoryValueStore::new();
        let original: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();

        let mut writer = store
            .create_partial_writer(key(9), original.len() as u64)
            .await
            .unwrap();
        writer.start().await.unwrap();
        for offset in (0..original.len()).step_by(1024) {
            let end = (offset + 1024).min(original.len());
            writer
                .write_at(&original[offset..end], offset as u64)
                .await
                .unwrap();
        }
        writer.commit().await.unwrap();

        match store.get_value(&key(9)).await.unwrap() {
            Some(Value::Partial { length }) => assert_eq!(length, original.len() as u64),
            other => panic!("expected partial value, got {:?}", other),
        }

        let chunks = store.for_each_chunk(&key(9), &[], 1024).await.unwrap();
        let mut reassembled = vec![0u8; original.len()];
        for (offset, chunk) in chunks {
            reassembled[offset as usize..offset as usize + chunk.len()].copy_from_slice(&chunk);
        }
        assert_eq!(reassembled, original);
    }

    #[tokio::test]
    async fn aborted_writer_leaves_no_value() {
        let store = MemoryValueStore::new();
        let mut writer = store.create_partial_writer(key(4), 2048).await.unwrap();
        writer.start().await.unwrap();
        writer.write_at(&[1u8; 1024], 0).await.unwrap();
        writer.abort().await.unwrap();

        assert_eq!(store.get_value(&key(4)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn restricted_offsets_return_only_those_chunks() {
        let store = MemoryValueStore::new();
        store.save_raw(key(5), vec![7u8; 5000]).await.unwrap();

        let chunks = store
            .for_each_chunk(&key(5), &[1024, 4096], 1024)
            .await
            .unwrap();
        let offsets: Vec<u64> = chunks.iter().map(|(o, _)| *o).collect();
        assert_eq!(offsets, vec![1024, 4096]);
        assert_eq!(chunks[0].1.len(), 1024);
        assert_eq!(chunks[1].1.len(), 904);
    }

    #[tokio::test]
    async fn out_of_range_write_rejected() {
        let store = MemoryValueStore::new();
        let mut writer = store.create_partial_writer(key(6), 1000).await.unwrap();
        writer.start().await.unwrap();
        assert!(writer.write_at(&[0u8; 512], 900).await.is_err());
    }
}
