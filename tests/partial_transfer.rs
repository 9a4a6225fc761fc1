//! Chunked transfer of values larger than one datagram, end to end.

use std::sync::Arc;
use std::time::{Duration, Instant};

use grapnel::{Dht, DhtConfig, Keypair, MemoryValueStore, NodeId, Value, ValueStore};

const CHUNK_SIZE: usize = 1024;

async fn start_node(bootstrap: Option<std::net::SocketAddr>) -> (Dht, Arc<MemoryValueStore>) {
    let store = Arc::new(MemoryValueStore::new());
    let dht = Dht::bootstrap(
        Keypair::generate(),
        store.clone(),
        DhtConfig {
            bootstrap,
            ..DhtConfig::default()
        },
    )
    .await
    .expect("node failed to start");
    (dht, store)
}

fn patterned_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn reassemble(store: &MemoryValueStore, key: &NodeId, len: usize) -> Vec<u8> {
    let chunks = store.for_each_chunk(key, &[], CHUNK_SIZE).await.unwrap();
    let mut out = vec![0u8; len];
    for (offset, chunk) in chunks {
        out[offset as usize..offset as usize + chunk.len()].copy_from_slice(&chunk);
    }
    out
}

#[tokio::test]
async fn five_thousand_byte_value_round_trips() {
    let (a, _) = start_node(None).await;
    let (b, _) = start_node(Some(a.local_addr())).await;

    let key = NodeId::for_key(b"large-value");
    let original = patterned_bytes(5000);
    let outcome = a.save(key, original.clone()).await.unwrap();
    assert_eq!(outcome.success, 1);

    // b got the value through replication; c has to fetch it chunk-wise
    // because 5000 bytes exceeds one datagram's raw-value budget.
    let (c, c_store) = start_node(Some(a.local_addr())).await;
    assert!(c_store.is_empty().await);

    let started = Instant::now();
    match c.fetch(key).await.unwrap() {
        Value::Partial { length } => assert_eq!(length, 5000),
        other => panic!("expected partial value, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(30));

    assert_eq!(reassemble(&c_store, &key, 5000).await, original);

    for node in [&a, &b, &c] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn fetched_partial_value_is_servable_onward() {
    let (a, _) = start_node(None).await;
    let (b, _) = start_node(Some(a.local_addr())).await;

    let key = NodeId::for_key(b"relayed-large-value");
    let original = patterned_bytes(3 * CHUNK_SIZE + 17);
    a.save(key, original.clone()).await.unwrap();

    // c downloads it, then d (who only knows c) downloads c's copy.
    let (c, c_store) = start_node(Some(b.local_addr())).await;
    c.fetch(key).await.unwrap();
    assert_eq!(
        reassemble(&c_store, &key, original.len()).await,
        original
    );

    let (d, d_store) = start_node(Some(c.local_addr())).await;
    match d.fetch(key).await.unwrap() {
        Value::Partial { length } => assert_eq!(length as usize, original.len()),
        other => panic!("expected partial value, got {:?}", other),
    }
    assert_eq!(
        reassemble(&d_store, &key, original.len()).await,
        original
    );

    for node in [&a, &b, &c, &d] {
        node.shutdown().await;
    }
}
