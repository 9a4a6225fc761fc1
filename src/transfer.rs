//! # Partial-Value Transfer
//!
//! Values larger than one datagram move as fixed-size chunks. The requester
//! sends a single `PARTIAL_VALUE` request naming the key and the offsets it
//! still needs (an empty list means everything), and registers one reply
//! slot per offset under the derived id `offset_messageId`. The server
//! answers with one individually addressed chunk reply per offset,
//! best-effort.
//!
//! Rounds retry: if the 2s round deadline fires with chunks outstanding,
//! the request is reissued restricted to the missing offsets — against the
//! same peer — until either everything arrived or the 30s absolute ceiling
//! is exceeded, which fails the transfer for this peer only. The caller
//! then moves on to the next peer that reported the value.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::identity::{NodeId, Peer};
use crate::messages::{chunk_reply_id, next_message_id, MessageKind, Payload};
use crate::rpc::{RpcError, RpcNode};
use crate::store::ValueStore;

/// Budget for one request/chunk-replies round.
pub const ROUND_TIMEOUT: Duration = Duration::from_secs(2);

/// Absolute wall-clock ceiling for one transfer attempt against one peer.
pub const TRANSFER_CEILING: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum TransferError {
    /// The peer advertised a length past the configured ceiling. Rejected
    /// before any buffer or offset bookkeeping is sized off the claim.
    OversizedClaim {
        key: NodeId,
        peer: NodeId,
        claimed: u64,
        limit: u64,
    },
    /// The ceiling elapsed with chunks still outstanding.
    Stalled {
        key: NodeId,
        peer: NodeId,
        missing: usize,
    },
    Rpc(RpcError),
    Store(anyhow::Error),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::OversizedClaim {
                key,
                peer,
                claimed,
                limit,
            } => write!(
                f,
                "{peer} advertised {key} as {claimed} bytes, over the {limit} byte limit"
            ),
            TransferError::Stalled { key, peer, missing } => write!(
                f,
                "transfer of {key} from {peer} stalled with {missing} chunks missing"
            ),
            TransferError::Rpc(err) => write!(f, "transfer rpc failed: {err}"),
            TransferError::Store(err) => write!(f, "transfer store failed: {err}"),
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransferError::Rpc(err) => Some(err),
            TransferError::Store(err) => err.source(),
            _ => None,
        }
    }
}

impl From<RpcError> for TransferError {
    fn from(err: RpcError) -> Self {
        TransferError::Rpc(err)
    }
}

/// Download a chunked value of known total length from one peer, persisting
/// it through the store's partial writer. On success the value is committed
/// and resolvable locally; on failure nothing is left behind.
pub async fn download(
    rpc: &RpcNode,
    peer: &Peer,
    key: NodeId,
    total_length: u64,
    max_length: u64,
    chunk_size: usize,
    store: &Arc<dyn ValueStore>,
) -> Result<(), TransferError> {
    // The length is the peer's claim, not a measurement. Cap it before the
    // offset set and the writer's buffer are sized off it.
    if total_length > max_length {
        debug!(key = %key, peer = %peer.id, claimed = total_length, "rejecting oversized length claim");
        return Err(TransferError::OversizedClaim {
            key,
            peer: peer.id,
            claimed: total_length,
            limit: max_length,
        });
    }

    let mut outstanding: BTreeSet<u64> =
        (0..total_length).step_by(chunk_size).collect();
    let total_chunks = outstanding.len();

    let mut writer = store
        .create_partial_writer(key, total_length)
        .await
        .map_err(TransferError::Store)?;
    writer.start().await.map_err(TransferError::Store)?;

    let started = Instant::now();
    let mut first_round = true;

    while !outstanding.is_empty() {
        if started.elapsed() >= TRANSFER_CEILING {
            let missing = outstanding.len();
            debug!(key = %key, peer = %peer.id, missing, "transfer ceiling exceeded");
            writer.abort().await.map_err(TransferError::Store)?;
            return Err(TransferError::Stalled {
                key,
                peer: peer.id,
                missing,
            });
        }

        let round_id = next_message_id();

        // One slot per outstanding offset, keyed by the derived chunk id.
        let mut round = JoinSet::new();
        for &offset in &outstanding {
            let rx = rpc
                .register_reply_slot(chunk_reply_id(offset, &round_id), MessageKind::PartialValue)
                .await?;
            round.spawn(async move { rx.await.ok() });
        }

        // The first round asks for everything with an empty list; retries
        // name exactly the missing offsets.
        let offsets = if first_round && outstanding.len() == total_chunks {
            Vec::new()
        } else {
            outstanding.iter().copied().collect()
        };
        first_round = false;
        rpc.send(peer, Payload::PartialValue { key, offsets }, Some(round_id.clone()))
            .await?;

        let deadline = Instant::now() + ROUND_TIMEOUT;
        while let Ok(Some(joined)) = tokio::time::timeout_at(deadline, round.join_next()).await {
            let body = match joined {
                Ok(Some(body)) => body,
                // Slot cancelled or task aborted; keep draining.
                Ok(None) | Err(_) => continue,
            };
            if let Payload::PartialValueReply { offset, chunk } = body.payload {
                if outstanding.remove(&offset) {
                    writer
                        .write_at(&chunk, offset)
                        .await
                        .map_err(TransferError::Store)?;
                }
            }
            if outstanding.is_empty() {
                break;
            }
        }

        // Unresolved slots from this round are dead; drop them before the
        // retry re-registers the same offsets under a fresh round id.
        round.abort_all();
        for &offset in &outstanding {
            rpc.cancel_reply_slot(chunk_reply_id(offset, &round_id)).await;
        }

        if !outstanding.is_empty() {
            trace!(
                key = %key,
                peer = %peer.id,
                missing = outstanding.len(),
                total = total_chunks,
                "round ended with chunks missing, retrying"
            );
        }
    }

    writer.commit().await.map_err(TransferError::Store)?;
    debug!(key = %key, peer = %peer.id, chunks = total_chunks, "transfer complete");
    Ok(())
}
