//! Peer message vocabulary and flow control
//!
//! Every peer message carries `(query_id, source_instance, record,
//! optional binary payload)`. The storage engine itself only produces
//! chunk-replica traffic, but the full message-type vocabulary lives
//! here so queue routing and flow control can be shared with the query
//! layers.
//!
//! Flow control: each receiver advertises per-queue credit in a
//! `Control` message (`available` slots plus send/receive sequence
//! numbers under a connection generation id). A sender stops when the
//! peer's advertised credit for the queue reaches zero.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tessera_core::{InstanceId, QueryId, StorageAddress};

/// Wire message types exchanged between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Chunk data moved by a query operator.
    Chunk,
    /// Chunk replica pushed by a primary write.
    ChunkReplica,
    /// Chunk fetched from a remote array iterator.
    RemoteChunk,
    /// Request for the next chunk of a remote iterator.
    Fetch,
    /// Install a query plan.
    PrepareQuery,
    /// Start executing a prepared query.
    ExecuteQuery,
    /// Final result summary of a query.
    QueryResult,
    /// Cancel an in-flight query.
    CancelQuery,
    /// Tear down a finished query.
    CompleteQuery,
    /// Abort notification.
    Abort,
    /// Error notification, routed to the owning query.
    Error,
    /// Liveness heartbeat.
    Alive,
    /// Flow-control credit snapshot.
    Control,
    /// Raw buffer transfer.
    BufferSend,
}

/// Logical queues with independent flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageQueueType {
    /// Unthrottled control traffic.
    None,
    /// Replication pushes.
    Replication,
    /// Scatter-gather chunk movement.
    ScatterGather,
}

/// Metadata of one replicated chunk (or tombstone).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Address of the chunk at the destination.
    pub address: StorageAddress,
    /// Codec the payload was compressed with.
    pub compression_method: i16,
    /// Uncompressed payload size.
    pub decompressed_size: u64,
    /// Element count, when known.
    pub count: u64,
    /// True for deletion markers; such messages carry no payload.
    pub tombstone: bool,
}

/// One replication message bound for a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaMessage {
    /// Always [`MessageType::ChunkReplica`] for engine traffic.
    pub message_type: MessageType,
    /// Query on whose behalf the write happens.
    pub query_id: QueryId,
    /// Originating instance.
    pub source_instance: InstanceId,
    /// Chunk metadata.
    pub record: ChunkRecord,
    /// Compressed chunk bytes; `None` for tombstones.
    pub payload: Option<Vec<u8>>,
}

impl ReplicaMessage {
    /// Build a data-carrying replica message.
    pub fn chunk(
        query_id: QueryId,
        source_instance: InstanceId,
        record: ChunkRecord,
        payload: Vec<u8>,
    ) -> Self {
        debug_assert!(!record.tombstone);
        ReplicaMessage {
            message_type: MessageType::ChunkReplica,
            query_id,
            source_instance,
            record,
            payload: Some(payload),
        }
    }

    /// Build a tombstone replica message.
    pub fn tombstone(
        query_id: QueryId,
        source_instance: InstanceId,
        address: StorageAddress,
    ) -> Self {
        ReplicaMessage {
            message_type: MessageType::ChunkReplica,
            query_id,
            source_instance,
            record: ChunkRecord {
                address,
                compression_method: 0,
                decompressed_size: 0,
                count: 0,
                tombstone: true,
            },
            payload: None,
        }
    }
}

/// Credit advertisement for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelCredit {
    /// Which queue the credit applies to.
    pub queue: MessageQueueType,
    /// Receive slots currently available at the advertiser.
    pub available: u64,
    /// Last sequence number the advertiser sent on this queue.
    pub local_sn: u64,
    /// Last sequence number the advertiser received on this queue.
    pub remote_sn: u64,
}

/// Body of a [`MessageType::Control`] message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    /// Advertiser's connection generation.
    pub local_gen_id: u64,
    /// Advertiser's view of our connection generation.
    pub remote_gen_id: u64,
    /// Per-queue credits.
    pub channels: Vec<ChannelCredit>,
}

#[derive(Debug, Clone, Copy, Default)]
struct RemoteQueueState {
    available: u64,
    gen_id: u64,
    known: bool,
}

/// Tracks advertised peer credit per `(instance, queue)`.
///
/// Until a peer advertises anything, senders are optimistic; after the
/// first `Control` message, `can_send` follows the advertised credit,
/// decremented locally per send and refreshed by the next snapshot.
#[derive(Debug, Default)]
pub struct FlowControl {
    state: Mutex<FxHashMap<(InstanceId, MessageQueueType), RemoteQueueState>>,
}

impl FlowControl {
    /// New tracker with no knowledge of any peer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a control snapshot from `from`.
    pub fn handle_control(&self, from: InstanceId, record: &ControlRecord) {
        let mut state = self.state.lock();
        for credit in &record.channels {
            let entry = state.entry((from, credit.queue)).or_default();
            if entry.known && entry.gen_id != record.local_gen_id {
                // Peer restarted: any locally decremented credit is stale.
                tracing::debug!(peer = from, "flow control generation changed");
            }
            entry.available = credit.available;
            entry.gen_id = record.local_gen_id;
            entry.known = true;
        }
    }

    /// Whether a send to `to` on `queue` is currently allowed.
    pub fn can_send(&self, to: InstanceId, queue: MessageQueueType) -> bool {
        if queue == MessageQueueType::None {
            return true;
        }
        let state = self.state.lock();
        match state.get(&(to, queue)) {
            Some(entry) if entry.known => entry.available > 0,
            _ => true,
        }
    }

    /// Consume one credit after a successful send.
    pub fn on_sent(&self, to: InstanceId, queue: MessageQueueType) {
        let mut state = self.state.lock();
        if let Some(entry) = state.get_mut(&(to, queue)) {
            if entry.known {
                entry.available = entry.available.saturating_sub(1);
            }
        }
    }

    /// Build the snapshot this instance advertises, from its local
    /// receive-queue headroom.
    pub fn advertise(
        &self,
        local_gen_id: u64,
        remote_gen_id: u64,
        availability: &[(MessageQueueType, u64)],
    ) -> ControlRecord {
        ControlRecord {
            local_gen_id,
            remote_gen_id,
            channels: availability
                .iter()
                .map(|&(queue, available)| ChannelCredit {
                    queue,
                    available,
                    local_sn: 0,
                    remote_sn: 0,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::types::coords_from;

    fn addr() -> StorageAddress {
        StorageAddress::new(2, 0, coords_from(&[0, 0]))
    }

    #[test]
    fn tombstone_messages_carry_no_payload() {
        let msg = ReplicaMessage::tombstone(7, 1, addr());
        assert!(msg.record.tombstone);
        assert!(msg.payload.is_none());
        assert_eq!(msg.message_type, MessageType::ChunkReplica);
    }

    #[test]
    fn optimistic_until_first_advertisement() {
        let fc = FlowControl::new();
        assert!(fc.can_send(3, MessageQueueType::Replication));
        fc.on_sent(3, MessageQueueType::Replication); // no-op while unknown
        assert!(fc.can_send(3, MessageQueueType::Replication));
    }

    #[test]
    fn credit_drains_and_refreshes() {
        let fc = FlowControl::new();
        let record = ControlRecord {
            local_gen_id: 1,
            remote_gen_id: 1,
            channels: vec![ChannelCredit {
                queue: MessageQueueType::Replication,
                available: 2,
                local_sn: 0,
                remote_sn: 0,
            }],
        };
        fc.handle_control(3, &record);
        assert!(fc.can_send(3, MessageQueueType::Replication));
        fc.on_sent(3, MessageQueueType::Replication);
        fc.on_sent(3, MessageQueueType::Replication);
        assert!(!fc.can_send(3, MessageQueueType::Replication));

        // A fresh snapshot restores credit.
        fc.handle_control(3, &record);
        assert!(fc.can_send(3, MessageQueueType::Replication));
    }

    #[test]
    fn control_queue_is_never_throttled() {
        let fc = FlowControl::new();
        let record = ControlRecord {
            local_gen_id: 1,
            remote_gen_id: 1,
            channels: vec![ChannelCredit {
                queue: MessageQueueType::None,
                available: 0,
                local_sn: 0,
                remote_sn: 0,
            }],
        };
        fc.handle_control(3, &record);
        assert!(fc.can_send(3, MessageQueueType::None));
    }

    #[test]
    fn advertise_builds_snapshot() {
        let fc = FlowControl::new();
        let rec = fc.advertise(
            5,
            4,
            &[
                (MessageQueueType::Replication, 8),
                (MessageQueueType::ScatterGather, 2),
            ],
        );
        assert_eq!(rec.local_gen_id, 5);
        assert_eq!(rec.remote_gen_id, 4);
        assert_eq!(rec.channels.len(), 2);
        assert_eq!(rec.channels[0].available, 8);
    }
}
