//! Chunk replication
//!
//! Every chunk has one primary instance, chosen by hashing its
//! coordinates, plus `R` replicas placed deterministically so that any
//! instance can recompute the full replica set from the address alone.
//! The primary write path hands each replica a pre-compressed copy of
//! the chunk (or a tombstone marker) through a bounded outbound queue
//! and waits for all acknowledgements before reporting success.
//!
//! - [`distribution`]: placement hashing and the responsibility rule
//!   under failures.
//! - [`messages`]: peer message vocabulary and flow-control credits.
//! - [`manager`]: outbound queues, completion handles, backpressure.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod distribution;
pub mod manager;
pub mod messages;

pub use distribution::{fib_hash64, LivenessView, ReplicaPlacement, MAX_INSTANCE_BITS};
pub use manager::{QueueEntry, ReplicationItem, ReplicationManager};
pub use messages::{
    ChannelCredit, ChunkRecord, ControlRecord, FlowControl, MessageQueueType, MessageType,
    ReplicaMessage,
};
