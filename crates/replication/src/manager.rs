//! Replication manager
//!
//! One bounded outbound queue per peer. The primary write path enqueues
//! a [`ReplicaMessage`] per replica and gets back a [`ReplicationItem`]
//! handle; a transport drains each queue, delivers the message, and
//! completes the handle. The primary then waits on all handles before
//! declaring the write durable, or aborts them on error.
//!
//! Enqueueing on a full queue fails with `Overflow` rather than
//! blocking; the caller owns the retry policy. Sends also honor the
//! peer's advertised flow-control credit.

use crate::messages::{FlowControl, MessageQueueType, ReplicaMessage};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tessera_core::{InstanceId, Result, StorageError};
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ItemState {
    Pending,
    Done,
    Aborted(String),
}

/// Completion handle for one queued replica send.
#[derive(Debug)]
pub struct ReplicationItem {
    target: InstanceId,
    state: Mutex<ItemState>,
    cond: Condvar,
}

impl ReplicationItem {
    fn new(target: InstanceId) -> Self {
        ReplicationItem {
            target,
            state: Mutex::new(ItemState::Pending),
            cond: Condvar::new(),
        }
    }

    /// Peer the message is bound for.
    pub fn target(&self) -> InstanceId {
        self.target
    }

    /// True once delivered or aborted.
    pub fn is_done(&self) -> bool {
        !matches!(*self.state.lock(), ItemState::Pending)
    }

    /// Block until the send completes; an aborted send surfaces as a
    /// connection error to the peer.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        while matches!(*state, ItemState::Pending) {
            self.cond.wait(&mut state);
        }
        match &*state {
            ItemState::Done => Ok(()),
            ItemState::Aborted(_reason) => Err(StorageError::ConnectionError(self.target)),
            ItemState::Pending => unreachable!(),
        }
    }

    /// Mark delivered.
    pub fn complete(&self) {
        let mut state = self.state.lock();
        if matches!(*state, ItemState::Pending) {
            *state = ItemState::Done;
            self.cond.notify_all();
        }
    }

    /// Mark aborted, if not already delivered.
    pub fn abort(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if matches!(*state, ItemState::Pending) {
            *state = ItemState::Aborted(reason.into());
            self.cond.notify_all();
        }
    }
}

/// One queued message plus its completion handle; what a transport pops.
pub struct QueueEntry {
    /// The message to deliver.
    pub msg: ReplicaMessage,
    /// Handle to complete (or abort) after delivery.
    pub item: Arc<ReplicationItem>,
}

struct PeerQueue {
    tx: Sender<QueueEntry>,
    rx: Receiver<QueueEntry>,
}

/// Outbound replication queues for all peers.
pub struct ReplicationManager {
    queues: Mutex<FxHashMap<InstanceId, PeerQueue>>,
    flow: FlowControl,
    capacity: usize,
}

impl ReplicationManager {
    /// Create a manager whose per-peer queues hold `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        ReplicationManager {
            queues: Mutex::new(FxHashMap::default()),
            flow: FlowControl::new(),
            capacity,
        }
    }

    /// Flow-control state fed by inbound `Control` messages.
    pub fn flow(&self) -> &FlowControl {
        &self.flow
    }

    /// Enqueue a message for `target` and return its completion handle.
    ///
    /// Fails with `Overflow` when the peer queue is full or the peer has
    /// advertised zero credit.
    pub fn send(&self, target: InstanceId, msg: ReplicaMessage) -> Result<Arc<ReplicationItem>> {
        if !self.flow.can_send(target, MessageQueueType::Replication) {
            return Err(StorageError::overflow(format!(
                "no replication credit for instance {target}"
            )));
        }
        let item = Arc::new(ReplicationItem::new(target));
        let entry = QueueEntry {
            msg,
            item: Arc::clone(&item),
        };
        let tx = {
            let mut queues = self.queues.lock();
            queues
                .entry(target)
                .or_insert_with(|| {
                    let (tx, rx) = bounded(self.capacity);
                    PeerQueue { tx, rx }
                })
                .tx
                .clone()
        };
        match tx.try_send(entry) {
            Ok(()) => {
                self.flow.on_sent(target, MessageQueueType::Replication);
                trace!(target, "queued replica message");
                Ok(item)
            }
            Err(TrySendError::Full(entry)) => {
                entry.item.abort("send queue full");
                Err(StorageError::overflow(format!(
                    "replication send queue to instance {target} is full"
                )))
            }
            Err(TrySendError::Disconnected(entry)) => {
                entry.item.abort("peer queue closed");
                Err(StorageError::ConnectionError(target))
            }
        }
    }

    /// Receiver end of the queue for `target`; the transport drains this.
    pub fn queue_for(&self, target: InstanceId) -> Receiver<QueueEntry> {
        let mut queues = self.queues.lock();
        queues
            .entry(target)
            .or_insert_with(|| {
                let (tx, rx) = bounded(self.capacity);
                PeerQueue { tx, rx }
            })
            .rx
            .clone()
    }

    /// Block until `item` completes.
    pub fn wait(&self, item: &Arc<ReplicationItem>) -> Result<()> {
        item.wait()
    }

    /// Best-effort cancellation of an outstanding send.
    pub fn abort(&self, item: &Arc<ReplicationItem>) {
        item.abort("aborted by primary");
    }

    /// Wait for a whole replica set; the engine's commit barrier.
    pub fn wait_all(&self, items: &[Arc<ReplicationItem>]) -> Result<()> {
        for item in items {
            self.wait(item)?;
        }
        Ok(())
    }

    /// Abort a whole replica set.
    pub fn abort_all(&self, items: &[Arc<ReplicationItem>]) {
        for item in items {
            self.abort(item);
        }
    }

    /// Drop every queue, disconnecting transports draining them. Sends
    /// after shutdown recreate queues.
    pub fn shutdown(&self) {
        self.queues.lock().clear();
    }
}
