//! Replica placement
//!
//! Placement must be a pure function of the chunk address so every
//! instance, at any time, computes the same replica set. The primary is
//! round-robin by hashed chunk number; the replicas spread with a
//! Fibonacci hash, probing linearly (and restarting the collision scan)
//! until all members are distinct.

use smallvec::SmallVec;
use tessera_core::config::MAX_REDUNDANCY;
use tessera_core::{InstanceId, Result, StorageError};

/// log2 of the maximum supported instance count.
pub const MAX_INSTANCE_BITS: u64 = 10;

/// Fibonacci hash of a 64-bit key into `2^bits` buckets.
pub fn fib_hash64(key: u64, bits: u64) -> u64 {
    debug_assert!(bits < 64);
    const FIB_A64: u64 = 11400714819323198485;
    key.wrapping_mul(FIB_A64) >> (64 - bits)
}

/// Cluster liveness oracle, maintained outside the storage engine.
pub trait LivenessView: Send + Sync {
    /// True when the instance is known dead.
    fn is_instance_dead(&self, instance: InstanceId) -> bool;
}

/// A liveness view that believes everyone is alive; the default for
/// single-instance deployments and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllAlive;

impl LivenessView for AllAlive {
    fn is_instance_dead(&self, _instance: InstanceId) -> bool {
        false
    }
}

/// Replica set for one chunk: `redundancy + 1` distinct instances, the
/// primary first.
pub type ReplicaSet = SmallVec<[InstanceId; MAX_REDUNDANCY + 1]>;

/// Deterministic replica placement for a fixed cluster size.
#[derive(Debug, Clone, Copy)]
pub struct ReplicaPlacement {
    n_instances: u64,
    redundancy: usize,
}

impl ReplicaPlacement {
    /// Create a placement. Redundancy must leave at least one instance
    /// without a copy (`redundancy < n_instances`) and fit the compiled
    /// bound.
    pub fn new(n_instances: usize, redundancy: usize) -> Result<Self> {
        if n_instances == 0 {
            return Err(StorageError::corrupted("cluster of zero instances"));
        }
        if redundancy > MAX_REDUNDANCY || redundancy >= n_instances {
            return Err(StorageError::NoQuorum {
                alive: n_instances,
                required: redundancy + 1,
            });
        }
        Ok(ReplicaPlacement {
            n_instances: n_instances as u64,
            redundancy,
        })
    }

    /// Number of instances.
    pub fn n_instances(&self) -> usize {
        self.n_instances as usize
    }

    /// Redundancy factor `R`.
    pub fn redundancy(&self) -> usize {
        self.redundancy
    }

    /// Primary instance for a hashed chunk number.
    ///
    /// Uses the instance count fixed at system birth, so the answer never
    /// changes across failures.
    pub fn primary(&self, chunk_hash: u64) -> InstanceId {
        chunk_hash % self.n_instances
    }

    /// Full replica set for a hashed chunk number: primary first, then
    /// `R` distinct replicas.
    pub fn replicas(&self, chunk_hash: u64) -> ReplicaSet {
        let mut replicas = ReplicaSet::new();
        replicas.push(self.primary(chunk_hash));
        let n_replicas = (self.redundancy + 1) as u64;
        for i in 0..self.redundancy as u64 {
            let chunk_id = chunk_hash.wrapping_mul(n_replicas).wrapping_add(i + 1);
            let mut instance = fib_hash64(chunk_id, MAX_INSTANCE_BITS) % self.n_instances;
            // Probe forward on collision; restart the scan because the
            // bump may collide with an earlier member.
            let mut j = 0;
            while j < replicas.len() {
                if replicas[j] == instance {
                    instance = (instance + 1) % self.n_instances;
                    j = 0;
                } else {
                    j += 1;
                }
            }
            replicas.push(instance);
        }
        replicas
    }

    /// Whether `self_instance` must answer reads for a chunk that
    /// originated at `origin`.
    ///
    /// True when the chunk is our own, or when the origin is dead and we
    /// are the first live replica in its replica list. This keeps exactly
    /// one responsible owner per chunk through `R` simultaneous
    /// failures.
    pub fn is_responsible_for(
        &self,
        self_instance: InstanceId,
        origin: InstanceId,
        chunk_hash: u64,
        liveness: &dyn LivenessView,
    ) -> bool {
        if origin == self_instance {
            return true;
        }
        if !liveness.is_instance_dead(origin) {
            return false;
        }
        if self.redundancy == 1 {
            // A locally present copy is the only live one.
            return true;
        }
        let replicas = self.replicas(chunk_hash);
        for &replica in replicas.iter().skip(1) {
            if replica == self_instance {
                return true;
            }
            if !liveness.is_instance_dead(replica) {
                return false;
            }
        }
        false
    }
}
