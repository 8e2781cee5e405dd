//! In-memory collaborator doubles for tests
//!
//! The engine consumes the system catalog and the liveness oracle
//! through traits; these doubles implement them with plain maps so
//! integration tests can script catalog state, leftover locks and
//! instance deaths.

use crate::catalog::{ArrayLock, SystemCatalog};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use tessera_core::{ArrayUAID, ArrayVersionId, InstanceId};
use tessera_replication::distribution::LivenessView;

#[derive(Default)]
struct MemCatalogState {
    /// uaid -> oldest retained versioned array id.
    arrays: BTreeMap<ArrayUAID, ArrayVersionId>,
    coord_locks: Vec<ArrayLock>,
    worker_locks: Vec<ArrayLock>,
}

/// Scriptable in-memory system catalog.
pub struct MemCatalog {
    n_instances: usize,
    state: Mutex<MemCatalogState>,
}

impl MemCatalog {
    /// Catalog for a cluster of `n_instances`.
    pub fn new(n_instances: usize) -> Self {
        MemCatalog {
            n_instances,
            state: Mutex::new(MemCatalogState::default()),
        }
    }

    /// Register an array whose oldest retained version is
    /// `oldest_version` (a versioned array id).
    pub fn add_array(&self, uaid: ArrayUAID, oldest_version: ArrayVersionId) {
        self.state.lock().arrays.insert(uaid, oldest_version);
    }

    /// Move the oldest retained version forward (version removal).
    pub fn set_oldest_version(&self, uaid: ArrayUAID, oldest_version: ArrayVersionId) {
        self.state.lock().arrays.insert(uaid, oldest_version);
    }

    /// Drop an array entirely.
    pub fn remove_array(&self, uaid: ArrayUAID) {
        self.state.lock().arrays.remove(&uaid);
    }

    /// Leave a coordinator lock behind, as a crash would.
    pub fn add_coord_lock(&self, lock: ArrayLock) {
        self.state.lock().coord_locks.push(lock);
    }

    /// Leave a worker lock behind.
    pub fn add_worker_lock(&self, lock: ArrayLock) {
        self.state.lock().worker_locks.push(lock);
    }

    /// Outstanding coordinator locks (for assertions).
    pub fn coord_locks(&self) -> Vec<ArrayLock> {
        self.state.lock().coord_locks.clone()
    }
}

impl SystemCatalog for MemCatalog {
    fn array_exists(&self, uaid: ArrayUAID) -> bool {
        self.state.lock().arrays.contains_key(&uaid)
    }

    fn oldest_array_version(&self, uaid: ArrayUAID) -> ArrayVersionId {
        self.state.lock().arrays.get(&uaid).copied().unwrap_or(0)
    }

    fn read_array_locks(&self, _instance: InstanceId) -> (Vec<ArrayLock>, Vec<ArrayLock>) {
        let state = self.state.lock();
        (state.coord_locks.clone(), state.worker_locks.clone())
    }

    fn delete_coord_locks(&self, _instance: InstanceId) {
        self.state.lock().coord_locks.clear();
    }

    fn delete_worker_locks(&self, _instance: InstanceId) {
        self.state.lock().worker_locks.clear();
    }

    fn number_of_instances(&self) -> usize {
        self.n_instances
    }
}

/// Liveness view over a mutable set of dead instances.
#[derive(Default)]
pub struct DeadInstances {
    dead: Mutex<FxHashSet<InstanceId>>,
}

impl DeadInstances {
    /// Everyone starts alive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an instance dead.
    pub fn kill(&self, instance: InstanceId) {
        self.dead.lock().insert(instance);
    }

    /// Bring an instance back.
    pub fn revive(&self, instance: InstanceId) {
        self.dead.lock().remove(&instance);
    }
}

impl LivenessView for DeadInstances {
    fn is_instance_dead(&self, instance: InstanceId) -> bool {
        self.dead.lock().contains(&instance)
    }
}
