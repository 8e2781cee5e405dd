//! System-catalog interface
//!
//! The catalog is an external collaborator: it owns array metadata,
//! version ids and the array-lock lifecycle. The storage engine consumes
//! the narrow slice below, mainly during recovery (which arrays still
//! exist, what their oldest retained version is, which locks were left
//! behind by a crash).

use tessera_core::{ArrayUAID, ArrayVersionId, InstanceId, VersionId};

/// Array-lock modes relevant to recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// The locked query was creating the array.
    Create,
    /// The locked query was writing a new version.
    Write,
    /// The locked query was removing the array.
    Remove,
    /// Read lock; nothing to undo.
    Read,
}

/// One outstanding array lock recorded by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayLock {
    /// Unversioned array id.
    pub array_uaid: ArrayUAID,
    /// Versioned array id the query was producing.
    pub array_id: ArrayVersionId,
    /// Version sequence number the query was producing.
    pub version_id: VersionId,
    /// Last durable version to roll back to (0 when the array itself
    /// was being created).
    pub rollback_to: VersionId,
    /// Lock mode.
    pub mode: LockMode,
}

/// Catalog operations the storage engine consumes.
pub trait SystemCatalog: Send + Sync {
    /// Whether the unversioned array still exists.
    fn array_exists(&self, uaid: ArrayUAID) -> bool;

    /// Versioned array id of the oldest retained version of `uaid`;
    /// 0 when unknown.
    fn oldest_array_version(&self, uaid: ArrayUAID) -> ArrayVersionId;

    /// Outstanding locks for `instance`, coordinator locks first.
    fn read_array_locks(&self, instance: InstanceId) -> (Vec<ArrayLock>, Vec<ArrayLock>);

    /// Drop all coordinator locks for `instance`.
    fn delete_coord_locks(&self, instance: InstanceId);

    /// Drop all worker locks for `instance`.
    fn delete_worker_locks(&self, instance: InstanceId);

    /// Cluster size fixed at system birth.
    fn number_of_instances(&self) -> usize;
}
