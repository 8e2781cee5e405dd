//! Query context
//!
//! Every storage operation runs on behalf of a query. The context
//! carries the query id, a cancellation flag checked at every potential
//! suspension point, and the cluster liveness view used by the
//! responsibility rule.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessera_core::{InstanceId, QueryId, Result, StorageError};
use tessera_replication::distribution::{AllAlive, LivenessView};

/// Per-query context handed into every engine entry point.
pub struct QueryContext {
    id: QueryId,
    cancelled: AtomicBool,
    liveness: Arc<dyn LivenessView>,
}

impl QueryContext {
    /// Context with the everyone-alive liveness view.
    pub fn new(id: QueryId) -> Self {
        Self::with_liveness(id, Arc::new(AllAlive))
    }

    /// Context with an explicit liveness view.
    pub fn with_liveness(id: QueryId, liveness: Arc<dyn LivenessView>) -> Self {
        QueryContext {
            id,
            cancelled: AtomicBool::new(false),
            liveness,
        }
    }

    /// Query id.
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// Fail if the query has been cancelled. Called before and after
    /// every blocking step so cancelled queries release their resources
    /// promptly.
    pub fn validate(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(StorageError::QueryCancelled(self.id));
        }
        Ok(())
    }

    /// Mark the query cancelled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Liveness view for the responsibility rule.
    pub fn liveness(&self) -> &dyn LivenessView {
        self.liveness.as_ref()
    }

    /// Whether an instance is known dead.
    pub fn is_instance_dead(&self, instance: InstanceId) -> bool {
        self.liveness.is_instance_dead(instance)
    }
}
