// REPLICATION BOUNDARY
// What the core consumes from the replicated log: the applied / majority-durable
// positions and the rollback notification.

use serde::{Serialize, Deserialize};

use strata_core::Timestamp;

/// Read-only view of a node's replication progress
pub trait ReplicationLog: Send + Sync {
    /// Timestamp of the newest entry applied locally
    fn last_applied(&self) -> Timestamp;

    /// Newest timestamp guaranteed to survive any rollback
    fn majority_commit_point(&self) -> Timestamp;
}

/// Emitted by the replication layer after a local rollback completed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackEvent {
    /// Everything after this timestamp was discarded
    pub rollback_point: Timestamp,
    pub entries_removed: usize,
}
