// ROLLBACK ADAPTER
// Maps a replication rollback onto the checkpoint history of persisted index builds
//
// SAFETY INVARIANTS:
// 1. A build never resumes from a checkpoint written after the rollback point
// 2. A build never resumes from a checkpoint whose write time is not majority-committed
// 3. Every checkpoint newer than the chosen resume point is deleted before resumption
// 4. A build started after the rollback point restarts from Initializing

use serde::{Serialize, Deserialize};
use std::sync::Arc;
use log::{info, warn};

use strata_core::{BuildId, Result, StrataError, Timestamp};
use crate::checkpoint_store::CheckpointStore;
use crate::index_build::collect_build_garbage;
use crate::index_checkpoint::{
    checkpoint_is_trusted, load_history, load_record, persisted_builds, BuildKeys,
    IndexBuildCheckpoint,
};
use crate::replication::ReplicationLog;

/// Where a build re-enters after a rollback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumePoint {
    FromCheckpoint(IndexBuildCheckpoint),
    Initializing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub build_id: BuildId,
    pub resume: ResumePoint,
    /// Sequence numbers of the checkpoints that were discarded
    pub discarded: Vec<u64>,
}

/// Newest checkpoint of `history` (oldest first) that is both at or before the
/// rollback point and majority-committed.
pub fn select_resume_point(
    history: &[IndexBuildCheckpoint],
    rollback_point: Timestamp,
    majority_point: Timestamp,
) -> ResumePoint {
    history
        .iter()
        .rev()
        .find(|cp| cp.written_at <= rollback_point && checkpoint_is_trusted(cp, majority_point))
        .map(|cp| ResumePoint::FromCheckpoint(cp.clone()))
        .unwrap_or(ResumePoint::Initializing)
}

pub struct RollbackAdapter {
    store: CheckpointStore,
    replication: Arc<dyn ReplicationLog>,
}

impl RollbackAdapter {
    pub fn new(store: CheckpointStore, replication: Arc<dyn ReplicationLog>) -> Self {
        RollbackAdapter { store, replication }
    }

    /// Invalidate the checkpoints of `build_id` that the rollback made untrustworthy.
    ///
    /// The build must not be running; `IndexBuilder::resume` afterwards picks up the
    /// returned resume point.
    pub fn on_rollback(&self, build_id: BuildId, rollback_point: Timestamp) -> Result<RollbackOutcome> {
        let record = load_record(&self.store, build_id)?
            .ok_or_else(|| StrataError::NotFound(format!("index build {}", build_id)))?;
        let history = load_history(&self.store, build_id)?;
        let majority = self.replication.majority_commit_point();

        let resume = if record.started_at > rollback_point {
            ResumePoint::Initializing
        } else {
            select_resume_point(&history, rollback_point, majority)
        };

        let keep_through = match &resume {
            ResumePoint::FromCheckpoint(cp) => Some(cp.seq),
            ResumePoint::Initializing => None,
        };
        let keys = BuildKeys::new(build_id);
        let mut discarded = Vec::new();
        for cp in &history {
            if keep_through.map_or(true, |seq| cp.seq > seq) {
                self.store.delete_record(&keys.checkpoint(cp.seq))?;
                discarded.push(cp.seq);
            }
        }
        collect_build_garbage(&self.store, build_id, &[])?;

        match &resume {
            ResumePoint::FromCheckpoint(cp) => {
                if !discarded.is_empty() {
                    warn!(
                        "{}",
                        StrataError::RollbackDiscontinuity(format!(
                            "index build {}: discarded checkpoints {:?} after rollback to {}",
                            build_id, discarded, rollback_point
                        ))
                    );
                }
                info!(
                    "Index build {} resumes from checkpoint {} ({:?}) after rollback to {}",
                    build_id, cp.seq, cp.phase, rollback_point
                );
            }
            ResumePoint::Initializing => {
                warn!(
                    "{}",
                    StrataError::RollbackDiscontinuity(format!(
                        "index build {}: no checkpoint survives rollback to {} (majority {}), restarting",
                        build_id, rollback_point, majority
                    ))
                );
            }
        }

        Ok(RollbackOutcome { build_id, resume, discarded })
    }

    /// Apply a rollback to every build persisted in the store
    pub fn on_rollback_all(&self, rollback_point: Timestamp) -> Result<Vec<RollbackOutcome>> {
        persisted_builds(&self.store)?
            .into_iter()
            .map(|build_id| self.on_rollback(build_id, rollback_point))
            .collect()
    }
}
