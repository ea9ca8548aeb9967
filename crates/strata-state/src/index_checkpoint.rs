// INDEX BUILD CHECKPOINTS
// Durable progress records of a resumable index build and their store layout
//
// SAFETY INVARIANTS:
// 1. Checkpoint sequence numbers strictly increase within a build
// 2. A checkpoint for phase P is written only after all work of the previous phase is durable
// 3. A DrainWrites checkpoint always has an index snapshot stored under the same sequence number
// 4. A checkpoint is trusted only if its write time is majority-committed

use serde::{Serialize, Deserialize};
use std::collections::BTreeSet;

use strata_core::{BuildId, Namespace, Result, StrataError, Timestamp};
use crate::checkpoint_store::CheckpointStore;
use crate::external_sort::RunId;
use crate::index_key::{IndexEntry, IndexSpec};

/// Root prefix of every index build record
pub const INDEX_BUILDS_PREFIX: &str = "indexBuilds/";

/// Phase a checkpoint resumes into
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub enum CheckpointPhase {
    /// Scan in progress; every entry up to `scan_cursor` is in `sorted_runs`
    CollectionScan,
    /// Scan complete; all entries are in `sorted_runs`
    BulkLoad,
    /// Runs merged; `drain_batches_applied` side-write batches are in the index snapshot
    DrainWrites,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexBuildCheckpoint {
    pub build_id: BuildId,
    pub seq: u64,
    pub phase: CheckpointPhase,
    pub scan_cursor: Option<i64>,
    pub sorted_runs: Vec<RunId>,
    pub drain_batches_applied: u64,
    /// Timestamp of the last side write reflected in the index snapshot
    pub drain_position: Timestamp,
    /// Last applied oplog time on the node when the checkpoint was written
    pub written_at: Timestamp,
}

/// Build metadata written once when the build starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexBuildRecord {
    pub build_id: BuildId,
    pub ns: Namespace,
    pub spec: IndexSpec,
    /// Side writes after this timestamp are replayed during DrainWrites
    pub started_at: Timestamp,
}

/// A checkpoint may be resumed from only once its write time is majority-committed
pub fn checkpoint_is_trusted(cp: &IndexBuildCheckpoint, majority_point: Timestamp) -> bool {
    cp.written_at <= majority_point
}

/// Key layout of one build under `indexBuilds/<build_id>/`
pub struct BuildKeys {
    root: String,
}

impl BuildKeys {
    pub fn new(build_id: BuildId) -> Self {
        BuildKeys { root: format!("{}{}/", INDEX_BUILDS_PREFIX, build_id) }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn meta(&self) -> String {
        format!("{}meta", self.root)
    }

    pub fn checkpoints(&self) -> String {
        format!("{}checkpoint/", self.root)
    }

    pub fn checkpoint(&self, seq: u64) -> String {
        format!("{}{:020}", self.checkpoints(), seq)
    }

    pub fn snapshots(&self) -> String {
        format!("{}index/", self.root)
    }

    pub fn snapshot(&self, seq: u64) -> String {
        format!("{}{:020}", self.snapshots(), seq)
    }
}

/// Every build id with metadata in the store
pub fn persisted_builds(store: &CheckpointStore) -> Result<Vec<BuildId>> {
    let mut builds = BTreeSet::new();
    for key in store.scan_keys(INDEX_BUILDS_PREFIX)? {
        let rest = &key[INDEX_BUILDS_PREFIX.len()..];
        if let Some((id, tail)) = rest.split_once('/') {
            if tail == "meta" {
                let uuid = uuid::Uuid::parse_str(id)
                    .map_err(|e| StrataError::Storage(format!("bad build key {}: {}", key, e)))?;
                builds.insert(BuildId(uuid));
            }
        }
    }
    Ok(builds.into_iter().collect())
}

pub fn load_record(store: &CheckpointStore, build_id: BuildId) -> Result<Option<IndexBuildRecord>> {
    store.get_record(&BuildKeys::new(build_id).meta())
}

/// Checkpoint history of a build, oldest first
pub fn load_history(store: &CheckpointStore, build_id: BuildId) -> Result<Vec<IndexBuildCheckpoint>> {
    let keys = BuildKeys::new(build_id);
    Ok(store
        .scan_records::<IndexBuildCheckpoint>(&keys.checkpoints())?
        .into_iter()
        .map(|(_, cp)| cp)
        .collect())
}

pub fn load_snapshot(store: &CheckpointStore, build_id: BuildId, seq: u64) -> Result<BTreeSet<IndexEntry>> {
    let entries: Vec<IndexEntry> = store
        .get_record(&BuildKeys::new(build_id).snapshot(seq))?
        .ok_or_else(|| {
            StrataError::NotFound(format!("index snapshot {} of build {}", seq, build_id))
        })?;
    Ok(entries.into_iter().collect())
}

/// Delete every record of a build
pub fn delete_build(store: &CheckpointStore, build_id: BuildId) -> Result<usize> {
    store.delete_prefix(BuildKeys::new(build_id).root())
}
