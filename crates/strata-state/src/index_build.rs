// RESUMABLE INDEX BUILD
// Index build state machine: Initializing -> CollectionScan -> BulkLoad -> DrainWrites
// -> Committing -> Done, with Aborted reachable from every non-terminal phase
//
// SAFETY INVARIANTS:
// 1. Phases advance strictly in order; every transition follows a durable write of the
//    previous phase's completion
// 2. The scan cursor in a checkpoint never covers entries that are not in a persisted run
// 3. Side writes are applied with set semantics, so replaying a batch is idempotent
// 4. Cancellation is observed between steps, never in the middle of a batch
// 5. Done and Aborted delete every record of the build

use serde::{Serialize, Deserialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use log::{debug, error, info, warn};

use strata_core::{BuildId, Document, IndexBuildConfig, Namespace, Result, StrataError, Timestamp};
use crate::checkpoint_store::CheckpointStore;
use crate::external_sort::{ExternalSorter, RunId};
use crate::index_checkpoint::{
    checkpoint_is_trusted, delete_build, load_history, load_record, load_snapshot, BuildKeys, CheckpointPhase,
    IndexBuildCheckpoint, IndexBuildRecord,
};
use crate::index_key::{apply_side_write, find_duplicate_key, IndexEntry, IndexSpec};
use crate::oplog::{OplogEntry, OplogOp};
use crate::replication::ReplicationLog;

/// What an index build reads from and installs into
pub trait IndexBuildSource: ReplicationLog {
    /// Up to `limit` documents with `_id` greater than `cursor`, in `_id` order
    fn scan_after(&self, ns: &Namespace, cursor: Option<i64>, limit: usize) -> Result<Vec<Document>>;

    /// Up to `limit` logged writes affecting `ns` with a timestamp after `after`
    fn side_writes_after(&self, ns: &Namespace, after: Timestamp, limit: usize) -> Result<Vec<OplogEntry>>;

    /// Make the index visible if nothing touched `ns` after `drained_through`.
    /// Returns `None` when newer writes must be drained first.
    fn install_index(&self, ns: &Namespace, spec: &IndexSpec, drained_through: Timestamp) -> Result<Option<Timestamp>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub enum IndexBuildPhase {
    Initializing,
    CollectionScan,
    BulkLoad,
    DrainWrites,
    Committing,
    Done,
    Aborted,
}

impl IndexBuildPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IndexBuildPhase::Done | IndexBuildPhase::Aborted)
    }

    pub fn can_transition_to(&self, next: IndexBuildPhase) -> bool {
        use IndexBuildPhase::*;
        match (self, next) {
            (Initializing, CollectionScan)
            | (CollectionScan, BulkLoad)
            | (BulkLoad, DrainWrites)
            | (DrainWrites, Committing)
            | (Committing, Done) => true,
            (current, Aborted) => !current.is_terminal(),
            _ => false,
        }
    }
}

/// Snapshot of build progress published to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexBuildStatus {
    pub build_id: BuildId,
    pub ns: Namespace,
    pub index: String,
    pub phase: IndexBuildPhase,
    pub scan_cursor: Option<i64>,
    pub sorted_runs: usize,
    pub drain_batches_applied: u64,
    pub last_checkpoint: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IndexBuildOutcome {
    pub build_id: BuildId,
    pub entries: BTreeSet<IndexEntry>,
    pub installed_at: Timestamp,
}

/// Errors that end the build instead of suspending it
fn is_fatal(e: &StrataError) -> bool {
    matches!(
        e,
        StrataError::ConstraintViolation(_) | StrataError::Aborted(_) | StrataError::NotFound(_)
    )
}

pub struct IndexBuilder {
    record: IndexBuildRecord,
    source: Arc<dyn IndexBuildSource>,
    store: CheckpointStore,
    sorter: ExternalSorter,
    keys: BuildKeys,
    config: IndexBuildConfig,
    phase: IndexBuildPhase,

    read_cursor: Option<i64>,
    durable_cursor: Option<i64>,
    buffer: Vec<IndexEntry>,
    runs: Vec<RunId>,
    next_run: u64,

    index: BTreeSet<IndexEntry>,
    drain_position: Timestamp,
    drain_batches_applied: u64,

    next_seq: u64,
    last_checkpoint: Option<u64>,
    installed_at: Option<Timestamp>,
    error: Option<String>,
    status: watch::Sender<IndexBuildStatus>,
    cancel: CancellationToken,
}

impl IndexBuilder {
    fn assemble(
        record: IndexBuildRecord,
        source: Arc<dyn IndexBuildSource>,
        store: CheckpointStore,
        config: IndexBuildConfig,
    ) -> Self {
        let keys = BuildKeys::new(record.build_id);
        let sorter = ExternalSorter::new(store.clone(), keys.root());
        let (status, _) = watch::channel(IndexBuildStatus {
            build_id: record.build_id,
            ns: record.ns.clone(),
            index: record.spec.name.clone(),
            phase: IndexBuildPhase::Initializing,
            scan_cursor: None,
            sorted_runs: 0,
            drain_batches_applied: 0,
            last_checkpoint: None,
            error: None,
        });
        IndexBuilder {
            drain_position: record.started_at,
            record,
            source,
            store,
            sorter,
            keys,
            config,
            phase: IndexBuildPhase::Initializing,
            read_cursor: None,
            durable_cursor: None,
            buffer: Vec::new(),
            runs: Vec::new(),
            next_run: 0,
            index: BTreeSet::new(),
            drain_batches_applied: 0,
            next_seq: 0,
            last_checkpoint: None,
            installed_at: None,
            error: None,
            status,
            cancel: CancellationToken::new(),
        }
    }

    /// Register a new build; writes the build record before anything else
    pub fn start(
        source: Arc<dyn IndexBuildSource>,
        store: CheckpointStore,
        config: IndexBuildConfig,
        ns: Namespace,
        spec: IndexSpec,
    ) -> Result<Self> {
        let record = IndexBuildRecord {
            build_id: BuildId::generate(),
            ns,
            spec,
            started_at: source.last_applied(),
        };
        store.put_record(&BuildKeys::new(record.build_id).meta(), &record)?;
        info!(
            "Index build {} started: {} on {} at {}",
            record.build_id, record.spec.name, record.ns, record.started_at
        );
        let builder = IndexBuilder::assemble(record, source, store, config);
        builder.publish();
        Ok(builder)
    }

    /// Rebuild a build from its newest persisted checkpoint.
    ///
    /// Without any checkpoint the build restarts from Initializing with a fresh start time.
    pub fn resume(
        build_id: BuildId,
        source: Arc<dyn IndexBuildSource>,
        store: CheckpointStore,
        config: IndexBuildConfig,
    ) -> Result<Self> {
        let mut record = load_record(&store, build_id)?
            .ok_or_else(|| StrataError::NotFound(format!("index build {}", build_id)))?;
        let history = load_history(&store, build_id)?;

        let latest = match history.last() {
            Some(cp) => cp.clone(),
            None => {
                record.started_at = source.last_applied();
                store.put_record(&BuildKeys::new(build_id).meta(), &record)?;
                let builder = IndexBuilder::assemble(record, source, store, config);
                collect_build_garbage(&builder.store, build_id, &[])?;
                info!("Index build {} has no checkpoint, restarting from Initializing", build_id);
                builder.publish();
                return Ok(builder);
            }
        };

        let mut builder = IndexBuilder::assemble(record, source, store, config);
        builder.read_cursor = latest.scan_cursor;
        builder.durable_cursor = latest.scan_cursor;
        builder.next_seq = latest.seq + 1;
        builder.last_checkpoint = Some(latest.seq);
        builder.phase = match latest.phase {
            CheckpointPhase::CollectionScan => {
                builder.runs = latest.sorted_runs.clone();
                IndexBuildPhase::CollectionScan
            }
            CheckpointPhase::BulkLoad => {
                builder.runs = latest.sorted_runs.clone();
                IndexBuildPhase::BulkLoad
            }
            CheckpointPhase::DrainWrites => {
                builder.index = load_snapshot(&builder.store, build_id, latest.seq)?;
                builder.drain_position = latest.drain_position;
                builder.drain_batches_applied = latest.drain_batches_applied;
                IndexBuildPhase::DrainWrites
            }
        };

        collect_build_garbage(&builder.store, build_id, &builder.runs)?;
        builder.next_run = builder
            .sorter
            .persisted_runs()?
            .iter()
            .map(|r| r.0 + 1)
            .max()
            .unwrap_or(0);

        info!(
            "Index build {} resumed from checkpoint {} in {:?}",
            build_id, latest.seq, builder.phase
        );
        builder.publish();
        Ok(builder)
    }

    /// Observe an external abort signal between steps
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn build_id(&self) -> BuildId {
        self.record.build_id
    }

    pub fn record(&self) -> &IndexBuildRecord {
        &self.record
    }

    pub fn phase(&self) -> IndexBuildPhase {
        self.phase
    }

    /// Entries built so far
    pub fn index(&self) -> &BTreeSet<IndexEntry> {
        &self.index
    }

    pub fn status(&self) -> IndexBuildStatus {
        self.status.borrow().clone()
    }

    /// Status updates; readers never block the build
    pub fn subscribe(&self) -> watch::Receiver<IndexBuildStatus> {
        self.status.subscribe()
    }

    fn publish(&self) {
        self.status.send_replace(IndexBuildStatus {
            build_id: self.record.build_id,
            ns: self.record.ns.clone(),
            index: self.record.spec.name.clone(),
            phase: self.phase,
            scan_cursor: self.durable_cursor,
            sorted_runs: self.runs.len(),
            drain_batches_applied: self.drain_batches_applied,
            last_checkpoint: self.last_checkpoint,
            error: self.error.clone(),
        });
    }

    fn transition(&mut self, next: IndexBuildPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(StrataError::InvalidState(format!(
                "index build {}: {:?} -> {:?} is not a valid transition",
                self.record.build_id, self.phase, next
            )));
        }
        info!("Index build {}: {:?} -> {:?}", self.record.build_id, self.phase, next);
        self.phase = next;
        self.publish();
        Ok(())
    }

    /// Execute one unit of work and return the phase reached
    pub fn step(&mut self) -> Result<IndexBuildPhase> {
        if self.phase.is_terminal() {
            return Ok(self.phase);
        }
        let result = if self.cancel.is_cancelled() {
            Err(StrataError::Aborted(format!("index build {} cancelled", self.record.build_id)))
        } else {
            match self.phase {
                IndexBuildPhase::Initializing => self.transition(IndexBuildPhase::CollectionScan),
                IndexBuildPhase::CollectionScan => self.scan_batch(),
                IndexBuildPhase::BulkLoad => self.bulk_load(),
                IndexBuildPhase::DrainWrites => self.drain_batch(),
                IndexBuildPhase::Committing => self.commit(),
                IndexBuildPhase::Done | IndexBuildPhase::Aborted => Ok(()),
            }
        };
        match result {
            Ok(()) => Ok(self.phase),
            Err(e) if is_fatal(&e) => {
                self.fail(&e)?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Step synchronously until terminal or `max_steps` steps were taken
    pub fn drive(&mut self, max_steps: usize) -> Result<IndexBuildPhase> {
        for _ in 0..max_steps {
            if self.phase.is_terminal() {
                break;
            }
            self.step()?;
        }
        Ok(self.phase)
    }

    /// Step until `stop` holds for the published status or the build ends
    pub async fn run_until<F>(&mut self, stop: F) -> Result<IndexBuildPhase>
    where
        F: Fn(&IndexBuildStatus) -> bool,
    {
        while !self.phase.is_terminal() && !stop(&self.status.borrow()) {
            self.step()?;
            tokio::task::yield_now().await;
        }
        Ok(self.phase)
    }

    /// Run to completion
    pub async fn run(&mut self) -> Result<IndexBuildOutcome> {
        self.run_until(|_| false).await?;
        match (self.phase, self.installed_at) {
            (IndexBuildPhase::Done, Some(installed_at)) => Ok(IndexBuildOutcome {
                build_id: self.record.build_id,
                entries: self.index.clone(),
                installed_at,
            }),
            _ => Err(StrataError::Aborted(
                self.error.clone().unwrap_or_else(|| "index build aborted".to_string()),
            )),
        }
    }

    /// Abort from any non-terminal phase, discarding every partial structure
    pub fn abort(&mut self, reason: &str) -> Result<()> {
        match self.phase {
            IndexBuildPhase::Aborted => Ok(()),
            IndexBuildPhase::Done => Err(StrataError::InvalidState(format!(
                "index build {} already committed",
                self.record.build_id
            ))),
            _ => self.fail(&StrataError::Aborted(reason.to_string())),
        }
    }

    fn fail(&mut self, reason: &StrataError) -> Result<()> {
        error!("Index build {} aborted: {}", self.record.build_id, reason);
        self.phase = IndexBuildPhase::Aborted;
        self.error = Some(reason.to_string());
        self.buffer.clear();
        self.index.clear();
        self.runs.clear();
        delete_build(&self.store, self.record.build_id)?;
        self.publish();
        Ok(())
    }

    // === Phase work ===

    fn scan_batch(&mut self) -> Result<()> {
        let docs = self
            .source
            .scan_after(&self.record.ns, self.read_cursor, self.config.scan_batch_size)?;

        if docs.is_empty() {
            if !self.buffer.is_empty() {
                self.spill_buffer()?;
            }
            self.write_checkpoint(CheckpointPhase::BulkLoad)?;
            return self.transition(IndexBuildPhase::BulkLoad);
        }

        for doc in docs {
            self.buffer.push(self.record.spec.entry_for(&doc));
            self.read_cursor = Some(doc.id);
            if self.buffer.len() >= self.config.spill_threshold_entries {
                self.spill_buffer()?;
                self.write_checkpoint(CheckpointPhase::CollectionScan)?;
            }
        }
        Ok(())
    }

    fn spill_buffer(&mut self) -> Result<()> {
        let id = RunId(self.next_run);
        self.next_run += 1;
        self.sorter.spill(id, std::mem::take(&mut self.buffer))?;
        self.runs.push(id);
        self.durable_cursor = self.read_cursor;
        Ok(())
    }

    fn bulk_load(&mut self) -> Result<()> {
        let merged = self.sorter.merge(&self.runs)?;
        if self.record.spec.unique {
            if let Some((a, b)) = find_duplicate_key(&merged) {
                let concurrent = self
                    .source
                    .side_writes_after(&self.record.ns, self.record.started_at, 1)?;
                if concurrent.is_empty() {
                    return Err(StrataError::ConstraintViolation(format!(
                        "duplicate key {:?} for index {} (records {} and {})",
                        a.key, self.record.spec.name, a.doc_id, b.doc_id
                    )));
                }
                warn!(
                    "Index build {}: duplicate key {:?} may be resolved by concurrent writes, checking again at commit",
                    self.record.build_id, a.key
                );
            }
        }

        self.index = merged.into_iter().collect();
        self.runs.clear();
        self.drain_position = self.record.started_at;
        self.drain_batches_applied = 0;
        self.write_checkpoint(CheckpointPhase::DrainWrites)?;
        self.transition(IndexBuildPhase::DrainWrites)
    }

    fn drain_batch(&mut self) -> Result<()> {
        let writes = self.source.side_writes_after(
            &self.record.ns,
            self.drain_position,
            self.config.max_drain_batch_size,
        )?;
        if writes.is_empty() {
            return self.transition(IndexBuildPhase::Committing);
        }
        self.apply_side_writes(&writes)?;
        self.drain_batches_applied += 1;
        self.write_checkpoint(CheckpointPhase::DrainWrites)
    }

    fn apply_side_writes(&mut self, writes: &[OplogEntry]) -> Result<()> {
        for entry in writes {
            match entry.op.images() {
                Some((before, after)) => {
                    apply_side_write(&mut self.index, &self.record.spec, before, after);
                }
                None => match &entry.op {
                    OplogOp::CreateIndex { .. } => {}
                    other => {
                        return Err(StrataError::Aborted(format!(
                            "{} changed during index build {} ({:?} at {})",
                            self.record.ns, self.record.build_id, other, entry.ts
                        )));
                    }
                },
            }
            self.drain_position = entry.ts;
        }
        debug!(
            "Index build {}: applied {} side writes through {}",
            self.record.build_id,
            writes.len(),
            self.drain_position
        );
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        // Writes keep arriving until the index is visible
        loop {
            let writes = self.source.side_writes_after(
                &self.record.ns,
                self.drain_position,
                self.config.max_drain_batch_size,
            )?;
            if writes.is_empty() {
                break;
            }
            self.apply_side_writes(&writes)?;
        }

        if self.record.spec.unique {
            if let Some((a, b)) = find_duplicate_key(&self.index) {
                return Err(StrataError::ConstraintViolation(format!(
                    "duplicate key {:?} for index {} (records {} and {})",
                    a.key, self.record.spec.name, a.doc_id, b.doc_id
                )));
            }
        }

        match self
            .source
            .install_index(&self.record.ns, &self.record.spec, self.drain_position)?
        {
            Some(ts) => {
                self.installed_at = Some(ts);
                delete_build(&self.store, self.record.build_id)?;
                self.transition(IndexBuildPhase::Done)?;
                info!(
                    "Index build {} committed {} with {} entries",
                    self.record.build_id,
                    self.record.spec.name,
                    self.index.len()
                );
                Ok(())
            }
            None => {
                debug!("Index build {}: writes raced the commit, draining again", self.record.build_id);
                Ok(())
            }
        }
    }

    // === Checkpoints ===

    fn write_checkpoint(&mut self, phase: CheckpointPhase) -> Result<()> {
        let seq = self.next_seq;
        if phase == CheckpointPhase::DrainWrites {
            let snapshot: Vec<IndexEntry> = self.index.iter().cloned().collect();
            self.store.put_record(&self.keys.snapshot(seq), &snapshot)?;
        }
        let checkpoint = IndexBuildCheckpoint {
            build_id: self.record.build_id,
            seq,
            phase,
            scan_cursor: self.durable_cursor,
            sorted_runs: self.runs.clone(),
            drain_batches_applied: self.drain_batches_applied,
            drain_position: self.drain_position,
            written_at: self.source.last_applied(),
        };
        self.store.put_record(&self.keys.checkpoint(seq), &checkpoint)?;
        self.next_seq += 1;
        self.last_checkpoint = Some(seq);
        debug!(
            "Index build {}: checkpoint {} ({:?}) at {}",
            self.record.build_id, seq, phase, checkpoint.written_at
        );

        self.prune_history()?;
        self.publish();
        Ok(())
    }

    /// Keep the newest `max_retained_checkpoints` entries plus the newest majority-committed one,
    /// which is where a rollback falls back to
    fn prune_history(&self) -> Result<()> {
        let history = load_history(&self.store, self.record.build_id)?;
        let retained = self.config.max_retained_checkpoints;
        if history.len() > retained {
            let majority = self.source.majority_commit_point();
            let anchor = history
                .iter()
                .rev()
                .find(|cp| checkpoint_is_trusted(cp, majority))
                .map(|cp| cp.seq);
            for cp in &history[..history.len() - retained] {
                if Some(cp.seq) != anchor {
                    self.store.delete_record(&self.keys.checkpoint(cp.seq))?;
                }
            }
        }
        collect_build_garbage(&self.store, self.record.build_id, &self.runs)
    }
}

/// Delete runs and index snapshots that no retained checkpoint references
pub fn collect_build_garbage(store: &CheckpointStore, build_id: BuildId, in_use: &[RunId]) -> Result<()> {
    let keys = BuildKeys::new(build_id);
    let history = load_history(store, build_id)?;

    let mut live_runs: HashSet<RunId> = in_use.iter().copied().collect();
    let mut live_snapshots = HashSet::new();
    for cp in &history {
        live_runs.extend(cp.sorted_runs.iter().copied());
        if cp.phase == CheckpointPhase::DrainWrites {
            live_snapshots.insert(keys.snapshot(cp.seq));
        }
    }

    let sorter = ExternalSorter::new(store.clone(), keys.root());
    let mut removed = 0usize;
    for run in sorter.persisted_runs()? {
        if !live_runs.contains(&run) {
            sorter.delete_run(run)?;
            removed += 1;
        }
    }
    for key in store.scan_keys(&keys.snapshots())? {
        if !live_snapshots.contains(&key) {
            store.delete_record(&key)?;
            removed += 1;
        }
    }
    if removed > 0 {
        debug!("Index build {}: removed {} unreferenced artifacts", build_id, removed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable_store::MemoryStore;
    use crate::index_checkpoint::persisted_builds;
    use crate::rollback_adapter::{ResumePoint, RollbackAdapter};
    use crate::shard_node::ShardNode;
    use strata_core::{PartitionKey, ShardId};

    fn ns() -> Namespace {
        "test.coll".parse().unwrap()
    }

    fn setup(docs: i64) -> Arc<ShardNode> {
        let node = Arc::new(ShardNode::new(
            ShardId(0),
            CheckpointStore::new(Arc::new(MemoryStore::new())),
        ));
        for i in 0..docs {
            node.insert(&ns(), Document::new(i).with("a", i % 7)).unwrap();
        }
        node
    }

    fn config() -> IndexBuildConfig {
        IndexBuildConfig {
            max_drain_batch_size: 2,
            spill_threshold_entries: 3,
            scan_batch_size: 2,
            max_retained_checkpoints: 4,
        }
    }

    fn spec() -> IndexSpec {
        IndexSpec::new("a_1", PartitionKey::single("a"))
    }

    #[test]
    fn test_transition_table() {
        use IndexBuildPhase::*;
        assert!(Initializing.can_transition_to(CollectionScan));
        assert!(DrainWrites.can_transition_to(Aborted));
        assert!(!Initializing.can_transition_to(BulkLoad));
        assert!(!DrainWrites.can_transition_to(CollectionScan));
        assert!(!Done.can_transition_to(Aborted));
    }

    #[tokio::test]
    async fn test_build_matches_catalog_and_cleans_up() {
        let node = setup(10);
        let store = node.store().clone();
        let mut builder = IndexBuilder::start(node.clone(), store.clone(), config(), ns(), spec()).unwrap();

        node.update(&ns(), Document::new(3).with("a", 100)).unwrap();
        node.delete(&ns(), 4).unwrap();
        node.insert(&ns(), Document::new(50).with("a", 1)).unwrap();

        let outcome = builder.run().await.unwrap();
        assert_eq!(builder.phase(), IndexBuildPhase::Done);
        assert_eq!(Some(outcome.entries), node.index_entries(&ns(), "a_1"));
        assert!(persisted_builds(&store).unwrap().is_empty());
        assert!(store.scan_keys("indexBuilds/").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unique_violation_aborts_and_discards() {
        let node = setup(0);
        node.insert(&ns(), Document::new(1).with("a", 5)).unwrap();
        node.insert(&ns(), Document::new(2).with("a", 5)).unwrap();
        let store = node.store().clone();

        let mut builder =
            IndexBuilder::start(node.clone(), store.clone(), config(), ns(), spec().unique()).unwrap();
        let err = builder.run().await.unwrap_err();
        assert!(matches!(err, StrataError::ConstraintViolation(_)));
        assert_eq!(builder.phase(), IndexBuildPhase::Aborted);
        assert!(builder.status().error.is_some());
        assert!(store.scan_keys("indexBuilds/").unwrap().is_empty());
        assert!(node.list_indexes(&ns()).is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_observed_between_steps() {
        let node = setup(10);
        let token = CancellationToken::new();
        let mut builder = IndexBuilder::start(node.clone(), node.store().clone(), config(), ns(), spec())
            .unwrap()
            .with_cancellation(token.clone());
        let mut status = builder.subscribe();

        builder.step().unwrap();
        token.cancel();
        assert!(matches!(builder.step(), Err(StrataError::Aborted(_))));
        assert_eq!(status.borrow_and_update().phase, IndexBuildPhase::Aborted);
    }

    #[test]
    fn test_history_is_pruned() {
        let node = setup(30);
        let store = node.store().clone();
        let mut builder = IndexBuilder::start(node.clone(), store.clone(), config(), ns(), spec()).unwrap();
        builder.drive(8).unwrap();
        let history = load_history(&store, builder.build_id()).unwrap();
        assert!(!history.is_empty());
        assert!(history.len() <= config().max_retained_checkpoints);
        assert!(history.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn test_pruning_keeps_newest_majority_committed_checkpoint() {
        let node = setup(40);
        let store = node.store().clone();
        let config = IndexBuildConfig { max_retained_checkpoints: 2, ..config() };
        let mut builder = IndexBuilder::start(node.clone(), store.clone(), config.clone(), ns(), spec()).unwrap();
        let build_id = builder.build_id();
        while load_history(&store, build_id).unwrap().is_empty() {
            builder.step().unwrap();
        }
        node.commit_majority();
        let trusted = load_history(&store, build_id).unwrap().last().unwrap().seq;

        // Later checkpoints are written while the majority point lags
        let mut next_id = 1_000;
        while load_history(&store, build_id).unwrap().last().unwrap().seq < trusted + 4 {
            assert!(!builder.phase().is_terminal());
            node.insert(&ns(), Document::new(next_id).with("a", 3)).unwrap();
            next_id += 1;
            builder.step().unwrap();
        }
        let history = load_history(&store, build_id).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].seq, trusted);
        drop(builder);

        let adapter = RollbackAdapter::new(store.clone(), node.clone());
        let outcome = adapter.on_rollback(build_id, node.last_applied()).unwrap();
        match outcome.resume {
            ResumePoint::FromCheckpoint(cp) => assert_eq!(cp.seq, trusted),
            other => panic!("expected to resume from checkpoint {}, got {:?}", trusted, other),
        }

        let mut resumed = IndexBuilder::resume(build_id, node.clone(), store, config).unwrap();
        assert_eq!(resumed.drive(usize::MAX).unwrap(), IndexBuildPhase::Done);
        assert_eq!(Some(resumed.index().clone()), node.index_entries(&ns(), "a_1"));
    }

    #[test]
    fn test_resume_without_checkpoint_restarts() {
        let node = setup(2);
        let store = node.store().clone();
        let builder = IndexBuilder::start(node.clone(), store.clone(), config(), ns(), spec()).unwrap();
        let build_id = builder.build_id();
        drop(builder);

        let mut resumed = IndexBuilder::resume(build_id, node.clone(), store, config()).unwrap();
        assert_eq!(resumed.phase(), IndexBuildPhase::Initializing);
        assert_eq!(resumed.drive(100).unwrap(), IndexBuildPhase::Done);
    }
}
