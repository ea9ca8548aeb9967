// RESHARDING PARTICIPANTS
// Per-shard donor and recipient state machines, driven by the coordination
// documents the coordinator sends
//
// Donor:     PreparingToDonate -> DonatingInitialData -> DonatingOplogEntries -> Done
// Recipient: AwaitingFetchTimestamp -> Cloning -> BuildingIndexes -> Applying -> CaughtUp -> Done
// Either may enter Error, after which it waits for the coordinator's decision
//
// SAFETY INVARIANTS:
// 1. Participant state is persisted before the report that depends on it
// 2. A recipient clones exactly the snapshot at the fetch timestamp, then applies only
//    donor entries after it
// 3. On abort, every temporary artifact is gone before DecisionApplied is reported
// 4. A donor only drops the source collection it registered (uuid-checked)

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use log::{debug, error, info, warn};
use uuid::Uuid;

use strata_core::{
    BuildId, IndexBuildConfig, Namespace, OperationId, ReshardingConfig, Result, ShardId, StrataError, Timestamp,
};
use crate::index_build::{IndexBuildSource, IndexBuilder};
use crate::index_checkpoint::{delete_build, load_record};
use crate::index_key::IndexSpec;
use crate::oplog_fetcher::{DonorOplogId, OplogSource, RecipientOp, ReshardingOplogFetcher};
use crate::replication::ReplicationLog;
use crate::resharding_document::{CoordinationDocument, Decision, ParticipantRole};
use crate::retry::with_backoff;
use crate::shard_node::ShardNode;
use crate::transport::{CoordinatorHandle, CoordinatorMessage, DonorClient, ParticipantReport};

pub const PARTICIPANTS_PREFIX: &str = "reshardingParticipants/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DonorState {
    PreparingToDonate,
    DonatingInitialData,
    DonatingOplogEntries,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecipientState {
    AwaitingFetchTimestamp,
    Cloning,
    BuildingIndexes,
    Applying,
    CaughtUp,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonorStateDoc {
    /// Operation this state belongs to
    pub operation_id: OperationId,

    /// Collection being donated
    pub source_ns: Namespace,

    /// Current donor state
    pub state: DonorState,

    /// Identity of the collection this donor agreed to donate
    pub source_uuid: Option<Uuid>,

    /// Last applied time when the donor prepared; reported to the coordinator
    pub min_fetch_timestamp: Option<Timestamp>,

    /// Decision this donor applied
    pub decision: Option<Decision>,

    /// Failure that moved the donor to Error
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientStateDoc {
    /// Operation this state belongs to
    pub operation_id: OperationId,

    /// Collection being resharded
    pub source_ns: Namespace,

    /// Temporary collection receiving cloned and caught-up documents
    pub temp_ns: Namespace,

    /// Current recipient state
    pub state: RecipientState,

    /// Snapshot time the clone was taken at
    pub fetch_timestamp: Option<Timestamp>,

    /// Last donor oplog entry applied, per donor
    pub donor_positions: BTreeMap<ShardId, DonorOplogId>,

    /// Index build on the new key, resumed by id after a restart
    pub index_build: Option<BuildId>,

    /// Decision this recipient applied
    pub decision: Option<Decision>,

    /// Failure that moved the recipient to Error
    pub error: Option<String>,
}

pub fn donor_state_key(operation_id: OperationId) -> String {
    format!("{}{}/donor", PARTICIPANTS_PREFIX, operation_id)
}

pub fn recipient_state_key(operation_id: OperationId) -> String {
    format!("{}{}/recipient", PARTICIPANTS_PREFIX, operation_id)
}

/// Wait for a document satisfying `ready`
async fn wait_doc<F>(docs: &mut watch::Receiver<CoordinationDocument>, ready: F) -> Result<CoordinationDocument>
where
    F: Fn(&CoordinationDocument) -> bool,
{
    loop {
        {
            let doc = docs.borrow_and_update();
            if ready(&doc) {
                return Ok(doc.clone());
            }
        }
        if docs.changed().await.is_err() {
            return Err(StrataError::Interrupted("participant host stopped".to_string()));
        }
    }
}

async fn wait_for_decision(docs: &mut watch::Receiver<CoordinationDocument>) -> Result<Decision> {
    let doc = wait_doc(docs, |d| d.decision.is_some()).await?;
    doc.decision
        .ok_or_else(|| StrataError::invalid_state("decision vanished from coordination document"))
}

fn current_decision(docs: &watch::Receiver<CoordinationDocument>) -> Option<Decision> {
    docs.borrow().decision
}

/// A donor and its oplog source, `None` while unreachable
type DonorConnection = (ShardId, Option<Arc<dyn OplogSource>>);

struct OperationTasks {
    docs: watch::Sender<CoordinationDocument>,
    cancel: CancellationToken,
    /// Role tasks still running for the operation
    running: AtomicUsize,
}

/// Runs the donor and recipient roles of one shard
pub struct ParticipantHost {
    node: Arc<ShardNode>,
    coordinator: Arc<dyn CoordinatorHandle>,
    donors: Arc<dyn DonorClient>,
    resharding: ReshardingConfig,
    index_build: IndexBuildConfig,
    ops: DashMap<OperationId, OperationTasks>,
    shutdown: CancellationToken,
}

impl ParticipantHost {
    pub fn new(
        node: Arc<ShardNode>,
        coordinator: Arc<dyn CoordinatorHandle>,
        donors: Arc<dyn DonorClient>,
        resharding: ReshardingConfig,
        index_build: IndexBuildConfig,
    ) -> Self {
        ParticipantHost {
            node,
            coordinator,
            donors,
            resharding,
            index_build,
            ops: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.node.shard_id()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Persisted donor state for `operation_id`, if this shard donates
    pub fn donor_state(&self, operation_id: OperationId) -> Result<Option<DonorStateDoc>> {
        self.node.store().get_record(&donor_state_key(operation_id))
    }

    pub fn recipient_state(&self, operation_id: OperationId) -> Result<Option<RecipientStateDoc>> {
        self.node.store().get_record(&recipient_state_key(operation_id))
    }

    /// Consume coordinator messages until the channel closes or the host shuts down
    pub fn spawn_inbox(self: &Arc<Self>, mut inbox: mpsc::UnboundedReceiver<CoordinatorMessage>) -> JoinHandle<()> {
        let host = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = inbox.recv() => match message {
                        Some(message) => host.handle(message),
                        None => break,
                    },
                    _ = host.shutdown.cancelled() => break,
                }
            }
            debug!("[{}] participant inbox closed", host.shard_id());
        })
    }

    /// Deliver one coordinator message; older document versions are ignored
    pub fn handle(self: &Arc<Self>, message: CoordinatorMessage) {
        let doc = message.into_document();
        let operation_id = doc.operation_id;
        match self.ops.entry(operation_id) {
            Entry::Occupied(tasks) => {
                let tasks = tasks.get();
                let aborting = doc.decision == Some(Decision::Abort);
                let newer = tasks.docs.send_if_modified(|current| {
                    if doc.version > current.version {
                        *current = doc.clone();
                        true
                    } else {
                        false
                    }
                });
                if newer && aborting {
                    tasks.cancel.cancel();
                }
            }
            Entry::Vacant(slot) => {
                let shard = self.shard_id();
                // A decided message is still served so the ack can be repeated
                match self.already_applied(&doc) {
                    Ok(true) if doc.decision.is_none() => {
                        debug!("[{}] ignoring late message for finished resharding {}", shard, operation_id);
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("[{}] could not read state of resharding {}: {}", shard, operation_id, e),
                }
                let cancel = self.shutdown.child_token();
                if doc.decision == Some(Decision::Abort) {
                    cancel.cancel();
                }
                let is_donor = doc.donors.contains(&shard);
                let is_recipient = doc.recipients.contains(&shard);
                let (tx, _) = watch::channel(doc.clone());
                if is_donor {
                    let host = self.clone();
                    let docs = tx.subscribe();
                    tokio::spawn(async move {
                        host.clone().run_donor(docs).await;
                        host.role_finished(operation_id);
                    });
                }
                if is_recipient {
                    let host = self.clone();
                    let docs = tx.subscribe();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        host.clone().run_recipient(docs, cancel).await;
                        host.role_finished(operation_id);
                    });
                }
                info!("[{}] joined resharding {} of {}", shard, operation_id, doc.source_ns);
                let running = AtomicUsize::new(usize::from(is_donor) + usize::from(is_recipient));
                slot.insert(OperationTasks { docs: tx, cancel, running });
            }
        }
    }

    /// Operations this shard is still working on
    pub fn active_operations(&self) -> usize {
        self.ops.len()
    }

    /// True when every role this shard plays in `doc` already reached Done
    fn already_applied(&self, doc: &CoordinationDocument) -> Result<bool> {
        let shard = self.shard_id();
        if doc.donors.contains(&shard)
            && self.donor_state(doc.operation_id)?.map(|s| s.state) != Some(DonorState::Done)
        {
            return Ok(false);
        }
        if doc.recipients.contains(&shard)
            && self.recipient_state(doc.operation_id)?.map(|s| s.state) != Some(RecipientState::Done)
        {
            return Ok(false);
        }
        Ok(true)
    }

    fn role_finished(&self, operation_id: OperationId) {
        let last = match self.ops.get(&operation_id) {
            Some(tasks) => tasks.running.fetch_sub(1, Ordering::SeqCst) == 1,
            None => false,
        };
        if last {
            self.ops.remove(&operation_id);
            debug!("[{}] released resharding {}", self.shard_id(), operation_id);
        }
    }

    async fn report(&self, operation_id: OperationId, report: ParticipantReport) -> Result<()> {
        let what = format!("report from {} for {}", self.shard_id(), operation_id);
        let result = with_backoff(&self.resharding.retry, &what, &self.shutdown, || {
            self.coordinator.report(operation_id, report.clone())
        })
        .await;
        if let Err(e) = &result {
            warn!("[{}] {:?} was not accepted: {}", self.shard_id(), report, e);
        }
        result
    }

    // === Donor ===

    async fn run_donor(self: Arc<Self>, mut docs: watch::Receiver<CoordinationDocument>) {
        let doc = docs.borrow().clone();
        let result = match self.load_donor(&doc) {
            Ok(mut state) => self.donate(&mut state, &mut docs).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!("[{}] donor for {} stopped: {}", self.shard_id(), doc.operation_id, e);
        }
    }

    fn load_donor(&self, doc: &CoordinationDocument) -> Result<DonorStateDoc> {
        let key = donor_state_key(doc.operation_id);
        match self.node.store().get_record::<DonorStateDoc>(&key)? {
            Some(state) => Ok(state),
            None => {
                let state = DonorStateDoc {
                    operation_id: doc.operation_id,
                    source_ns: doc.source_ns.clone(),
                    state: DonorState::PreparingToDonate,
                    source_uuid: None,
                    min_fetch_timestamp: None,
                    decision: None,
                    error: None,
                };
                self.node.store().put_record(&key, &state)?;
                Ok(state)
            }
        }
    }

    fn persist_donor(&self, state: &DonorStateDoc) -> Result<()> {
        debug!("[{}] donor {} -> {:?}", self.shard_id(), state.operation_id, state.state);
        self.node.store().put_record(&donor_state_key(state.operation_id), state)
    }

    async fn donate(&self, state: &mut DonorStateDoc, docs: &mut watch::Receiver<CoordinationDocument>) -> Result<()> {
        let decision = self.donate_until_decision(state, docs).await?;
        if state.state == DonorState::Done {
            return self.report_donor_applied(state, decision).await;
        }

        if decision == Decision::Commit {
            if let Some(uuid) = state.source_uuid {
                self.node.drop_collection_if_uuid(&state.source_ns, uuid)?;
            }
        }
        state.state = DonorState::Done;
        state.decision = Some(decision);
        self.persist_donor(state)?;
        info!("[{}] donor for {} applied {:?}", self.shard_id(), state.operation_id, decision);
        self.report_donor_applied(state, decision).await
    }

    async fn donate_until_decision(
        &self,
        state: &mut DonorStateDoc,
        docs: &mut watch::Receiver<CoordinationDocument>,
    ) -> Result<Decision> {
        loop {
            if let Some(decision) = current_decision(docs) {
                return Ok(decision);
            }
            match state.state {
                DonorState::PreparingToDonate => {
                    state.source_uuid = self.node.collection_uuid(&state.source_ns);
                    state.min_fetch_timestamp = Some(self.node.last_applied());
                    state.state = DonorState::DonatingInitialData;
                    self.persist_donor(state)?;
                }
                DonorState::DonatingInitialData => {
                    let min_fetch_timestamp = state.min_fetch_timestamp.unwrap_or(Timestamp::MIN);
                    self.report(
                        state.operation_id,
                        ParticipantReport::DonorReady { shard: self.shard_id(), min_fetch_timestamp },
                    )
                    .await?;
                    let doc = wait_doc(docs, |d| d.fetch_timestamp.is_some() || d.decision.is_some()).await?;
                    if doc.fetch_timestamp.is_some() {
                        state.state = DonorState::DonatingOplogEntries;
                        self.persist_donor(state)?;
                    }
                }
                DonorState::DonatingOplogEntries | DonorState::Done | DonorState::Error => {
                    return wait_for_decision(docs).await;
                }
            }
        }
    }

    async fn report_donor_applied(&self, state: &DonorStateDoc, decision: Decision) -> Result<()> {
        self.report(
            state.operation_id,
            ParticipantReport::DecisionApplied { shard: self.shard_id(), role: ParticipantRole::Donor, decision },
        )
        .await
    }

    // === Recipient ===

    async fn run_recipient(self: Arc<Self>, mut docs: watch::Receiver<CoordinationDocument>, cancel: CancellationToken) {
        let doc = docs.borrow().clone();
        let result = match self.load_recipient(&doc) {
            Ok(mut state) => self.receive(&mut state, &mut docs, &cancel).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!("[{}] recipient for {} stopped: {}", self.shard_id(), doc.operation_id, e);
        }
    }

    fn load_recipient(&self, doc: &CoordinationDocument) -> Result<RecipientStateDoc> {
        let key = recipient_state_key(doc.operation_id);
        match self.node.store().get_record::<RecipientStateDoc>(&key)? {
            Some(state) => Ok(state),
            None => {
                let state = RecipientStateDoc {
                    operation_id: doc.operation_id,
                    source_ns: doc.source_ns.clone(),
                    temp_ns: doc.source_ns.temporary_resharding(doc.operation_id.0),
                    state: RecipientState::AwaitingFetchTimestamp,
                    fetch_timestamp: None,
                    donor_positions: BTreeMap::new(),
                    index_build: None,
                    decision: None,
                    error: None,
                };
                self.node.store().put_record(&key, &state)?;
                Ok(state)
            }
        }
    }

    fn persist_recipient(&self, state: &RecipientStateDoc) -> Result<()> {
        debug!("[{}] recipient {} -> {:?}", self.shard_id(), state.operation_id, state.state);
        self.node.store().put_record(&recipient_state_key(state.operation_id), state)
    }

    async fn receive(
        &self,
        state: &mut RecipientStateDoc,
        docs: &mut watch::Receiver<CoordinationDocument>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let decision = match self.receive_until_decision(state, docs, cancel).await {
            Ok(decision) => decision,
            Err(e) => match current_decision(docs) {
                Some(decision) => decision,
                None => {
                    error!("[{}] recipient for {} failed: {}", self.shard_id(), state.operation_id, e);
                    state.state = RecipientState::Error;
                    state.error = Some(e.to_string());
                    self.persist_recipient(state)?;
                    self.report(
                        state.operation_id,
                        ParticipantReport::Failed {
                            shard: self.shard_id(),
                            role: ParticipantRole::Recipient,
                            reason: e.to_string(),
                        },
                    )
                    .await?;
                    wait_for_decision(docs).await?
                }
            },
        };

        if state.state != RecipientState::Done {
            match decision {
                Decision::Commit => self.recipient_commit(state, docs).await?,
                Decision::Abort => self.recipient_abort(state)?,
            }
            state.state = RecipientState::Done;
            state.decision = Some(decision);
            self.persist_recipient(state)?;
            info!("[{}] recipient for {} applied {:?}", self.shard_id(), state.operation_id, decision);
        }
        self.report(
            state.operation_id,
            ParticipantReport::DecisionApplied { shard: self.shard_id(), role: ParticipantRole::Recipient, decision },
        )
        .await
    }

    async fn receive_until_decision(
        &self,
        state: &mut RecipientStateDoc,
        docs: &mut watch::Receiver<CoordinationDocument>,
        cancel: &CancellationToken,
    ) -> Result<Decision> {
        loop {
            if let Some(decision) = current_decision(docs) {
                return Ok(decision);
            }
            match state.state {
                RecipientState::AwaitingFetchTimestamp => {
                    if self.node.collection_uuid(&state.temp_ns).is_none() {
                        self.node.create_collection(&state.temp_ns)?;
                    }
                    self.report(
                        state.operation_id,
                        ParticipantReport::RecipientAcknowledged { shard: self.shard_id() },
                    )
                    .await?;
                    let doc = wait_doc(docs, |d| d.fetch_timestamp.is_some() || d.decision.is_some()).await?;
                    if let Some(fetch) = doc.fetch_timestamp {
                        state.fetch_timestamp = Some(fetch);
                        state.state = RecipientState::Cloning;
                        self.persist_recipient(state)?;
                    }
                }
                RecipientState::Cloning => {
                    let doc = docs.borrow().clone();
                    self.clone_snapshot(state, &doc).await?;
                    state.state = RecipientState::BuildingIndexes;
                    self.persist_recipient(state)?;
                }
                RecipientState::BuildingIndexes => {
                    let doc = docs.borrow().clone();
                    self.build_partition_key_index(state, &doc, cancel).await?;
                    self.report(state.operation_id, ParticipantReport::RecipientCloned { shard: self.shard_id() })
                        .await?;
                    state.state = RecipientState::Applying;
                    self.persist_recipient(state)?;
                }
                RecipientState::Applying | RecipientState::CaughtUp => {
                    return self.catch_up_until_decision(state, docs, cancel).await;
                }
                RecipientState::Done | RecipientState::Error => return wait_for_decision(docs).await,
            }
        }
    }

    fn fetch_timestamp(state: &RecipientStateDoc) -> Result<Timestamp> {
        state
            .fetch_timestamp
            .ok_or_else(|| StrataError::invalid_state("recipient has no fetch timestamp"))
    }

    fn fetcher(&self, doc: &CoordinationDocument) -> ReshardingOplogFetcher {
        ReshardingOplogFetcher::new(
            doc.source_ns.clone(),
            self.shard_id(),
            doc.chunk_map.clone(),
            self.resharding.oplog_batch_size,
        )
    }

    /// Copy every owned document of each donor's snapshot at the fetch timestamp
    async fn clone_snapshot(&self, state: &RecipientStateDoc, doc: &CoordinationDocument) -> Result<()> {
        let fetch = Self::fetch_timestamp(state)?;
        let fetcher = self.fetcher(doc);
        let mut cloned = 0usize;
        for donor in &doc.donors {
            let what = format!("connect to donor {}", donor);
            let source = with_backoff(&self.resharding.retry, &what, &self.shutdown, || self.donors.connect(*donor))
                .await?;
            let owned = fetcher.owned_documents(source.snapshot_at(&doc.source_ns, fetch)?);
            cloned += owned.len();
            for d in owned {
                self.node.upsert(&state.temp_ns, d)?;
            }
        }
        info!(
            "[{}] cloned {} documents of {} at {} into {}",
            self.shard_id(),
            cloned,
            doc.source_ns,
            fetch,
            state.temp_ns
        );
        Ok(())
    }

    /// Build the index on the new partition key over the cloned data
    async fn build_partition_key_index(
        &self,
        state: &mut RecipientStateDoc,
        doc: &CoordinationDocument,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let spec = IndexSpec::new(&IndexSpec::default_name(&doc.new_key), doc.new_key.clone());
        if self.node.list_indexes(&state.temp_ns).iter().any(|s| s.name == spec.name) {
            return Ok(());
        }
        let source: Arc<dyn IndexBuildSource> = self.node.clone();
        let store = self.node.store().clone();

        let resumable = match state.index_build {
            Some(build_id) => load_record(&store, build_id)?.map(|_| build_id),
            None => None,
        };
        let builder = match resumable {
            Some(build_id) => IndexBuilder::resume(build_id, source, store, self.index_build.clone())?,
            None => {
                let builder = IndexBuilder::start(source, store, self.index_build.clone(), state.temp_ns.clone(), spec)?;
                state.index_build = Some(builder.build_id());
                self.persist_recipient(state)?;
                builder
            }
        };
        let outcome = builder.with_cancellation(cancel.clone()).run().await?;
        info!(
            "[{}] built {} entries on {} for {}",
            self.shard_id(),
            outcome.entries.len(),
            doc.new_key,
            state.temp_ns
        );
        Ok(())
    }

    fn apply_ops(&self, temp_ns: &Namespace, ops: Vec<RecipientOp>) -> Result<()> {
        for op in ops {
            match op {
                RecipientOp::Upsert(doc) => {
                    self.node.upsert(temp_ns, doc)?;
                }
                RecipientOp::Delete(id) => {
                    self.node.delete(temp_ns, id)?;
                }
            }
        }
        Ok(())
    }

    /// Apply everything currently majority-committed on each reachable donor.
    /// Returns the catch-up time when every donor was reached.
    fn catch_up_round(
        &self,
        state: &mut RecipientStateDoc,
        doc: &CoordinationDocument,
        sources: &[DonorConnection],
    ) -> Result<Option<Timestamp>> {
        let fetch = Self::fetch_timestamp(state)?;
        let fetcher = self.fetcher(doc);
        let mut reached_all = true;
        for (donor, source) in sources {
            let source = match source {
                Some(source) => source,
                None => {
                    reached_all = false;
                    continue;
                }
            };
            let mut position = state
                .donor_positions
                .get(donor)
                .copied()
                .unwrap_or_else(|| DonorOplogId::starting_at(fetch));
            loop {
                let batch = fetcher.iterate(source.as_ref(), position)?;
                self.apply_ops(&state.temp_ns, batch.ops)?;
                position = batch.resume;
                if batch.source_ended {
                    return Err(StrataError::Aborted(format!(
                        "{} was dropped or replaced on donor {}",
                        doc.source_ns, donor
                    )));
                }
                if batch.exhausted {
                    break;
                }
            }
            state.donor_positions.insert(*donor, position);
        }
        self.persist_recipient(state)?;
        if !reached_all {
            return Ok(None);
        }
        Ok(doc
            .donors
            .iter()
            .map(|d| state.donor_positions.get(d).map_or(fetch, |p| p.cluster_time))
            .min())
    }

    async fn connect_reachable(
        &self,
        doc: &CoordinationDocument,
    ) -> Result<Vec<DonorConnection>> {
        let mut sources = Vec::with_capacity(doc.donors.len());
        for donor in &doc.donors {
            match self.donors.connect(*donor).await {
                Ok(source) => sources.push((*donor, Some(source))),
                Err(e) if e.is_transient() => {
                    debug!("[{}] donor {} unreachable during catch-up: {}", self.shard_id(), donor, e);
                    sources.push((*donor, None));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(sources)
    }

    async fn catch_up_until_decision(
        &self,
        state: &mut RecipientStateDoc,
        docs: &mut watch::Receiver<CoordinationDocument>,
        cancel: &CancellationToken,
    ) -> Result<Decision> {
        loop {
            if let Some(decision) = current_decision(docs) {
                return Ok(decision);
            }
            let doc = docs.borrow().clone();
            let sources = self.connect_reachable(&doc).await?;
            if let Some(caught_up_at) = self.catch_up_round(state, &doc, &sources)? {
                if state.state == RecipientState::Applying {
                    self.report(
                        state.operation_id,
                        ParticipantReport::RecipientCaughtUp { shard: self.shard_id(), last_applied_catchup: caught_up_at },
                    )
                    .await?;
                    state.state = RecipientState::CaughtUp;
                    self.persist_recipient(state)?;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.resharding.catchup_interval()) => {}
                changed = docs.changed() => {
                    if changed.is_err() {
                        return Err(StrataError::Interrupted("participant host stopped".to_string()));
                    }
                }
                _ = cancel.cancelled() => {}
            }
        }
    }

    /// Apply the donors' remaining entries up to the point each stopped writing to the source
    async fn final_catch_up(&self, state: &mut RecipientStateDoc, doc: &CoordinationDocument) -> Result<()> {
        let fetch = Self::fetch_timestamp(state)?;
        let fetcher = self.fetcher(doc);
        for donor in &doc.donors {
            let what = format!("connect to donor {}", donor);
            let source = with_backoff(&self.resharding.retry, &what, &self.shutdown, || self.donors.connect(*donor))
                .await?;
            let target = source.last_applied();
            let mut position = state
                .donor_positions
                .get(donor)
                .copied()
                .unwrap_or_else(|| DonorOplogId::starting_at(fetch));
            loop {
                let batch = fetcher.iterate(source.as_ref(), position)?;
                self.apply_ops(&state.temp_ns, batch.ops)?;
                position = batch.resume;
                if batch.source_ended || position.cluster_time >= target {
                    break;
                }
                if batch.exhausted {
                    tokio::select! {
                        _ = tokio::time::sleep(self.resharding.catchup_interval()) => {}
                        _ = self.shutdown.cancelled() => {
                            return Err(StrataError::Interrupted("participant host stopped".to_string()));
                        }
                    }
                }
            }
            state.donor_positions.insert(*donor, position);
            self.persist_recipient(state)?;
        }
        Ok(())
    }

    async fn recipient_commit(
        &self,
        state: &mut RecipientStateDoc,
        docs: &mut watch::Receiver<CoordinationDocument>,
    ) -> Result<()> {
        let doc = docs.borrow().clone();
        self.final_catch_up(state, &doc).await?;
        if self.node.collection_uuid(&state.temp_ns).is_some() {
            self.node.rename_collection(&state.temp_ns, &state.source_ns, true)?;
        }
        Ok(())
    }

    /// Remove the temporary collection and any index build records
    fn recipient_abort(&self, state: &mut RecipientStateDoc) -> Result<()> {
        if let Some(build_id) = state.index_build {
            let removed = delete_build(self.node.store(), build_id)?;
            debug!("[{}] removed {} records of index build {}", self.shard_id(), removed, build_id);
        }
        self.node.drop_collection(&state.temp_ns)?;
        info!("[{}] dropped {} after abort", self.shard_id(), state.temp_ns);
        Ok(())
    }
}
