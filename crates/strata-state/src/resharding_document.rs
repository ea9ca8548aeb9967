// RESHARDING COORDINATION DOCUMENT
// Durable, versioned record of one resharding operation, owned by the coordinator
//
// SAFETY INVARIANTS:
// 1. `decision` is written at most once and never changes afterwards
// 2. `phase` only moves forward along the transition table; Aborting is reachable
//    from every undecided phase
// 3. `fetch_timestamp` is set exactly once, when leaving Initializing
// 4. Every replacement is a compare-and-swap against the version previously read

use serde::{Serialize, Deserialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};
use log::{debug, info};

use strata_core::{Namespace, OperationId, PartitionKey, Result, ShardId, StrataError, Timestamp};
use crate::checkpoint_store::{CheckpointStore, Versioned};
use crate::routing::ChunkMap;

pub const ACTIVE_OPERATIONS_PREFIX: &str = "config.reshardingOperations/";
pub const HISTORY_PREFIX: &str = "config.reshardingHistory/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub enum CoordinatorPhase {
    Initializing,
    Cloning,
    ApplyingCatchup,
    AwaitingCommit,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl CoordinatorPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CoordinatorPhase::Committed | CoordinatorPhase::Aborted)
    }

    /// Phases in which no decision has been made yet
    pub fn is_undecided(&self) -> bool {
        matches!(
            self,
            CoordinatorPhase::Initializing
                | CoordinatorPhase::Cloning
                | CoordinatorPhase::ApplyingCatchup
                | CoordinatorPhase::AwaitingCommit
        )
    }

    pub fn can_transition_to(&self, next: CoordinatorPhase) -> bool {
        use CoordinatorPhase::*;
        match (self, next) {
            (Initializing, Cloning)
            | (Cloning, ApplyingCatchup)
            | (ApplyingCatchup, AwaitingCommit)
            | (AwaitingCommit, Committing)
            | (Committing, Committed)
            | (Aborting, Aborted) => true,
            (current, Aborting) => current.is_undecided(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum Decision {
    Commit,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub enum ParticipantRole {
    Donor,
    Recipient,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonorProgress {
    /// Donor reported DonorReady
    pub ready: bool,

    /// Earliest time the donor can serve a consistent snapshot from
    pub min_fetch_timestamp: Option<Timestamp>,

    /// Donor applied the decision and acknowledged it
    pub cleaned_up: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientProgress {
    /// Recipient created its temporary collection
    pub acknowledged: bool,

    /// Snapshot cloned and the new-key index built
    pub cloned: bool,

    /// Catch-up time reported with CaughtUp; always >= fetch_timestamp
    pub caught_up_at: Option<Timestamp>,

    /// Recipient applied the decision (renamed or dropped its collection) and acknowledged it
    pub cleaned_up: bool,
}

/// Parameters of a resharding request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReshardingRequest {
    pub source_ns: Namespace,
    pub new_key: PartitionKey,
    pub donors: BTreeSet<ShardId>,
    pub recipients: BTreeSet<ShardId>,
    pub chunk_map: ChunkMap,
}

impl ReshardingRequest {
    pub fn validate(&self) -> Result<()> {
        if self.donors.is_empty() || self.recipients.is_empty() {
            return Err(StrataError::invalid_state("resharding needs at least one donor and one recipient"));
        }
        if self.chunk_map.key() != &self.new_key {
            return Err(StrataError::InvalidState(format!(
                "chunks are over {} but the new key is {}",
                self.chunk_map.key(),
                self.new_key
            )));
        }
        let unassigned: Vec<ShardId> = self
            .chunk_map
            .shards()
            .into_iter()
            .filter(|s| !self.recipients.contains(s))
            .collect();
        if !unassigned.is_empty() {
            return Err(StrataError::InvalidState(format!(
                "chunks assigned to non-recipient shards {:?}",
                unassigned
            )));
        }
        Ok(())
    }
}

/// Fields observers poll while waiting to commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationStatus {
    pub operation_id: OperationId,
    pub phase: CoordinatorPhase,
    pub fetch_timestamp: Option<Timestamp>,
    pub decision: Option<Decision>,
    pub abort_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationDocument {
    /// Operation identity (unique across active and archived documents)
    pub operation_id: OperationId,

    /// Collection being resharded
    pub source_ns: Namespace,

    /// Partition key the collection moves to
    pub new_key: PartitionKey,

    /// Shards currently holding the collection
    pub donors: BTreeSet<ShardId>,

    /// Shards that own chunks under the new key
    pub recipients: BTreeSet<ShardId>,

    /// Chunk placement under the new key
    pub chunk_map: ChunkMap,

    /// Current phase
    pub phase: CoordinatorPhase,

    /// Clone consistency point; set once, when every donor is ready
    pub fetch_timestamp: Option<Timestamp>,

    /// Commit or abort; written once
    pub decision: Option<Decision>,

    /// Per-donor reports
    pub donor_progress: BTreeMap<ShardId, DonorProgress>,

    /// Per-recipient reports
    pub recipient_progress: BTreeMap<ShardId, RecipientProgress>,

    /// Why the operation aborted
    pub abort_reason: Option<String>,

    /// Bumped by every persisted change; participants ignore older versions
    pub version: u64,
}

impl CoordinationDocument {
    pub fn new(operation_id: OperationId, request: ReshardingRequest) -> Self {
        CoordinationDocument {
            operation_id,
            donor_progress: request.donors.iter().map(|s| (*s, DonorProgress::default())).collect(),
            recipient_progress: request
                .recipients
                .iter()
                .map(|s| (*s, RecipientProgress::default()))
                .collect(),
            source_ns: request.source_ns,
            new_key: request.new_key,
            donors: request.donors,
            recipients: request.recipients,
            chunk_map: request.chunk_map,
            phase: CoordinatorPhase::Initializing,
            fetch_timestamp: None,
            decision: None,
            abort_reason: None,
            version: 0,
        }
    }

    /// Donors and recipients; a shard may be both
    pub fn participants(&self) -> BTreeSet<ShardId> {
        self.donors.union(&self.recipients).copied().collect()
    }

    pub fn status(&self) -> CoordinationStatus {
        CoordinationStatus {
            operation_id: self.operation_id,
            phase: self.phase,
            fetch_timestamp: self.fetch_timestamp,
            decision: self.decision,
            abort_reason: self.abort_reason.clone(),
        }
    }

    pub fn all_donors_ready(&self) -> bool {
        self.donor_progress.values().all(|p| p.ready)
    }

    pub fn all_recipients_acknowledged(&self) -> bool {
        self.recipient_progress.values().all(|p| p.acknowledged)
    }

    pub fn all_recipients_cloned(&self) -> bool {
        self.recipient_progress.values().all(|p| p.cloned)
    }

    pub fn all_recipients_caught_up(&self) -> bool {
        match self.fetch_timestamp {
            Some(fetch) => self
                .recipient_progress
                .values()
                .all(|p| p.caught_up_at.map_or(false, |ts| ts >= fetch)),
            None => false,
        }
    }

    pub fn all_cleaned_up(&self) -> bool {
        self.donor_progress.values().all(|p| p.cleaned_up)
            && self.recipient_progress.values().all(|p| p.cleaned_up)
    }

    /// Shards whose report the current phase is still waiting for
    pub fn pending_shards(&self) -> Vec<ShardId> {
        let mut pending = BTreeSet::new();
        match self.phase {
            CoordinatorPhase::Initializing => {
                pending.extend(self.donor_progress.iter().filter(|(_, p)| !p.ready).map(|(s, _)| *s));
                pending.extend(
                    self.recipient_progress.iter().filter(|(_, p)| !p.acknowledged).map(|(s, _)| *s),
                );
            }
            CoordinatorPhase::Cloning => {
                pending.extend(self.recipient_progress.iter().filter(|(_, p)| !p.cloned).map(|(s, _)| *s));
            }
            CoordinatorPhase::ApplyingCatchup => {
                let fetch = self.fetch_timestamp.unwrap_or(Timestamp::MIN);
                pending.extend(
                    self.recipient_progress
                        .iter()
                        .filter(|(_, p)| p.caught_up_at.map_or(true, |ts| ts < fetch))
                        .map(|(s, _)| *s),
                );
            }
            CoordinatorPhase::Committing | CoordinatorPhase::Aborting => {
                pending.extend(self.donor_progress.iter().filter(|(_, p)| !p.cleaned_up).map(|(s, _)| *s));
                pending.extend(
                    self.recipient_progress.iter().filter(|(_, p)| !p.cleaned_up).map(|(s, _)| *s),
                );
            }
            CoordinatorPhase::AwaitingCommit | CoordinatorPhase::Committed | CoordinatorPhase::Aborted => {}
        }
        pending.into_iter().collect()
    }

    pub fn transition(&mut self, next: CoordinatorPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(StrataError::InvalidState(format!(
                "resharding {} cannot move from {:?} to {:?}",
                self.operation_id, self.phase, next
            )));
        }
        self.phase = next;
        Ok(())
    }

    /// Record the decision; a second, different decision is refused
    pub fn decide(&mut self, decision: Decision) -> Result<()> {
        match self.decision {
            Some(existing) if existing == decision => Ok(()),
            Some(existing) => Err(StrataError::InvalidState(format!(
                "resharding {} already decided {:?}",
                self.operation_id, existing
            ))),
            None => {
                self.decision = Some(decision);
                Ok(())
            }
        }
    }
}

/// Persistence of coordination documents in the config store
#[derive(Clone)]
pub struct CoordinationStore {
    store: CheckpointStore,
}

fn active_key(operation_id: OperationId) -> String {
    format!("{}{}", ACTIVE_OPERATIONS_PREFIX, operation_id)
}

impl CoordinationStore {
    pub fn new(store: CheckpointStore) -> Self {
        CoordinationStore { store }
    }

    /// Insert a fresh document; false if the id is already taken
    pub fn create(&self, doc: &CoordinationDocument) -> Result<bool> {
        self.store.insert_new_record(&active_key(doc.operation_id), doc)
    }

    pub fn load(&self, operation_id: OperationId) -> Result<Option<Versioned<CoordinationDocument>>> {
        self.store.get_versioned(&active_key(operation_id))
    }

    /// Compare-and-swap `next` over the version read as `current`; bumps the version
    pub fn replace(
        &self,
        current: &Versioned<CoordinationDocument>,
        next: &mut CoordinationDocument,
    ) -> Result<bool> {
        next.version = current.value.version + 1;
        let swapped = self
            .store
            .compare_and_swap_record(&active_key(next.operation_id), current, Some(&*next))?;
        if swapped {
            debug!(
                "Resharding {} persisted at version {} ({:?})",
                next.operation_id, next.version, next.phase
            );
        }
        Ok(swapped)
    }

    pub fn list_active(&self) -> Result<Vec<CoordinationDocument>> {
        Ok(self
            .store
            .scan_records::<CoordinationDocument>(ACTIVE_OPERATIONS_PREFIX)?
            .into_iter()
            .map(|(_, doc)| doc)
            .collect())
    }

    pub fn find_active(&self, ns: &Namespace) -> Result<Option<CoordinationDocument>> {
        Ok(self.list_active()?.into_iter().find(|d| &d.source_ns == ns))
    }

    /// Move a finished document to the history prefix
    pub fn archive(&self, current: &Versioned<CoordinationDocument>) -> Result<bool> {
        let doc = &current.value;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let history_key = format!("{}{}/{:020}-{}", HISTORY_PREFIX, doc.source_ns, millis, doc.operation_id);
        self.store.put_record(&history_key, doc)?;
        let removed = self
            .store
            .compare_and_swap_record::<CoordinationDocument>(&active_key(doc.operation_id), current, None)?;
        if removed {
            info!("Resharding {} archived in {:?}", doc.operation_id, doc.phase);
        } else {
            self.store.delete_record(&history_key)?;
        }
        Ok(removed)
    }

    /// Most recently archived document for `ns`
    pub fn find_archived(&self, ns: &Namespace) -> Result<Option<CoordinationDocument>> {
        let prefix = format!("{}{}/", HISTORY_PREFIX, ns);
        Ok(self
            .store
            .scan_records::<CoordinationDocument>(&prefix)?
            .into_iter()
            .map(|(_, doc)| doc)
            .last())
    }

    pub fn find_archived_by_id(&self, operation_id: OperationId) -> Result<Option<CoordinationDocument>> {
        Ok(self
            .store
            .scan_records::<CoordinationDocument>(HISTORY_PREFIX)?
            .into_iter()
            .map(|(_, doc)| doc)
            .find(|d| d.operation_id == operation_id))
    }
}
