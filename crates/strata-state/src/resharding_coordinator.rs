// RESHARDING COORDINATOR
// Drives one resharding operation per namespace through
// Initializing -> Cloning -> ApplyingCatchup -> AwaitingCommit -> Committing -> Committed,
// with Aborting -> Aborted reachable until a decision is made
//
// SAFETY INVARIANTS:
// 1. Every state change is persisted (compare-and-swap) before any participant hears of it
// 2. The decision is written exactly once; commit is refused outside AwaitingCommit
// 3. fetch_timestamp is the maximum of the donors' minimum fetch timestamps and never changes
// 4. At most one active operation exists per source namespace
// 5. The routing update is published only after every participant applied the commit
// 6. A document left in a terminal phase is archived by the next advance, including after a restart

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use async_trait::async_trait;
use log::{debug, error, info, warn};

use strata_core::{Namespace, OperationId, ReshardingConfig, Result, StrataError};
use crate::checkpoint_store::Versioned;
use crate::resharding_document::{
    CoordinationDocument, CoordinationStore, CoordinatorPhase, Decision, ParticipantRole, ReshardingRequest,
};
use crate::retry::with_backoff;
use crate::routing::{RoutingSink, RoutingTableUpdate};
use crate::transport::{CoordinatorHandle, CoordinatorMessage, ParticipantReport, ParticipantTransport};

pub struct ReshardingCoordinator {
    docs: CoordinationStore,
    transport: Arc<dyn ParticipantTransport>,
    routing: Arc<dyn RoutingSink>,
    config: ReshardingConfig,
    watchers: DashMap<OperationId, watch::Sender<CoordinationDocument>>,
    start_lock: Mutex<()>,
    shutdown: CancellationToken,
}

impl ReshardingCoordinator {
    pub fn new(
        docs: CoordinationStore,
        transport: Arc<dyn ParticipantTransport>,
        routing: Arc<dyn RoutingSink>,
        config: ReshardingConfig,
    ) -> Self {
        ReshardingCoordinator {
            docs,
            transport,
            routing,
            config,
            watchers: DashMap::new(),
            start_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ReshardingConfig {
        &self.config
    }

    /// Stop retrying deliveries
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // === Lifecycle ===

    /// Persist a new coordination document, then announce it to every participant
    pub async fn start_operation(&self, request: ReshardingRequest) -> Result<CoordinationDocument> {
        request.validate()?;
        let doc = {
            let _guard = self.start_lock.lock();
            let mut active = self.docs.find_active(&request.source_ns)?;
            if let Some(finished) = active.as_ref().filter(|d| d.phase.is_terminal()).map(|d| d.operation_id) {
                self.advance(finished)?;
                active = self.docs.find_active(&request.source_ns)?;
            }
            if let Some(existing) = active {
                warn!(
                    "Refusing to reshard {}: operation {} is still {:?}",
                    existing.source_ns, existing.operation_id, existing.phase
                );
                return Err(StrataError::AlreadyInProgress(existing.source_ns));
            }
            let doc = CoordinationDocument::new(OperationId::generate(), request);
            if !self.docs.create(&doc)? {
                return Err(StrataError::InvalidState(format!(
                    "operation id {} already in use",
                    doc.operation_id
                )));
            }
            doc
        };
        info!(
            "Resharding {} started for {} on key {} (donors {:?}, recipients {:?})",
            doc.operation_id, doc.source_ns, doc.new_key, doc.donors, doc.recipients
        );
        self.publish(&doc);
        self.broadcast(CoordinatorMessage::Start(doc.clone()));
        Ok(doc)
    }

    /// Record the commit decision; only valid once every recipient caught up
    pub async fn commit(&self, operation_id: OperationId) -> Result<CoordinationDocument> {
        loop {
            let current = match self.docs.load(operation_id)? {
                Some(current) => current,
                None => {
                    let archived = self.archived(operation_id)?;
                    return match archived.decision {
                        Some(Decision::Commit) => Ok(archived),
                        _ => Err(StrataError::InvalidState(format!(
                            "resharding {} ended in {:?}",
                            operation_id, archived.phase
                        ))),
                    };
                }
            };
            let doc = &current.value;
            match (doc.phase, doc.decision) {
                (_, Some(Decision::Commit)) => return Ok(doc.clone()),
                (_, Some(Decision::Abort)) => {
                    return Err(StrataError::InvalidState(format!(
                        "resharding {} was aborted: {}",
                        operation_id,
                        doc.abort_reason.as_deref().unwrap_or("no reason given")
                    )))
                }
                (CoordinatorPhase::AwaitingCommit, None) => {}
                (phase, None) => {
                    return Err(StrataError::InvalidState(format!(
                        "resharding {} cannot commit in {:?} (fetch timestamp {})",
                        operation_id,
                        phase,
                        doc.fetch_timestamp.map_or("unset".to_string(), |ts| ts.to_string())
                    )))
                }
            }

            let mut next = doc.clone();
            next.decide(Decision::Commit)?;
            next.transition(CoordinatorPhase::Committing)?;
            if self.docs.replace(&current, &mut next)? {
                info!("Resharding {} decided to commit", operation_id);
                self.publish(&next);
                self.broadcast(CoordinatorMessage::Decision(next.clone()));
                return Ok(next);
            }
        }
    }

    /// Record the abort decision; refused once the operation committed
    pub async fn abort(&self, operation_id: OperationId, reason: &str) -> Result<CoordinationDocument> {
        loop {
            let current = match self.docs.load(operation_id)? {
                Some(current) => current,
                None => {
                    let archived = self.archived(operation_id)?;
                    return match archived.decision {
                        Some(Decision::Abort) => Ok(archived),
                        _ => Err(StrataError::InvalidState(format!(
                            "resharding {} already committed",
                            operation_id
                        ))),
                    };
                }
            };
            let doc = &current.value;
            match doc.decision {
                Some(Decision::Abort) => return Ok(doc.clone()),
                Some(Decision::Commit) => {
                    return Err(StrataError::InvalidState(format!(
                        "resharding {} already committed",
                        operation_id
                    )))
                }
                None => {}
            }

            let mut next = doc.clone();
            next.decide(Decision::Abort)?;
            next.transition(CoordinatorPhase::Aborting)?;
            next.abort_reason = Some(reason.to_string());
            if self.docs.replace(&current, &mut next)? {
                warn!("Resharding {} aborting: {}", operation_id, reason);
                self.publish(&next);
                self.broadcast(CoordinatorMessage::Decision(next.clone()));
                return Ok(next);
            }
        }
    }

    /// Move forward as far as the recorded progress allows
    pub fn advance(&self, operation_id: OperationId) -> Result<CoordinationDocument> {
        loop {
            let current = match self.docs.load(operation_id)? {
                Some(current) => current,
                None => return self.archived(operation_id),
            };
            let doc = &current.value;
            let mut next = doc.clone();

            match doc.phase {
                CoordinatorPhase::Initializing if doc.all_donors_ready() && doc.all_recipients_acknowledged() => {
                    let fetch = doc
                        .donor_progress
                        .values()
                        .filter_map(|p| p.min_fetch_timestamp)
                        .max()
                        .ok_or_else(|| StrataError::invalid_state("ready donors reported no fetch timestamp"))?;
                    next.fetch_timestamp = Some(fetch);
                    next.transition(CoordinatorPhase::Cloning)?;
                }
                CoordinatorPhase::Cloning if doc.all_recipients_cloned() => {
                    next.transition(CoordinatorPhase::ApplyingCatchup)?;
                }
                CoordinatorPhase::ApplyingCatchup if doc.all_recipients_caught_up() => {
                    next.transition(CoordinatorPhase::AwaitingCommit)?;
                }
                CoordinatorPhase::Committing if doc.all_cleaned_up() => {
                    next.transition(CoordinatorPhase::Committed)?;
                }
                CoordinatorPhase::Aborting if doc.all_cleaned_up() => {
                    next.transition(CoordinatorPhase::Aborted)?;
                }
                CoordinatorPhase::Committed | CoordinatorPhase::Aborted => match self.retire(&current)? {
                    Some(done) => return Ok(done),
                    None => continue,
                },
                _ => return Ok(doc.clone()),
            }

            if self.docs.replace(&current, &mut next)? {
                info!(
                    "Resharding {}: {:?} -> {:?}{}",
                    operation_id,
                    doc.phase,
                    next.phase,
                    next.fetch_timestamp
                        .filter(|_| doc.fetch_timestamp.is_none())
                        .map_or(String::new(), |ts| format!(" at fetch timestamp {}", ts))
                );
                // Terminal documents are published by retire, once routing is installed
                if !next.phase.is_terminal() {
                    self.publish(&next);
                    self.broadcast(CoordinatorMessage::Progress(next.clone()));
                }
            }
        }
    }

    /// Publish routing for a committed document, then move it to the history prefix.
    /// `None` means the document changed underneath and the caller should reload.
    fn retire(&self, current: &Versioned<CoordinationDocument>) -> Result<Option<CoordinationDocument>> {
        let doc = &current.value;
        if doc.phase == CoordinatorPhase::Committed {
            let version = self.routing.apply_update(RoutingTableUpdate {
                ns: doc.source_ns.clone(),
                chunk_map: doc.chunk_map.clone(),
                operation_id: Some(doc.operation_id),
            })?;
            debug!("Resharding {} installed routing version {}", doc.operation_id, version);
        }
        if !self.docs.archive(current)? {
            return Ok(None);
        }
        info!("Resharding {} of {} finished: {:?}", doc.operation_id, doc.source_ns, doc.phase);
        self.publish(doc);
        self.watchers.remove(&doc.operation_id);
        Ok(Some(doc.clone()))
    }

    /// Re-announce every active operation after a restart and move each forward
    pub fn recover(&self) -> Result<usize> {
        let active = self.docs.list_active()?;
        for doc in &active {
            info!("Recovering resharding {} in {:?}", doc.operation_id, doc.phase);
            if doc.phase.is_terminal() {
                self.advance(doc.operation_id)?;
                continue;
            }
            self.publish(doc);
            let message = match doc.phase {
                CoordinatorPhase::Initializing => CoordinatorMessage::Start(doc.clone()),
                phase if phase.is_undecided() => CoordinatorMessage::Progress(doc.clone()),
                _ => CoordinatorMessage::Decision(doc.clone()),
            };
            self.broadcast(message);
            self.advance(doc.operation_id)?;
        }
        Ok(active.len())
    }

    // === Participant reports ===

    pub async fn handle_report(&self, operation_id: OperationId, report: ParticipantReport) -> Result<()> {
        debug!("Resharding {}: {:?}", operation_id, report);
        loop {
            let current = match self.docs.load(operation_id)? {
                Some(current) => current,
                None => {
                    // Late or duplicate report for a finished operation
                    self.archived(operation_id)?;
                    return Ok(());
                }
            };
            let mut next = current.value.clone();
            if !apply_report(&mut next, &report)? {
                break;
            }
            if self.docs.replace(&current, &mut next)? {
                self.publish(&next);
                break;
            }
        }

        if let ParticipantReport::Failed { shard, role, reason } = &report {
            let reason = format!("{:?} {} failed: {}", role, shard, reason);
            return match self.abort(operation_id, &reason).await {
                Ok(_) => Ok(()),
                Err(StrataError::InvalidState(msg)) => {
                    error!("Resharding {}: {} after the commit decision ({})", operation_id, reason, msg);
                    Ok(())
                }
                Err(e) => Err(e),
            };
        }
        self.advance(operation_id).map(|_| ())
    }

    // === Observation ===

    /// The active document, or the archived one once the operation finished
    pub fn get(&self, operation_id: OperationId) -> Result<CoordinationDocument> {
        match self.docs.load(operation_id)? {
            Some(current) => Ok(current.value),
            None => self.archived(operation_id),
        }
    }

    pub fn find_active(&self, ns: &Namespace) -> Result<Option<CoordinationDocument>> {
        self.docs.find_active(ns)
    }

    pub fn find_by_namespace(&self, ns: &Namespace) -> Result<Option<CoordinationDocument>> {
        match self.docs.find_active(ns)? {
            Some(doc) => Ok(Some(doc)),
            None => self.docs.find_archived(ns),
        }
    }

    /// Operations with a live status channel
    pub fn watched_operations(&self) -> usize {
        self.watchers.len()
    }

    pub fn subscribe(&self, operation_id: OperationId) -> Result<watch::Receiver<CoordinationDocument>> {
        if let Some(tx) = self.watchers.get(&operation_id) {
            return Ok(tx.subscribe());
        }
        let doc = self.get(operation_id)?;
        if doc.phase.is_terminal() {
            return Ok(watch::channel(doc).1);
        }
        let rx = self
            .watchers
            .entry(operation_id)
            .or_insert_with(|| watch::channel(doc).0)
            .subscribe();
        // Archived between the read and the insert
        if self.docs.load(operation_id)?.is_none() {
            self.watchers.remove(&operation_id);
            return Ok(watch::channel(self.get(operation_id)?).1);
        }
        Ok(rx)
    }

    /// Wait until `done` holds; on timeout report the shards still being waited for
    pub async fn wait_for<F>(&self, operation_id: OperationId, done: F, timeout: Duration) -> Result<CoordinationDocument>
    where
        F: Fn(&CoordinationDocument) -> bool,
    {
        let mut rx = self.subscribe(operation_id)?;
        let wait = async {
            loop {
                {
                    let doc = rx.borrow_and_update();
                    if done(&doc) {
                        return Ok(doc.clone());
                    }
                }
                if rx.changed().await.is_err() {
                    // Sender dropped once the operation was archived
                    let doc = self.get(operation_id)?;
                    if done(&doc) {
                        return Ok(doc);
                    }
                    return Err(StrataError::Interrupted(format!("resharding {} finished in {:?}", operation_id, doc.phase)));
                }
            }
        };
        let outcome = tokio::time::timeout(timeout, wait).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                let doc = self.get(operation_id)?;
                let pending = doc.pending_shards();
                if pending.is_empty() {
                    Err(StrataError::Interrupted(format!(
                        "resharding {} still {:?} after {:?}",
                        operation_id, doc.phase, timeout
                    )))
                } else {
                    Err(StrataError::ParticipantUnreachable(pending))
                }
            }
        }
    }

    fn archived(&self, operation_id: OperationId) -> Result<CoordinationDocument> {
        self.docs
            .find_archived_by_id(operation_id)?
            .ok_or_else(|| StrataError::NotFound(format!("resharding operation {}", operation_id)))
    }

    fn publish(&self, doc: &CoordinationDocument) {
        self.watchers
            .entry(doc.operation_id)
            .and_modify(|tx| {
                tx.send_replace(doc.clone());
            })
            .or_insert_with(|| watch::channel(doc.clone()).0);
    }

    /// Deliver `message` to every participant, retrying unreachable shards in the background
    fn broadcast(&self, message: CoordinatorMessage) {
        for shard in message.document().participants() {
            let transport = self.transport.clone();
            let policy = self.config.retry.clone();
            let cancel = self.shutdown.clone();
            let message = message.clone();
            tokio::spawn(async move {
                let what = format!("delivery to {}", shard);
                if let Err(e) = with_backoff(&policy, &what, &cancel, || transport.send(shard, message.clone())).await {
                    warn!("Giving up {}: {}", what, e);
                }
            });
        }
    }
}

/// Fold one report into the document; false when it changes nothing
fn apply_report(doc: &mut CoordinationDocument, report: &ParticipantReport) -> Result<bool> {
    let op = doc.operation_id;
    let not_participant = |shard, role: ParticipantRole| {
        StrataError::InvalidState(format!("{} is not a {:?} of resharding {}", shard, role, op))
    };

    match report {
        ParticipantReport::DonorReady { shard, min_fetch_timestamp } => {
            let progress = doc
                .donor_progress
                .get_mut(shard)
                .ok_or_else(|| not_participant(*shard, ParticipantRole::Donor))?;
            if progress.ready {
                return Ok(false);
            }
            progress.ready = true;
            progress.min_fetch_timestamp = Some(*min_fetch_timestamp);
            Ok(true)
        }
        ParticipantReport::RecipientAcknowledged { shard } => {
            let progress = doc
                .recipient_progress
                .get_mut(shard)
                .ok_or_else(|| not_participant(*shard, ParticipantRole::Recipient))?;
            Ok(!std::mem::replace(&mut progress.acknowledged, true))
        }
        ParticipantReport::RecipientCloned { shard } => {
            let progress = doc
                .recipient_progress
                .get_mut(shard)
                .ok_or_else(|| not_participant(*shard, ParticipantRole::Recipient))?;
            Ok(!std::mem::replace(&mut progress.cloned, true))
        }
        ParticipantReport::RecipientCaughtUp { shard, last_applied_catchup } => {
            let fetch = doc.fetch_timestamp.ok_or_else(|| {
                StrataError::InvalidState(format!("{} caught up before resharding {} chose a fetch timestamp", shard, op))
            })?;
            if *last_applied_catchup < fetch {
                return Err(StrataError::InvalidState(format!(
                    "{} reported catch-up at {}, before the fetch timestamp {}",
                    shard, last_applied_catchup, fetch
                )));
            }
            let progress = doc
                .recipient_progress
                .get_mut(shard)
                .ok_or_else(|| not_participant(*shard, ParticipantRole::Recipient))?;
            let merged = progress.caught_up_at.map_or(*last_applied_catchup, |ts| ts.max(*last_applied_catchup));
            if progress.caught_up_at == Some(merged) {
                return Ok(false);
            }
            progress.caught_up_at = Some(merged);
            Ok(true)
        }
        ParticipantReport::Failed { .. } => Ok(false),
        ParticipantReport::DecisionApplied { shard, role, decision } => {
            if doc.decision != Some(*decision) {
                return Err(StrataError::InvalidState(format!(
                    "{} applied {:?} but resharding {} decided {:?}",
                    shard, decision, op, doc.decision
                )));
            }
            let cleaned_up = match role {
                ParticipantRole::Donor => doc.donor_progress.get_mut(shard).map(|p| &mut p.cleaned_up),
                ParticipantRole::Recipient => doc.recipient_progress.get_mut(shard).map(|p| &mut p.cleaned_up),
            }
            .ok_or_else(|| not_participant(*shard, *role))?;
            Ok(!std::mem::replace(cleaned_up, true))
        }
    }
}

#[async_trait]
impl CoordinatorHandle for ReshardingCoordinator {
    async fn report(&self, operation_id: OperationId, report: ParticipantReport) -> Result<()> {
        self.handle_report(operation_id, report).await
    }
}
