// COORDINATOR / PARTICIPANT MESSAGING
// Point-to-point messages between the coordinator and the shards, plus an
// in-process network with injectable unreachability

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Serialize, Deserialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use log::debug;

use strata_core::{OperationId, Result, ShardId, StrataError, Timestamp};
use crate::oplog_fetcher::OplogSource;
use crate::resharding_document::{CoordinationDocument, Decision, ParticipantRole};
use crate::shard_node::ShardNode;

/// Coordinator to participant; every message carries the persisted document it announces
#[derive(Debug, Clone)]
pub enum CoordinatorMessage {
    Start(CoordinationDocument),
    Progress(CoordinationDocument),
    Decision(CoordinationDocument),
}

impl CoordinatorMessage {
    pub fn document(&self) -> &CoordinationDocument {
        match self {
            CoordinatorMessage::Start(doc)
            | CoordinatorMessage::Progress(doc)
            | CoordinatorMessage::Decision(doc) => doc,
        }
    }

    pub fn into_document(self) -> CoordinationDocument {
        match self {
            CoordinatorMessage::Start(doc)
            | CoordinatorMessage::Progress(doc)
            | CoordinatorMessage::Decision(doc) => doc,
        }
    }
}

/// Participant to coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantReport {
    DonorReady { shard: ShardId, min_fetch_timestamp: Timestamp },
    RecipientAcknowledged { shard: ShardId },
    RecipientCloned { shard: ShardId },
    RecipientCaughtUp { shard: ShardId, last_applied_catchup: Timestamp },
    Failed { shard: ShardId, role: ParticipantRole, reason: String },
    DecisionApplied { shard: ShardId, role: ParticipantRole, decision: Decision },
}

impl ParticipantReport {
    pub fn shard(&self) -> ShardId {
        match self {
            ParticipantReport::DonorReady { shard, .. }
            | ParticipantReport::RecipientAcknowledged { shard }
            | ParticipantReport::RecipientCloned { shard }
            | ParticipantReport::RecipientCaughtUp { shard, .. }
            | ParticipantReport::Failed { shard, .. }
            | ParticipantReport::DecisionApplied { shard, .. } => *shard,
        }
    }
}

#[async_trait]
pub trait ParticipantTransport: Send + Sync {
    async fn send(&self, shard: ShardId, message: CoordinatorMessage) -> Result<()>;
}

#[async_trait]
pub trait CoordinatorHandle: Send + Sync {
    async fn report(&self, operation_id: OperationId, report: ParticipantReport) -> Result<()>;
}

/// Access from a recipient to a donor's data and oplog
#[async_trait]
pub trait DonorClient: Send + Sync {
    async fn connect(&self, donor: ShardId) -> Result<Arc<dyn OplogSource>>;
}

/// In-process network between the coordinator and the shard nodes
#[derive(Default)]
pub struct LocalNetwork {
    inboxes: DashMap<ShardId, mpsc::UnboundedSender<CoordinatorMessage>>,
    nodes: DashMap<ShardId, Arc<ShardNode>>,
    unreachable: DashSet<ShardId>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        LocalNetwork::default()
    }

    /// Attach a node; returns the inbox its participant host reads from
    pub fn register(&self, node: Arc<ShardNode>) -> mpsc::UnboundedReceiver<CoordinatorMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shard = node.shard_id();
        self.inboxes.insert(shard, tx);
        self.nodes.insert(shard, node);
        rx
    }

    pub fn set_reachable(&self, shard: ShardId, reachable: bool) {
        if reachable {
            self.unreachable.remove(&shard);
        } else {
            self.unreachable.insert(shard);
        }
        debug!("{} is now {}", shard, if reachable { "reachable" } else { "unreachable" });
    }

    pub fn is_reachable(&self, shard: ShardId) -> bool {
        !self.unreachable.contains(&shard)
    }

    fn check(&self, shard: ShardId) -> Result<()> {
        if self.is_reachable(shard) {
            Ok(())
        } else {
            Err(StrataError::ParticipantUnreachable(vec![shard]))
        }
    }

    /// Reports from `shard` to `coordinator`, subject to the same reachability
    pub fn coordinator_link(
        self: &Arc<Self>,
        shard: ShardId,
        coordinator: Arc<dyn CoordinatorHandle>,
    ) -> Arc<dyn CoordinatorHandle> {
        Arc::new(LocalCoordinatorLink { shard, network: self.clone(), coordinator })
    }
}

#[async_trait]
impl ParticipantTransport for LocalNetwork {
    async fn send(&self, shard: ShardId, message: CoordinatorMessage) -> Result<()> {
        self.check(shard)?;
        let inbox = self
            .inboxes
            .get(&shard)
            .map(|tx| tx.clone())
            .ok_or_else(|| StrataError::ParticipantUnreachable(vec![shard]))?;
        inbox
            .send(message)
            .map_err(|_| StrataError::ParticipantUnreachable(vec![shard]))
    }
}

#[async_trait]
impl DonorClient for LocalNetwork {
    async fn connect(&self, donor: ShardId) -> Result<Arc<dyn OplogSource>> {
        self.check(donor)?;
        let node = self
            .nodes
            .get(&donor)
            .map(|n| n.clone())
            .ok_or_else(|| StrataError::NotFound(format!("donor {}", donor)))?;
        Ok(node)
    }
}

struct LocalCoordinatorLink {
    shard: ShardId,
    network: Arc<LocalNetwork>,
    coordinator: Arc<dyn CoordinatorHandle>,
}

#[async_trait]
impl CoordinatorHandle for LocalCoordinatorLink {
    async fn report(&self, operation_id: OperationId, report: ParticipantReport) -> Result<()> {
        self.network.check(self.shard)?;
        self.coordinator.report(operation_id, report).await
    }
}
