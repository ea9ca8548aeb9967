// === Durable Storage ===
pub mod durable_store;
pub mod checkpoint_store;

// === Shard Data Model ===
pub mod index_key;
pub mod oplog;
pub mod catalog;
pub mod replication;
pub mod shard_node;

// === Resumable Index Builds ===
pub mod external_sort;
pub mod index_checkpoint;
pub mod index_build;
pub mod rollback_adapter;

// === Routing ===
pub mod routing;

// === Resharding Protocol ===
pub mod oplog_fetcher;
pub mod retry;
pub mod transport;
pub mod resharding_document;
pub mod resharding_coordinator;
pub mod resharding_participant;
pub mod resharding_service;
pub mod local_cluster;

// === Re-exports for broader ecosystem access ===
pub use durable_store::{DurableStore, MemoryStore, SledStore};
pub use checkpoint_store::{CheckpointStore, Versioned};
pub use index_key::{IndexEntry, IndexSpec};
pub use oplog::{OplogEntry, OplogOp};
pub use catalog::{DropDatabaseReply, DATABASE_DOES_NOT_EXIST};
pub use replication::{ReplicationLog, RollbackEvent};
pub use shard_node::ShardNode;
pub use index_checkpoint::{CheckpointPhase, IndexBuildCheckpoint, IndexBuildRecord};
pub use index_build::{IndexBuildOutcome, IndexBuildPhase, IndexBuildSource, IndexBuildStatus, IndexBuilder};
pub use rollback_adapter::{ResumePoint, RollbackAdapter, RollbackOutcome};
pub use routing::{ChunkMap, ChunkRange, InMemoryRoutingTable, RoutingSink, RoutingTableUpdate};
pub use oplog_fetcher::{DonorOplogId, OplogSource, ReshardingOplogFetcher};
pub use transport::{CoordinatorHandle, CoordinatorMessage, DonorClient, LocalNetwork, ParticipantReport, ParticipantTransport};
pub use resharding_document::{
    CoordinationDocument, CoordinationStatus, CoordinatorPhase, Decision, ParticipantRole, ReshardingRequest,
};
pub use resharding_coordinator::ReshardingCoordinator;
pub use resharding_participant::{DonorState, ParticipantHost, RecipientState};
pub use resharding_service::ReshardingService;
pub use local_cluster::LocalCluster;
