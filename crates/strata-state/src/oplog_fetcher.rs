// RESHARDING OPLOG FETCHER
// Reads a donor's oplog after the fetch timestamp and turns the source collection's
// writes into the operations one recipient has to apply under the new partition key
//
// SAFETY INVARIANTS:
// 1. Only majority-committed donor entries are ever returned
// 2. Only writes to documents the recipient owns under the new key are returned
// 3. An update that moves a document between recipients is a delete for the old owner
//    and an upsert for the new one
// 4. Iteration resumes strictly after the returned DonorOplogId

use serde::{Serialize, Deserialize};
use log::debug;

use strata_core::{Document, Namespace, Result, ShardId, Timestamp};
use crate::oplog::{OplogEntry, OplogOp};
use crate::replication::ReplicationLog;
use crate::routing::ChunkMap;

/// Donor-side reads a recipient needs for cloning and catch-up
pub trait OplogSource: ReplicationLog {
    /// Documents of `ns` as of `ts`
    fn snapshot_at(&self, ns: &Namespace, ts: Timestamp) -> Result<Vec<Document>>;

    /// Up to `limit` entries with a timestamp after `after`
    fn oplog_after(&self, after: Timestamp, limit: usize) -> Vec<OplogEntry>;
}

/// Resume position in one donor's oplog
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash, Default)]
pub struct DonorOplogId {
    /// Every donor entry up to this time has been examined
    pub cluster_time: Timestamp,
    /// Timestamp of the last entry that produced an operation for this recipient
    pub ts: Timestamp,
}

impl DonorOplogId {
    pub fn starting_at(fetch_timestamp: Timestamp) -> Self {
        DonorOplogId { cluster_time: fetch_timestamp, ts: fetch_timestamp }
    }
}

/// A write the recipient applies to its temporary collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecipientOp {
    Upsert(Document),
    Delete(i64),
}

#[derive(Debug, Clone)]
pub struct FetchedBatch {
    pub ops: Vec<RecipientOp>,
    pub resume: DonorOplogId,
    /// Nothing majority-committed remains after `resume`
    pub exhausted: bool,
    /// The donor's copy of the source collection went away (dropped or replaced)
    pub source_ended: bool,
}

pub struct ReshardingOplogFetcher {
    source_ns: Namespace,
    recipient: ShardId,
    chunk_map: ChunkMap,
    batch_size: usize,
}

impl ReshardingOplogFetcher {
    pub fn new(source_ns: Namespace, recipient: ShardId, chunk_map: ChunkMap, batch_size: usize) -> Self {
        ReshardingOplogFetcher { source_ns, recipient, chunk_map, batch_size: batch_size.max(1) }
    }

    fn owns(&self, doc: &Document) -> bool {
        self.chunk_map.owner_of(doc) == Some(self.recipient)
    }

    /// Documents of a donor snapshot this recipient owns
    pub fn owned_documents(&self, docs: Vec<Document>) -> Vec<Document> {
        docs.into_iter().filter(|d| self.owns(d)).collect()
    }

    fn ends_source(&self, entry: &OplogEntry) -> bool {
        match &entry.op {
            OplogOp::DropDatabase => entry.ns.db == self.source_ns.db,
            OplogOp::RenameCollection { to, .. } => entry.ns == self.source_ns || *to == self.source_ns,
            OplogOp::DropCollection | OplogOp::CreateCollection { .. } => entry.ns == self.source_ns,
            _ => false,
        }
    }

    fn route(&self, op: &OplogOp) -> Option<RecipientOp> {
        match op {
            OplogOp::Insert { doc } if self.owns(doc) => Some(RecipientOp::Upsert(doc.clone())),
            OplogOp::Update { after, .. } if self.owns(after) => Some(RecipientOp::Upsert(after.clone())),
            OplogOp::Update { before, .. } if self.owns(before) => Some(RecipientOp::Delete(before.id)),
            OplogOp::Delete { before } if self.owns(before) => Some(RecipientOp::Delete(before.id)),
            _ => None,
        }
    }

    /// Next batch of operations after `resume`
    pub fn iterate(&self, donor: &dyn OplogSource, resume: DonorOplogId) -> Result<FetchedBatch> {
        let majority = donor.majority_commit_point();
        let entries = donor.oplog_after(resume.cluster_time, self.batch_size);
        let full_batch = entries.len() == self.batch_size;

        let mut ops = Vec::new();
        let mut next = resume;
        let mut exhausted = !full_batch;
        let mut source_ended = false;

        for entry in &entries {
            if entry.ts > majority {
                exhausted = true;
                break;
            }
            if self.ends_source(entry) {
                source_ended = true;
                exhausted = true;
                break;
            }
            next.cluster_time = entry.ts;
            if entry.ns != self.source_ns {
                continue;
            }
            if let Some(op) = self.route(&entry.op) {
                ops.push(op);
                next.ts = entry.ts;
            }
        }

        if exhausted && !source_ended && majority > next.cluster_time {
            next.cluster_time = majority;
        }
        debug!(
            "Fetched {} ops for {} from donor oplog through {}",
            ops.len(),
            self.recipient,
            next.cluster_time
        );
        Ok(FetchedBatch { ops, resume: next, exhausted, source_ended })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::checkpoint_store::CheckpointStore;
    use crate::durable_store::MemoryStore;
    use crate::shard_node::ShardNode;
    use strata_core::{PartitionKey, Value};

    fn ns() -> Namespace {
        "db.coll".parse().unwrap()
    }

    fn fetcher(recipient: u64) -> ReshardingOplogFetcher {
        let map = ChunkMap::split_at(PartitionKey::single("newKey"), vec![Value::Int(0)], ShardId(0), ShardId(1))
            .unwrap();
        ReshardingOplogFetcher::new(ns(), ShardId(recipient), map, 100)
    }

    fn donor() -> ShardNode {
        ShardNode::new(ShardId(7), CheckpointStore::new(Arc::new(MemoryStore::new())))
    }

    #[test]
    fn test_only_majority_committed_entries() {
        let donor = donor();
        donor.insert(&ns(), Document::new(1).with("newKey", -1)).unwrap();
        let fetch_ts = donor.commit_majority();

        donor.insert(&ns(), Document::new(2).with("newKey", -2)).unwrap();
        let committed = donor.commit_majority();
        donor.insert(&ns(), Document::new(3).with("newKey", -3)).unwrap();

        let batch = fetcher(0).iterate(&donor, DonorOplogId::starting_at(fetch_ts)).unwrap();
        assert_eq!(batch.ops, vec![RecipientOp::Upsert(Document::new(2).with("newKey", -2))]);
        assert_eq!(batch.resume.cluster_time, committed);
        assert!(batch.exhausted);

        // Resuming returns nothing new until the next entry commits
        let again = fetcher(0).iterate(&donor, batch.resume).unwrap();
        assert!(again.ops.is_empty());
    }

    #[test]
    fn test_cross_owner_update_splits() {
        let donor = donor();
        donor.insert(&ns(), Document::new(1).with("newKey", -1)).unwrap();
        let fetch_ts = donor.commit_majority();
        donor.update(&ns(), Document::new(1).with("newKey", 5)).unwrap();
        donor.commit_majority();

        let start = DonorOplogId::starting_at(fetch_ts);
        let old_owner = fetcher(0).iterate(&donor, start).unwrap();
        let new_owner = fetcher(1).iterate(&donor, start).unwrap();
        assert_eq!(old_owner.ops, vec![RecipientOp::Delete(1)]);
        assert_eq!(new_owner.ops, vec![RecipientOp::Upsert(Document::new(1).with("newKey", 5))]);
    }

    #[test]
    fn test_source_drop_ends_stream() {
        let donor = donor();
        donor.insert(&ns(), Document::new(1).with("newKey", 1)).unwrap();
        let fetch_ts = donor.commit_majority();
        donor.insert(&ns(), Document::new(2).with("newKey", 2)).unwrap();
        donor.drop_collection(&ns()).unwrap();
        donor.insert(&ns(), Document::new(3).with("newKey", 3)).unwrap();
        donor.commit_majority();

        let batch = fetcher(1).iterate(&donor, DonorOplogId::starting_at(fetch_ts)).unwrap();
        assert!(batch.source_ended);
        assert_eq!(batch.ops.len(), 1);
    }
}
