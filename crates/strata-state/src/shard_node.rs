// SHARD NODE
// In-process model of one shard primary: a catalog, its oplog and a durable store
//
// SAFETY INVARIANTS:
// 1. Every write is validated against the catalog before it is logged
// 2. The catalog is always the replay of the surviving oplog
// 3. A rollback never discards majority-committed entries
// 4. Reads taken at a timestamp advance the local clock past it

use parking_lot::RwLock;
use std::collections::BTreeSet;
use log::{debug, info, warn};
use uuid::Uuid;

use strata_core::{Document, Namespace, Result, ShardId, StrataError, Timestamp};
use crate::catalog::{Catalog, DropDatabaseReply, DATABASE_DOES_NOT_EXIST};
use crate::checkpoint_store::CheckpointStore;
use crate::index_build::IndexBuildSource;
use crate::index_key::{IndexEntry, IndexSpec};
use crate::oplog::{Oplog, OplogEntry, OplogOp};
use crate::oplog_fetcher::OplogSource;
use crate::replication::{ReplicationLog, RollbackEvent};

/// Pseudo-collection that database-level operations are logged against
const DATABASE_COMMAND_COLLECTION: &str = "$cmd";

struct NodeState {
    catalog: Catalog,
    oplog: Oplog,
}

impl NodeState {
    fn log_write(&mut self, ns: Namespace, op: OplogOp) -> Result<Timestamp> {
        let entry = OplogEntry { ts: Timestamp::MIN, ns, op };
        self.catalog.apply(&entry)?;
        Ok(self.oplog.append(entry.ns, entry.op))
    }

    fn ensure_collection(&mut self, ns: &Namespace) -> Result<()> {
        if self.catalog.collection(ns).is_none() {
            self.log_write(ns.clone(), OplogOp::CreateCollection { uuid: Uuid::new_v4() })?;
        }
        Ok(())
    }
}

/// Whether a logged entry affects the contents of `ns`
fn touches_namespace(entry: &OplogEntry, ns: &Namespace) -> bool {
    match &entry.op {
        OplogOp::DropDatabase => entry.ns.db == ns.db,
        OplogOp::RenameCollection { to, .. } => entry.ns == *ns || to == ns,
        _ => entry.ns == *ns,
    }
}

pub struct ShardNode {
    shard_id: ShardId,
    store: CheckpointStore,
    state: RwLock<NodeState>,
}

impl ShardNode {
    pub fn new(shard_id: ShardId, store: CheckpointStore) -> Self {
        ShardNode {
            shard_id,
            store,
            state: RwLock::new(NodeState { catalog: Catalog::new(), oplog: Oplog::new() }),
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    // === Writes ===

    pub fn create_collection(&self, ns: &Namespace) -> Result<Uuid> {
        let uuid = Uuid::new_v4();
        self.state.write().log_write(ns.clone(), OplogOp::CreateCollection { uuid })?;
        info!("[{}] Created collection {} ({})", self.shard_id, ns, uuid);
        Ok(uuid)
    }

    /// Insert a document; the collection is created if missing
    pub fn insert(&self, ns: &Namespace, doc: Document) -> Result<Timestamp> {
        let mut state = self.state.write();
        state.ensure_collection(ns)?;
        state.log_write(ns.clone(), OplogOp::Insert { doc })
    }

    pub fn update(&self, ns: &Namespace, doc: Document) -> Result<Timestamp> {
        let mut state = self.state.write();
        let before = state
            .catalog
            .collection(ns)
            .and_then(|c| c.docs.get(&doc.id))
            .cloned()
            .ok_or_else(|| StrataError::NotFound(format!("document {} in {}", doc.id, ns)))?;
        state.log_write(ns.clone(), OplogOp::Update { before, after: doc })
    }

    pub fn upsert(&self, ns: &Namespace, doc: Document) -> Result<Timestamp> {
        let mut state = self.state.write();
        state.ensure_collection(ns)?;
        let before = state.catalog.collection(ns).and_then(|c| c.docs.get(&doc.id)).cloned();
        match before {
            Some(before) => state.log_write(ns.clone(), OplogOp::Update { before, after: doc }),
            None => state.log_write(ns.clone(), OplogOp::Insert { doc }),
        }
    }

    /// Delete by `_id`; `None` if there was nothing to delete
    pub fn delete(&self, ns: &Namespace, id: i64) -> Result<Option<Timestamp>> {
        let mut state = self.state.write();
        let before = state.catalog.collection(ns).and_then(|c| c.docs.get(&id)).cloned();
        match before {
            Some(before) => Ok(Some(state.log_write(ns.clone(), OplogOp::Delete { before })?)),
            None => Ok(None),
        }
    }

    pub fn drop_collection(&self, ns: &Namespace) -> Result<bool> {
        let mut state = self.state.write();
        if state.catalog.collection(ns).is_none() {
            return Ok(false);
        }
        state.log_write(ns.clone(), OplogOp::DropCollection)?;
        info!("[{}] Dropped collection {}", self.shard_id, ns);
        Ok(true)
    }

    /// Drop `ns` only if it is still the collection identified by `uuid`
    pub fn drop_collection_if_uuid(&self, ns: &Namespace, uuid: Uuid) -> Result<bool> {
        let mut state = self.state.write();
        let current = state.catalog.collection(ns).map(|c| c.uuid);
        match current {
            Some(found) if found == uuid => {
                state.log_write(ns.clone(), OplogOp::DropCollection)?;
                info!("[{}] Dropped collection {} ({})", self.shard_id, ns, uuid);
                Ok(true)
            }
            Some(found) => {
                debug!(
                    "[{}] Not dropping {}: uuid {} replaced by {}",
                    self.shard_id, ns, uuid, found
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    pub fn rename_collection(&self, from: &Namespace, to: &Namespace, drop_target: bool) -> Result<Timestamp> {
        let ts = self.state.write().log_write(
            from.clone(),
            OplogOp::RenameCollection { to: to.clone(), drop_target },
        )?;
        info!("[{}] Renamed {} to {}", self.shard_id, from, to);
        Ok(ts)
    }

    pub fn drop_database(&self, name: &str) -> Result<DropDatabaseReply> {
        let ns = Namespace::new(name, DATABASE_COMMAND_COLLECTION)?;
        let mut state = self.state.write();
        if !state.catalog.database_exists(name) {
            debug!("[{}] dropDatabase {}: {}", self.shard_id, name, DATABASE_DOES_NOT_EXIST);
            return Ok(DropDatabaseReply {
                dropped: None,
                info: Some(DATABASE_DOES_NOT_EXIST.to_string()),
            });
        }
        state.log_write(ns, OplogOp::DropDatabase)?;
        info!("[{}] Dropped database {}", self.shard_id, name);
        Ok(DropDatabaseReply { dropped: Some(name.to_string()), info: None })
    }

    pub fn create_index(&self, ns: &Namespace, spec: IndexSpec) -> Result<Timestamp> {
        self.state.write().log_write(ns.clone(), OplogOp::CreateIndex { spec })
    }

    // === Reads ===

    pub fn database_names(&self) -> Vec<String> {
        self.state.read().catalog.database_names()
    }

    pub fn database_exists(&self, name: &str) -> bool {
        self.state.read().catalog.database_exists(name)
    }

    pub fn collection_names(&self, db: &str) -> Vec<String> {
        self.state.read().catalog.collection_names(db)
    }

    pub fn collection_uuid(&self, ns: &Namespace) -> Option<Uuid> {
        self.state.read().catalog.collection(ns).map(|c| c.uuid)
    }

    pub fn find(&self, ns: &Namespace, id: i64) -> Option<Document> {
        self.state.read().catalog.collection(ns).and_then(|c| c.docs.get(&id).cloned())
    }

    /// Every document of `ns` in `_id` order
    pub fn find_all(&self, ns: &Namespace) -> Vec<Document> {
        self.state
            .read()
            .catalog
            .collection(ns)
            .map(|c| c.docs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, ns: &Namespace) -> usize {
        self.state.read().catalog.collection(ns).map_or(0, |c| c.docs.len())
    }

    pub fn list_indexes(&self, ns: &Namespace) -> Vec<IndexSpec> {
        self.state
            .read()
            .catalog
            .collection(ns)
            .map(|c| c.indexes.values().map(|i| i.spec.clone()).collect())
            .unwrap_or_default()
    }

    pub fn index_entries(&self, ns: &Namespace, index: &str) -> Option<BTreeSet<IndexEntry>> {
        self.state
            .read()
            .catalog
            .collection(ns)
            .and_then(|c| c.indexes.get(index))
            .map(|i| i.entries.clone())
    }

    // === Replication ===

    pub fn last_applied(&self) -> Timestamp {
        self.state.read().oplog.last_applied()
    }

    pub fn majority_commit_point(&self) -> Timestamp {
        self.state.read().oplog.majority_commit_point()
    }

    pub fn advance_majority_to(&self, ts: Timestamp) {
        self.state.write().oplog.advance_majority_to(ts);
    }

    /// Mark everything applied so far as majority-committed
    pub fn commit_majority(&self) -> Timestamp {
        let mut state = self.state.write();
        let last = state.oplog.last_applied();
        state.oplog.advance_majority_to(last);
        state.oplog.majority_commit_point()
    }

    /// Roll the node back to `point` and rebuild the catalog from the surviving log
    pub fn rollback_to(&self, point: Timestamp) -> Result<RollbackEvent> {
        let mut state = self.state.write();
        let removed = state.oplog.truncate_after(point)?;
        let catalog = Catalog::replay(state.oplog.entries()).map_err(|e| {
            StrataError::Storage(format!("catalog replay after rollback failed: {}", e))
        })?;
        state.catalog = catalog;
        warn!(
            "[{}] Rolled back to {}: {} oplog entries discarded",
            self.shard_id,
            point,
            removed.len()
        );
        Ok(RollbackEvent { rollback_point: point, entries_removed: removed.len() })
    }

    /// Documents of `ns` as of `ts`, in `_id` order.
    ///
    /// The local clock is advanced past `ts` first so no later write can
    /// be issued at or before the snapshot time.
    pub fn snapshot_at(&self, ns: &Namespace, ts: Timestamp) -> Result<Vec<Document>> {
        let mut state = self.state.write();
        state.oplog.observe_cluster_time(ts);
        let catalog = Catalog::replay(state.oplog.entries().iter().take_while(|e| e.ts <= ts))?;
        Ok(catalog
            .collection(ns)
            .map(|c| c.docs.values().cloned().collect())
            .unwrap_or_default())
    }

    pub fn oplog_after(&self, after: Timestamp, limit: usize) -> Vec<OplogEntry> {
        self.state.read().oplog.entries_after(after, limit)
    }
}

impl ReplicationLog for ShardNode {
    fn last_applied(&self) -> Timestamp {
        ShardNode::last_applied(self)
    }

    fn majority_commit_point(&self) -> Timestamp {
        ShardNode::majority_commit_point(self)
    }
}

impl IndexBuildSource for ShardNode {
    fn scan_after(&self, ns: &Namespace, cursor: Option<i64>, limit: usize) -> Result<Vec<Document>> {
        let state = self.state.read();
        let coll = state
            .catalog
            .collection(ns)
            .ok_or_else(|| StrataError::NotFound(format!("collection {}", ns)))?;
        let docs = match cursor {
            Some(after) => coll
                .docs
                .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                .take(limit)
                .map(|(_, d)| d.clone())
                .collect(),
            None => coll.docs.values().take(limit).cloned().collect(),
        };
        Ok(docs)
    }

    fn side_writes_after(&self, ns: &Namespace, after: Timestamp, limit: usize) -> Result<Vec<OplogEntry>> {
        let state = self.state.read();
        let entries = state.oplog.entries();
        let start = entries.partition_point(|e| e.ts <= after);
        Ok(entries[start..]
            .iter()
            .filter(|e| touches_namespace(e, ns))
            .take(limit)
            .cloned()
            .collect())
    }

    fn install_index(&self, ns: &Namespace, spec: &IndexSpec, drained_through: Timestamp) -> Result<Option<Timestamp>> {
        let mut state = self.state.write();
        let entries = state.oplog.entries();
        let start = entries.partition_point(|e| e.ts <= drained_through);
        if entries[start..].iter().any(|e| touches_namespace(e, ns)) {
            return Ok(None);
        }
        let ts = state.log_write(ns.clone(), OplogOp::CreateIndex { spec: spec.clone() })?;
        info!("[{}] Index {} on {} is now visible", self.shard_id, spec.name, ns);
        Ok(Some(ts))
    }
}

impl OplogSource for ShardNode {
    fn snapshot_at(&self, ns: &Namespace, ts: Timestamp) -> Result<Vec<Document>> {
        ShardNode::snapshot_at(self, ns, ts)
    }

    fn oplog_after(&self, after: Timestamp, limit: usize) -> Vec<OplogEntry> {
        ShardNode::oplog_after(self, after, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::durable_store::MemoryStore;
    use strata_core::PartitionKey;

    fn node() -> ShardNode {
        ShardNode::new(ShardId(0), CheckpointStore::new(Arc::new(MemoryStore::new())))
    }

    fn ns() -> Namespace {
        "test.coll".parse().unwrap()
    }

    #[test]
    fn test_insert_creates_collection_and_logs() {
        let node = node();
        let ts = node.insert(&ns(), Document::new(1).with("a", 1)).unwrap();
        assert!(node.database_exists("test"));
        assert_eq!(node.count(&ns()), 1);
        assert_eq!(node.last_applied(), ts);
        // CreateCollection + Insert
        assert_eq!(node.oplog_after(Timestamp::MIN, 10).len(), 2);
    }

    #[test]
    fn test_rollback_rebuilds_catalog() {
        let node = node();
        node.insert(&ns(), Document::new(1)).unwrap();
        let point = node.commit_majority();
        node.insert(&ns(), Document::new(2)).unwrap();
        node.create_index(&ns(), IndexSpec::new("a_1", PartitionKey::single("a"))).unwrap();

        let event = node.rollback_to(point).unwrap();
        assert_eq!(event.entries_removed, 2);
        assert_eq!(node.count(&ns()), 1);
        assert!(node.list_indexes(&ns()).is_empty());
        assert!(node.rollback_to(Timestamp::MIN).is_err());
    }

    #[test]
    fn test_snapshot_at_is_point_in_time() {
        let node = node();
        node.insert(&ns(), Document::new(1).with("a", 1)).unwrap();
        let at = node.last_applied();
        node.update(&ns(), Document::new(1).with("a", 2)).unwrap();
        node.insert(&ns(), Document::new(2)).unwrap();

        let snap = node.snapshot_at(&ns(), at).unwrap();
        assert_eq!(snap, vec![Document::new(1).with("a", 1)]);

        // Writes issued after a future-dated snapshot land after it
        let future = Timestamp::new(1_000, 0);
        node.snapshot_at(&ns(), future).unwrap();
        assert!(node.insert(&ns(), Document::new(3)).unwrap() > future);
    }

    #[test]
    fn test_uuid_guarded_drop() {
        let node = node();
        let uuid = node.create_collection(&ns()).unwrap();
        assert!(!node.drop_collection_if_uuid(&ns(), Uuid::new_v4()).unwrap());
        assert!(node.drop_collection_if_uuid(&ns(), uuid).unwrap());
        assert!(!node.database_exists("test"));
    }

    #[test]
    fn test_install_refused_when_writes_are_pending() {
        let node = node();
        node.insert(&ns(), Document::new(1).with("a", 1)).unwrap();
        let drained = node.last_applied();
        node.insert(&ns(), Document::new(2).with("a", 2)).unwrap();

        let spec = IndexSpec::new("a_1", PartitionKey::single("a"));
        assert_eq!(node.install_index(&ns(), &spec, drained).unwrap(), None);
        assert!(node.install_index(&ns(), &spec, node.last_applied()).unwrap().is_some());
        assert_eq!(node.index_entries(&ns(), "a_1").unwrap().len(), 2);
    }

    #[test]
    fn test_side_writes_include_database_drop() {
        let node = node();
        node.insert(&ns(), Document::new(1)).unwrap();
        let start = node.last_applied();
        node.insert(&"test.other".parse().unwrap(), Document::new(5)).unwrap();
        node.drop_database("test").unwrap();

        let writes = node.side_writes_after(&ns(), start, 10).unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].op, OplogOp::DropDatabase);
    }
}
