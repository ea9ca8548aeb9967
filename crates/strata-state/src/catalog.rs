// LOCAL CATALOG
// Databases, collections, documents and installed indexes of one shard
//
// SAFETY INVARIANTS:
// 1. apply() is all-or-nothing: a failed op leaves the catalog untouched
// 2. Installed indexes are maintained on every document write
// 3. Unique indexes never hold two records with the same key

use serde::{Serialize, Deserialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use strata_core::{Document, Namespace, Result, StrataError};
use crate::index_key::{find_duplicate_key, IndexEntry, IndexSpec};
use crate::oplog::{OplogEntry, OplogOp};

/// Informational status returned when dropping a missing database
pub const DATABASE_DOES_NOT_EXIST: &str = "database does not exist";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropDatabaseReply {
    pub dropped: Option<String>,
    pub info: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InstalledIndex {
    pub spec: IndexSpec,
    pub entries: BTreeSet<IndexEntry>,
}

#[derive(Debug, Clone)]
pub struct Collection {
    pub uuid: Uuid,
    pub docs: BTreeMap<i64, Document>,
    pub indexes: BTreeMap<String, InstalledIndex>,
}

impl Collection {
    fn new(uuid: Uuid) -> Self {
        Collection { uuid, docs: BTreeMap::new(), indexes: BTreeMap::new() }
    }

    /// Reject a write that would break a unique index
    fn check_unique(&self, before: Option<&Document>, after: &Document) -> Result<()> {
        for index in self.indexes.values().filter(|i| i.spec.unique) {
            let entry = index.spec.entry_for(after);
            let clash = index
                .entries
                .iter()
                .find(|e| e.key == entry.key && e.doc_id != after.id)
                .filter(|e| before.map_or(true, |b| b.id != e.doc_id));
            if let Some(existing) = clash {
                return Err(StrataError::ConstraintViolation(format!(
                    "duplicate key {:?} for index {} (records {} and {})",
                    entry.key, index.spec.name, existing.doc_id, after.id
                )));
            }
        }
        Ok(())
    }

    fn index_write(&mut self, before: Option<&Document>, after: Option<&Document>) {
        for index in self.indexes.values_mut() {
            if let Some(doc) = before {
                index.entries.remove(&index.spec.entry_for(doc));
            }
            if let Some(doc) = after {
                index.entries.insert(index.spec.entry_for(doc));
            }
        }
    }
}

/// Catalog of one shard
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    databases: BTreeMap<String, BTreeMap<String, Collection>>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    pub fn collection(&self, ns: &Namespace) -> Option<&Collection> {
        self.databases.get(&ns.db)?.get(&ns.coll)
    }

    fn collection_mut(&mut self, ns: &Namespace) -> Result<&mut Collection> {
        self.databases
            .get_mut(&ns.db)
            .and_then(|db| db.get_mut(&ns.coll))
            .ok_or_else(|| StrataError::NotFound(format!("collection {}", ns)))
    }

    pub fn database_names(&self) -> Vec<String> {
        self.databases.keys().cloned().collect()
    }

    pub fn database_exists(&self, name: &str) -> bool {
        self.databases.contains_key(name)
    }

    pub fn collection_names(&self, db: &str) -> Vec<String> {
        self.databases
            .get(db)
            .map(|colls| colls.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Validate and apply one logged operation
    pub fn apply(&mut self, entry: &OplogEntry) -> Result<()> {
        let ns = &entry.ns;
        match &entry.op {
            OplogOp::CreateCollection { uuid } => {
                let db = self.databases.entry(ns.db.clone()).or_default();
                if db.contains_key(&ns.coll) {
                    return Err(StrataError::InvalidState(format!("collection {} already exists", ns)));
                }
                db.insert(ns.coll.clone(), Collection::new(*uuid));
            }
            OplogOp::Insert { doc } => {
                let coll = self.collection_mut(ns)?;
                if coll.docs.contains_key(&doc.id) {
                    return Err(StrataError::ConstraintViolation(format!(
                        "duplicate key _id {} in {}",
                        doc.id, ns
                    )));
                }
                coll.check_unique(None, doc)?;
                coll.index_write(None, Some(doc));
                coll.docs.insert(doc.id, doc.clone());
            }
            OplogOp::Update { before, after } => {
                let coll = self.collection_mut(ns)?;
                if !coll.docs.contains_key(&before.id) {
                    return Err(StrataError::NotFound(format!("document {} in {}", before.id, ns)));
                }
                coll.check_unique(Some(before), after)?;
                coll.index_write(Some(before), Some(after));
                coll.docs.insert(after.id, after.clone());
            }
            OplogOp::Delete { before } => {
                let coll = self.collection_mut(ns)?;
                if coll.docs.remove(&before.id).is_none() {
                    return Err(StrataError::NotFound(format!("document {} in {}", before.id, ns)));
                }
                coll.index_write(Some(before), None);
            }
            OplogOp::DropCollection => {
                let db = self
                    .databases
                    .get_mut(&ns.db)
                    .ok_or_else(|| StrataError::NotFound(format!("database {}", ns.db)))?;
                if db.remove(&ns.coll).is_none() {
                    return Err(StrataError::NotFound(format!("collection {}", ns)));
                }
                if db.is_empty() {
                    self.databases.remove(&ns.db);
                }
            }
            OplogOp::RenameCollection { to, drop_target } => {
                if self.collection(ns).is_none() {
                    return Err(StrataError::NotFound(format!("collection {}", ns)));
                }
                if self.collection(to).is_some() && !drop_target {
                    return Err(StrataError::InvalidState(format!("target {} exists", to)));
                }
                let coll = self
                    .databases
                    .get_mut(&ns.db)
                    .and_then(|db| db.remove(&ns.coll))
                    .ok_or_else(|| StrataError::NotFound(format!("collection {}", ns)))?;
                if self.databases.get(&ns.db).map_or(false, |db| db.is_empty()) {
                    self.databases.remove(&ns.db);
                }
                self.databases.entry(to.db.clone()).or_default().insert(to.coll.clone(), coll);
            }
            OplogOp::DropDatabase => {
                if self.databases.remove(&ns.db).is_none() {
                    return Err(StrataError::NotFound(format!("database {}", ns.db)));
                }
            }
            OplogOp::CreateIndex { spec } => {
                let coll = self.collection_mut(ns)?;
                if coll.indexes.contains_key(&spec.name) {
                    return Err(StrataError::InvalidState(format!("index {} already exists", spec.name)));
                }
                let entries: BTreeSet<IndexEntry> =
                    coll.docs.values().map(|d| spec.entry_for(d)).collect();
                if spec.unique {
                    if let Some((a, b)) = find_duplicate_key(&entries) {
                        return Err(StrataError::ConstraintViolation(format!(
                            "duplicate key {:?} for index {} (records {} and {})",
                            a.key, spec.name, a.doc_id, b.doc_id
                        )));
                    }
                }
                coll.indexes.insert(spec.name.clone(), InstalledIndex { spec: spec.clone(), entries });
            }
        }
        Ok(())
    }

    /// Replay a whole log from an empty catalog
    pub fn replay<'a, I>(entries: I) -> Result<Catalog>
    where
        I: IntoIterator<Item = &'a OplogEntry>,
    {
        let mut catalog = Catalog::new();
        for entry in entries {
            catalog.apply(entry)?;
        }
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{PartitionKey, Timestamp};

    fn entry(ns: &Namespace, op: OplogOp) -> OplogEntry {
        OplogEntry { ts: Timestamp::MIN, ns: ns.clone(), op }
    }

    #[test]
    fn test_failed_insert_leaves_catalog_untouched() {
        let ns: Namespace = "db.c".parse().unwrap();
        let mut catalog = Catalog::new();
        catalog.apply(&entry(&ns, OplogOp::CreateCollection { uuid: Uuid::new_v4() })).unwrap();
        catalog
            .apply(&entry(&ns, OplogOp::CreateIndex {
                spec: IndexSpec::new("a_1", PartitionKey::single("a")).unique(),
            }))
            .unwrap();
        catalog.apply(&entry(&ns, OplogOp::Insert { doc: Document::new(1).with("a", 1) })).unwrap();

        let dup = catalog.apply(&entry(&ns, OplogOp::Insert { doc: Document::new(2).with("a", 1) }));
        assert!(matches!(dup, Err(StrataError::ConstraintViolation(_))));

        let coll = catalog.collection(&ns).unwrap();
        assert_eq!(coll.docs.len(), 1);
        assert_eq!(coll.indexes["a_1"].entries.len(), 1);
    }

    #[test]
    fn test_update_maintains_index() {
        let ns: Namespace = "db.c".parse().unwrap();
        let mut catalog = Catalog::new();
        catalog.apply(&entry(&ns, OplogOp::CreateCollection { uuid: Uuid::new_v4() })).unwrap();
        let before = Document::new(1).with("a", 1);
        catalog.apply(&entry(&ns, OplogOp::Insert { doc: before.clone() })).unwrap();
        catalog
            .apply(&entry(&ns, OplogOp::CreateIndex { spec: IndexSpec::new("a_1", PartitionKey::single("a")) }))
            .unwrap();

        let after = Document::new(1).with("a", 9);
        catalog.apply(&entry(&ns, OplogOp::Update { before, after })).unwrap();
        let entries = &catalog.collection(&ns).unwrap().indexes["a_1"].entries;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.iter().next().unwrap().key, vec![strata_core::Value::Int(9)]);
    }

    #[test]
    fn test_rename_over_existing_target() {
        let src: Namespace = "db.system.resharding.x".parse().unwrap();
        let dst: Namespace = "db.coll".parse().unwrap();
        let mut catalog = Catalog::new();
        let new_uuid = Uuid::new_v4();
        catalog.apply(&entry(&dst, OplogOp::CreateCollection { uuid: Uuid::new_v4() })).unwrap();
        catalog.apply(&entry(&src, OplogOp::CreateCollection { uuid: new_uuid })).unwrap();

        let refused = catalog.apply(&entry(&src, OplogOp::RenameCollection { to: dst.clone(), drop_target: false }));
        assert!(refused.is_err());

        catalog.apply(&entry(&src, OplogOp::RenameCollection { to: dst.clone(), drop_target: true })).unwrap();
        assert_eq!(catalog.collection(&dst).unwrap().uuid, new_uuid);
        assert!(catalog.collection(&src).is_none());
    }
}
