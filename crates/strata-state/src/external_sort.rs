// EXTERNAL SORTER
// Sorted runs spilled to the checkpoint store and merged back in key order
//
// SAFETY INVARIANTS:
// 1. A run is immutable once written
// 2. Entries inside a run are sorted and free of exact duplicates
// 3. merge() yields every entry of every run exactly once, in order

use serde::{Serialize, Deserialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use log::debug;

use strata_core::{Result, StrataError};
use crate::checkpoint_store::CheckpointStore;
use crate::index_key::IndexEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct RunId(pub u64);

impl RunId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Spills and merges sorted runs under one key prefix
#[derive(Clone)]
pub struct ExternalSorter {
    store: CheckpointStore,
    prefix: String,
}

impl ExternalSorter {
    /// `prefix` must end with a separator, e.g. `indexBuilds/<id>/`
    pub fn new(store: CheckpointStore, prefix: impl Into<String>) -> Self {
        ExternalSorter { store, prefix: prefix.into() }
    }

    fn runs_prefix(&self) -> String {
        format!("{}run/", self.prefix)
    }

    fn run_key(&self, id: RunId) -> String {
        format!("{}{:020}", self.runs_prefix(), id.0)
    }

    /// Sort `entries` and persist them as run `id`
    pub fn spill(&self, id: RunId, mut entries: Vec<IndexEntry>) -> Result<RunId> {
        entries.sort();
        entries.dedup();
        self.store.put_record(&self.run_key(id), &entries)?;
        debug!("Spilled run {} with {} entries under {}", id.0, entries.len(), self.prefix);
        Ok(id)
    }

    pub fn load_run(&self, id: RunId) -> Result<Vec<IndexEntry>> {
        self.store
            .get_record(&self.run_key(id))?
            .ok_or_else(|| StrataError::NotFound(format!("sorted run {} under {}", id.0, self.prefix)))
    }

    /// K-way merge of the given runs
    pub fn merge(&self, runs: &[RunId]) -> Result<Vec<IndexEntry>> {
        let loaded = runs.iter().map(|id| self.load_run(*id)).collect::<Result<Vec<_>>>()?;
        Ok(merge_sorted(loaded))
    }

    /// Ids of every run currently persisted
    pub fn persisted_runs(&self) -> Result<Vec<RunId>> {
        let prefix = self.runs_prefix();
        let mut ids = Vec::new();
        for key in self.store.scan_keys(&prefix)? {
            let id = key[prefix.len()..]
                .parse::<u64>()
                .map_err(|e| StrataError::Storage(format!("bad run key {}: {}", key, e)))?;
            ids.push(RunId(id));
        }
        Ok(ids)
    }

    pub fn delete_run(&self, id: RunId) -> Result<()> {
        self.store.delete_record(&self.run_key(id))
    }
}

/// Merge sorted vectors into one sorted vector without exact duplicates
pub fn merge_sorted(runs: Vec<Vec<IndexEntry>>) -> Vec<IndexEntry> {
    let total = runs.iter().map(Vec::len).sum();
    let mut iters: Vec<_> = runs.into_iter().map(Vec::into_iter).collect();
    let mut heap = BinaryHeap::new();
    for (i, it) in iters.iter_mut().enumerate() {
        if let Some(entry) = it.next() {
            heap.push(Reverse((entry, i)));
        }
    }

    let mut out: Vec<IndexEntry> = Vec::with_capacity(total);
    while let Some(Reverse((entry, i))) = heap.pop() {
        if let Some(next) = iters[i].next() {
            heap.push(Reverse((next, i)));
        }
        if out.last() != Some(&entry) {
            out.push(entry);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::durable_store::MemoryStore;
    use strata_core::Value;

    fn entry(key: i64, id: i64) -> IndexEntry {
        IndexEntry { key: vec![Value::Int(key)], doc_id: id }
    }

    #[test]
    fn test_merge_interleaves_runs() {
        let merged = merge_sorted(vec![
            vec![entry(1, 1), entry(4, 4), entry(9, 9)],
            vec![entry(2, 2), entry(3, 3)],
            vec![],
            vec![entry(4, 4), entry(5, 5)],
        ]);
        let keys: Vec<i64> = merged.iter().map(|e| e.doc_id).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5, 9]);
    }

    #[test]
    fn test_spilled_runs_survive_and_merge() {
        let store = CheckpointStore::new(Arc::new(MemoryStore::new()));
        let sorter = ExternalSorter::new(store.clone(), "build/");
        sorter.spill(RunId(0), vec![entry(3, 3), entry(1, 1)]).unwrap();
        sorter.spill(RunId(1), vec![entry(2, 2)]).unwrap();

        // A second sorter over the same store sees the same runs
        let reopened = ExternalSorter::new(store, "build/");
        assert_eq!(reopened.persisted_runs().unwrap(), vec![RunId(0), RunId(1)]);
        let merged = reopened.merge(&[RunId(0), RunId(1)]).unwrap();
        assert_eq!(merged, vec![entry(1, 1), entry(2, 2), entry(3, 3)]);

        reopened.delete_run(RunId(0)).unwrap();
        assert!(reopened.load_run(RunId(0)).is_err());
    }
}
