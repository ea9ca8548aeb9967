// INDEX KEYS
// Index definitions and the (key, record id) entries stored in an index

use serde::{Serialize, Deserialize};
use std::collections::BTreeSet;

use strata_core::{Document, PartitionKey, Value};

/// Index definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub key: PartitionKey,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(name: &str, key: PartitionKey) -> Self {
        IndexSpec { name: name.to_string(), key, unique: false }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Conventional index name for a key pattern, e.g. `newKey_1`
    pub fn default_name(key: &PartitionKey) -> String {
        key.fields.iter().map(|f| format!("{}_1", f)).collect::<Vec<_>>().join("_")
    }

    pub fn entry_for(&self, doc: &Document) -> IndexEntry {
        IndexEntry { key: self.key.extract(doc), doc_id: doc.id }
    }
}

/// One index entry; ordered by key, then record id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct IndexEntry {
    pub key: Vec<Value>,
    pub doc_id: i64,
}

/// First pair of entries sharing a key but pointing at different records.
///
/// `entries` must be sorted.
pub fn find_duplicate_key<'a, I>(entries: I) -> Option<(&'a IndexEntry, &'a IndexEntry)>
where
    I: IntoIterator<Item = &'a IndexEntry>,
{
    let mut prev: Option<&IndexEntry> = None;
    for entry in entries {
        if let Some(p) = prev {
            if p.key == entry.key && p.doc_id != entry.doc_id {
                return Some((p, entry));
            }
        }
        prev = Some(entry);
    }
    None
}

/// Apply one side write to an index under set semantics.
///
/// The before-image entry is removed before the after-image entry is inserted,
/// so replaying the same write twice leaves the index unchanged.
pub fn apply_side_write(
    index: &mut BTreeSet<IndexEntry>,
    spec: &IndexSpec,
    before: Option<&Document>,
    after: Option<&Document>,
) {
    if let Some(doc) = before {
        index.remove(&spec.entry_for(doc));
    }
    if let Some(doc) = after {
        index.insert(spec.entry_for(doc));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_name() {
        assert_eq!(IndexSpec::default_name(&PartitionKey::single("newKey")), "newKey_1");
        assert_eq!(IndexSpec::default_name(&PartitionKey::new(["a", "b"])), "a_1_b_1");
    }

    #[test]
    fn test_duplicate_detection_ignores_same_record() {
        let spec = IndexSpec::new("a_1", PartitionKey::single("a")).unique();
        let mut set = BTreeSet::new();
        set.insert(spec.entry_for(&Document::new(1).with("a", 5)));
        set.insert(spec.entry_for(&Document::new(2).with("a", 6)));
        assert!(find_duplicate_key(&set).is_none());

        set.insert(spec.entry_for(&Document::new(3).with("a", 5)));
        let (x, y) = find_duplicate_key(&set).unwrap();
        assert_eq!(x.key, y.key);
        assert_ne!(x.doc_id, y.doc_id);
    }

    #[test]
    fn test_side_write_replay_is_idempotent() {
        let spec = IndexSpec::new("a_1", PartitionKey::single("a"));
        let before = Document::new(1).with("a", 1);
        let after = Document::new(1).with("a", 2);

        let mut index = BTreeSet::new();
        index.insert(spec.entry_for(&before));

        apply_side_write(&mut index, &spec, Some(&before), Some(&after));
        let once = index.clone();
        apply_side_write(&mut index, &spec, Some(&before), Some(&after));
        assert_eq!(index, once);
        assert_eq!(index.len(), 1);
        assert!(index.contains(&spec.entry_for(&after)));
    }
}
