// DURABLE KEY/VALUE STORE
// Byte-level persistence underneath checkpoints and coordination documents
//
// SAFETY INVARIANTS:
// 1. A successful put/delete/compare_and_swap is durable before it returns (SledStore flushes)
// 2. compare_and_swap is atomic per key: it succeeds only if the current value equals `expected`
// 3. scan_prefix returns keys in ascending byte order

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use log::debug;

use strata_core::{Result, StrataError};

/// Durable byte store shared by every component on one node
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Atomically replace the value at `key` if it currently equals `expected`
    /// (`None` meaning absent). `new = None` deletes. Returns false on mismatch.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool>;

    fn flush(&self) -> Result<()>;
}

/// Volatile store, used by tests and by nodes configured without a data directory
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool> {
        let mut entries = self.entries.write();
        if entries.get(key).map(Vec::as_slice) != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                entries.insert(key.to_string(), value);
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(true)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Persistent store backed by sled; survives process restart
pub struct SledStore {
    db: sled::Db,
}

fn storage_err(e: sled::Error) -> StrataError {
    StrataError::Storage(e.to_string())
}

impl SledStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).map_err(storage_err)?;
        debug!("Opened durable store at {}", path.display());
        Ok(SledStore { db })
    }

    /// Throwaway store removed when dropped
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open().map_err(storage_err)?;
        Ok(SledStore { db })
    }
}

impl DurableStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self.db.get(key.as_bytes()).map_err(storage_err)?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.db.insert(key.as_bytes(), value).map_err(storage_err)?;
        self.flush()
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db.remove(key.as_bytes()).map_err(storage_err)?;
        self.flush()
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (k, v) = item.map_err(storage_err)?;
            let key = String::from_utf8(k.to_vec())
                .map_err(|e| StrataError::Storage(format!("non-utf8 key: {}", e)))?;
            out.push((key, v.to_vec()));
        }
        Ok(out)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool> {
        let swapped = self
            .db
            .compare_and_swap(key.as_bytes(), expected, new)
            .map_err(storage_err)?
            .is_ok();
        if swapped {
            self.flush()?;
        }
        Ok(swapped)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush().map_err(storage_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn DurableStore) {
        store.put("a/1", b"one".to_vec()).unwrap();
        store.put("a/2", b"two".to_vec()).unwrap();
        store.put("b/1", b"other".to_vec()).unwrap();

        let scanned = store.scan_prefix("a/").unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].0, "a/1");
        assert_eq!(scanned[1].1, b"two".to_vec());

        // CAS with a stale expectation must not write
        assert!(!store.compare_and_swap("a/1", Some(b"stale"), Some(b"x".to_vec())).unwrap());
        assert_eq!(store.get("a/1").unwrap(), Some(b"one".to_vec()));

        assert!(store.compare_and_swap("a/1", Some(b"one"), Some(b"uno".to_vec())).unwrap());
        assert_eq!(store.get("a/1").unwrap(), Some(b"uno".to_vec()));

        // Insert-if-absent
        assert!(store.compare_and_swap("c/1", None, Some(b"new".to_vec())).unwrap());
        assert!(!store.compare_and_swap("c/1", None, Some(b"again".to_vec())).unwrap());

        // CAS delete
        assert!(store.compare_and_swap("c/1", Some(b"new"), None).unwrap());
        assert_eq!(store.get("c/1").unwrap(), None);

        store.delete("a/2").unwrap();
        assert_eq!(store.scan_prefix("a/").unwrap().len(), 1);
    }

    #[test]
    fn test_memory_store_semantics() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_sled_store_semantics() {
        exercise(&SledStore::temporary().unwrap());
    }

    #[test]
    fn test_sled_store_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("strata-sled-{}", uuid::Uuid::new_v4()));
        {
            let store = SledStore::open(&dir).unwrap();
            store.put("checkpoint/1", b"progress".to_vec()).unwrap();
        }
        {
            let store = SledStore::open(&dir).unwrap();
            assert_eq!(store.get("checkpoint/1").unwrap(), Some(b"progress".to_vec()));
        }
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
