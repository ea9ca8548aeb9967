// CHECKPOINT STORE
// Typed, integrity-sealed records on top of a DurableStore
//
// SAFETY INVARIANTS:
// 1. Every record is stored with the SHA-256 digest of its payload
// 2. A record whose digest does not match is never returned (Storage error instead)
// 3. compare_and_swap_record only succeeds against the exact bytes previously read

use serde::{Serialize, Deserialize};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use log::error;

use strata_core::{Result, StrataError};
use crate::durable_store::DurableStore;

/// On-disk envelope for every typed record
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedRecord {
    digest: String,
    payload: Vec<u8>,
}

impl SealedRecord {
    fn seal(payload: Vec<u8>) -> Self {
        SealedRecord { digest: Self::compute_digest(&payload), payload }
    }

    fn compute_digest(payload: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(payload);
        hex::encode(hasher.finalize())
    }

    fn verify(&self) -> bool {
        Self::compute_digest(&self.payload) == self.digest
    }
}

/// A record read together with the raw bytes it was decoded from.
///
/// The raw bytes are the compare-and-swap token for a later update.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    raw: Vec<u8>,
}

fn codec_err(e: bincode::Error) -> StrataError {
    StrataError::Codec(e.to_string())
}

/// Durable record of long-running operation progress
#[derive(Clone)]
pub struct CheckpointStore {
    inner: Arc<dyn DurableStore>,
}

impl CheckpointStore {
    pub fn new(inner: Arc<dyn DurableStore>) -> Self {
        CheckpointStore { inner }
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        let payload = bincode::serialize(value).map_err(codec_err)?;
        bincode::serialize(&SealedRecord::seal(payload)).map_err(codec_err)
    }

    fn decode<T: DeserializeOwned>(key: &str, raw: &[u8]) -> Result<T> {
        let sealed: SealedRecord = bincode::deserialize(raw).map_err(codec_err)?;
        if !sealed.verify() {
            error!("Record {} failed integrity check", key);
            return Err(StrataError::Storage(format!("digest mismatch for record {}", key)));
        }
        bincode::deserialize(&sealed.payload).map_err(codec_err)
    }

    pub fn put_record<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.inner.put(key, Self::encode(value)?)
    }

    pub fn get_record<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.inner.get(key)? {
            Some(raw) => Ok(Some(Self::decode(key, &raw)?)),
            None => Ok(None),
        }
    }

    pub fn get_versioned<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Versioned<T>>> {
        match self.inner.get(key)? {
            Some(raw) => {
                let value = Self::decode(key, &raw)?;
                Ok(Some(Versioned { value, raw }))
            }
            None => Ok(None),
        }
    }

    /// Insert `value` only if `key` is absent
    pub fn insert_new_record<T: Serialize>(&self, key: &str, value: &T) -> Result<bool> {
        self.inner.compare_and_swap(key, None, Some(Self::encode(value)?))
    }

    /// Replace the record previously read as `current`; `None` deletes it
    pub fn compare_and_swap_record<T: Serialize>(
        &self,
        key: &str,
        current: &Versioned<T>,
        new: Option<&T>,
    ) -> Result<bool> {
        let encoded = match new {
            Some(value) => Some(Self::encode(value)?),
            None => None,
        };
        self.inner.compare_and_swap(key, Some(current.raw.as_slice()), encoded)
    }

    pub fn delete_record(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }

    /// Typed scan; records are returned in key order
    pub fn scan_records<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(String, T)>> {
        self.inner
            .scan_prefix(prefix)?
            .into_iter()
            .map(|(key, raw)| {
                let value = Self::decode(&key, &raw)?;
                Ok((key, value))
            })
            .collect()
    }

    pub fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.inner.scan_prefix(prefix)?.into_iter().map(|(k, _)| k).collect())
    }

    pub fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.scan_keys(prefix)?;
        for key in &keys {
            self.inner.delete(key)?;
        }
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable_store::MemoryStore;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Progress {
        cursor: i64,
        runs: Vec<u64>,
    }

    #[test]
    fn test_typed_round_trip_and_scan_order() {
        let store = CheckpointStore::new(Arc::new(MemoryStore::new()));
        store.put_record("p/2", &Progress { cursor: 20, runs: vec![1, 2] }).unwrap();
        store.put_record("p/1", &Progress { cursor: 10, runs: vec![1] }).unwrap();

        let loaded: Option<Progress> = store.get_record("p/1").unwrap();
        assert_eq!(loaded.unwrap().cursor, 10);

        let all: Vec<(String, Progress)> = store.scan_records("p/").unwrap();
        assert_eq!(all.iter().map(|(_, p)| p.cursor).collect::<Vec<_>>(), vec![10, 20]);
    }

    #[test]
    fn test_corrupted_record_is_rejected() {
        let raw = Arc::new(MemoryStore::new());
        let store = CheckpointStore::new(raw.clone());
        store.put_record("p/1", &Progress { cursor: 1, runs: vec![] }).unwrap();

        let tampered = bincode::serialize(&SealedRecord {
            digest: "00".repeat(32),
            payload: bincode::serialize(&Progress { cursor: 99, runs: vec![] }).unwrap(),
        })
        .unwrap();
        raw.put("p/1", tampered).unwrap();

        let result: Result<Option<Progress>> = store.get_record("p/1");
        assert!(matches!(result, Err(StrataError::Storage(_))));
    }

    #[test]
    fn test_versioned_compare_and_swap() {
        let store = CheckpointStore::new(Arc::new(MemoryStore::new()));
        assert!(store.insert_new_record("doc", &Progress { cursor: 0, runs: vec![] }).unwrap());
        assert!(!store.insert_new_record("doc", &Progress { cursor: 5, runs: vec![] }).unwrap());

        let first: Versioned<Progress> = store.get_versioned("doc").unwrap().unwrap();
        let stale = first.clone();

        let next = Progress { cursor: 1, runs: vec![] };
        assert!(store.compare_and_swap_record("doc", &first, Some(&next)).unwrap());

        // A writer holding the old version loses
        let conflicting = Progress { cursor: 2, runs: vec![] };
        assert!(!store.compare_and_swap_record("doc", &stale, Some(&conflicting)).unwrap());

        let current: Progress = store.get_record("doc").unwrap().unwrap();
        assert_eq!(current, next);
    }
}
