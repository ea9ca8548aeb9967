// ROUTING METADATA
// Chunk ranges over a partition key and the routing table that consumes
// the mapping published when a resharding operation commits
//
// SAFETY INVARIANTS:
// 1. A chunk map covers MinKey..MaxKey with no gaps and no overlaps
// 2. Every key is owned by exactly one shard
// 3. Routing versions strictly increase per namespace

use parking_lot::RwLock;
use serde::{Serialize, Deserialize};
use std::collections::{BTreeMap, BTreeSet};
use log::info;

use strata_core::{Document, Namespace, OperationId, PartitionKey, Result, ShardId, StrataError, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    /// Inclusive lower bound
    pub min: Vec<Value>,
    /// Exclusive upper bound
    pub max: Vec<Value>,
    pub shard: ShardId,
}

impl ChunkRange {
    pub fn new(min: Vec<Value>, max: Vec<Value>, shard: ShardId) -> Self {
        ChunkRange { min, max, shard }
    }

    pub fn contains(&self, key: &[Value]) -> bool {
        self.min.as_slice() <= key && key < self.max.as_slice()
    }
}

fn global_min(width: usize) -> Vec<Value> {
    vec![Value::MinKey; width]
}

fn global_max(width: usize) -> Vec<Value> {
    vec![Value::MaxKey; width]
}

/// Validated partition-to-shard mapping for one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMap {
    key: PartitionKey,
    chunks: Vec<ChunkRange>,
}

impl ChunkMap {
    pub fn new(key: PartitionKey, mut chunks: Vec<ChunkRange>) -> Result<Self> {
        let width = key.fields.len();
        if width == 0 {
            return Err(StrataError::InvalidState("partition key has no fields".to_string()));
        }
        if chunks.is_empty() {
            return Err(StrataError::InvalidState("chunk map is empty".to_string()));
        }
        chunks.sort_by(|a, b| a.min.cmp(&b.min));

        for chunk in &chunks {
            if chunk.min.len() != width || chunk.max.len() != width {
                return Err(StrataError::InvalidState(format!(
                    "chunk bounds must have {} components for key {}",
                    width, key
                )));
            }
            if chunk.min >= chunk.max {
                return Err(StrataError::InvalidState(format!(
                    "empty chunk [{:?}, {:?}) on {}",
                    chunk.min, chunk.max, chunk.shard
                )));
            }
        }
        if chunks[0].min != global_min(width) || chunks[chunks.len() - 1].max != global_max(width) {
            return Err(StrataError::InvalidState(
                "chunks must cover MinKey to MaxKey".to_string(),
            ));
        }
        for pair in chunks.windows(2) {
            if pair[0].max != pair[1].min {
                return Err(StrataError::InvalidState(format!(
                    "gap or overlap between {:?} and {:?}",
                    pair[0].max, pair[1].min
                )));
            }
        }
        Ok(ChunkMap { key, chunks })
    }

    /// One chunk owning the whole key space
    pub fn single(key: PartitionKey, shard: ShardId) -> Self {
        let width = key.fields.len();
        ChunkMap { chunks: vec![ChunkRange::new(global_min(width), global_max(width), shard)], key }
    }

    /// Two chunks split at `split`: `[MinKey, split)` and `[split, MaxKey)`
    pub fn split_at(key: PartitionKey, split: Vec<Value>, low: ShardId, high: ShardId) -> Result<Self> {
        let width = key.fields.len();
        ChunkMap::new(
            key,
            vec![
                ChunkRange::new(global_min(width), split.clone(), low),
                ChunkRange::new(split, global_max(width), high),
            ],
        )
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn chunks(&self) -> &[ChunkRange] {
        &self.chunks
    }

    pub fn shards(&self) -> BTreeSet<ShardId> {
        self.chunks.iter().map(|c| c.shard).collect()
    }

    pub fn owner_of_key(&self, key: &[Value]) -> Option<ShardId> {
        let idx = self.chunks.partition_point(|c| c.min.as_slice() <= key);
        idx.checked_sub(1)
            .map(|i| &self.chunks[i])
            .filter(|c| c.contains(key))
            .map(|c| c.shard)
    }

    pub fn owner_of(&self, doc: &Document) -> Option<ShardId> {
        self.owner_of_key(&self.key.extract(doc))
    }

    /// Same ranges over a key extended with extra suffix fields
    pub fn refine(&self, new_key: PartitionKey) -> Result<ChunkMap> {
        if !self.key.is_prefix_of(&new_key) || self.key == new_key {
            return Err(StrataError::InvalidState(format!(
                "{} does not extend the current key {}",
                new_key, self.key
            )));
        }
        let old_width = self.key.fields.len();
        let extra = new_key.fields.len() - old_width;
        let extend = |bound: &Vec<Value>| {
            let fill = if *bound == global_max(old_width) { Value::MaxKey } else { Value::MinKey };
            let mut out = bound.clone();
            out.extend(std::iter::repeat(fill).take(extra));
            out
        };
        let chunks = self
            .chunks
            .iter()
            .map(|c| ChunkRange::new(extend(&c.min), extend(&c.max), c.shard))
            .collect();
        ChunkMap::new(new_key, chunks)
    }
}

/// Final partition-to-shard mapping emitted on commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTableUpdate {
    pub ns: Namespace,
    pub chunk_map: ChunkMap,
    pub operation_id: Option<OperationId>,
}

/// Consumer of committed routing changes
pub trait RoutingSink: Send + Sync {
    /// Install the mapping; returns the new routing version
    fn apply_update(&self, update: RoutingTableUpdate) -> Result<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub chunk_map: ChunkMap,
    pub version: u64,
    /// Resharding operation that installed this mapping, if any
    pub installed_by: Option<OperationId>,
}

#[derive(Default)]
pub struct InMemoryRoutingTable {
    entries: RwLock<BTreeMap<Namespace, RoutingEntry>>,
}

impl InMemoryRoutingTable {
    pub fn new() -> Self {
        InMemoryRoutingTable::default()
    }

    pub fn register(&self, ns: Namespace, chunk_map: ChunkMap) -> u64 {
        self.install(ns, chunk_map, None)
    }

    fn install(&self, ns: Namespace, chunk_map: ChunkMap, installed_by: Option<OperationId>) -> u64 {
        let mut entries = self.entries.write();
        let version = entries.get(&ns).map_or(1, |e| e.version + 1);
        entries.insert(ns, RoutingEntry { chunk_map, version, installed_by });
        version
    }

    pub fn get(&self, ns: &Namespace) -> Option<RoutingEntry> {
        self.entries.read().get(ns).cloned()
    }

    /// Extend the partition key of `ns` with suffix fields, keeping chunk placement
    pub fn refine_partition_key(&self, ns: &Namespace, new_key: PartitionKey) -> Result<u64> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(ns)
            .ok_or_else(|| StrataError::NotFound(format!("routing entry for {}", ns)))?;
        let refined = entry.chunk_map.refine(new_key)?;
        info!("Refined partition key of {} to {}", ns, refined.key());
        entry.chunk_map = refined;
        entry.version += 1;
        entry.installed_by = None;
        Ok(entry.version)
    }
}

impl RoutingSink for InMemoryRoutingTable {
    /// Re-applying the update of an operation that already installed it is a no-op
    fn apply_update(&self, update: RoutingTableUpdate) -> Result<u64> {
        if let Some(op) = update.operation_id {
            if let Some(entry) = self.get(&update.ns).filter(|e| e.installed_by == Some(op)) {
                return Ok(entry.version);
            }
        }
        let key = update.chunk_map.key().clone();
        let version = self.install(update.ns.clone(), update.chunk_map, update.operation_id);
        info!("Routing for {} now on key {} at version {}", update.ns, key, version);
        Ok(version)
    }
}
