// OPERATION LOG
// Ordered record of every write applied on a shard, with before/after images
//
// SAFETY INVARIANTS:
// 1. Entry timestamps are strictly increasing
// 2. The issuing clock never moves backwards, not even across a rollback
// 3. The majority commit point never exceeds the last applied timestamp
// 4. Entries at or before the majority commit point are never truncated

use serde::{Serialize, Deserialize};

use strata_core::{Document, Namespace, Result, StrataError, Timestamp};
use crate::index_key::IndexSpec;

/// Operation recorded in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OplogOp {
    CreateCollection { uuid: uuid::Uuid },
    Insert { doc: Document },
    Update { before: Document, after: Document },
    Delete { before: Document },
    DropCollection,
    RenameCollection { to: Namespace, drop_target: bool },
    DropDatabase,
    CreateIndex { spec: IndexSpec },
}

impl OplogOp {
    /// Document images of a CRUD op, `(before, after)`
    pub fn images(&self) -> Option<(Option<&Document>, Option<&Document>)> {
        match self {
            OplogOp::Insert { doc } => Some((None, Some(doc))),
            OplogOp::Update { before, after } => Some((Some(before), Some(after))),
            OplogOp::Delete { before } => Some((Some(before), None)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub ts: Timestamp,
    pub ns: Namespace,
    pub op: OplogOp,
}

/// In-memory replicated log of one shard
#[derive(Debug, Clone)]
pub struct Oplog {
    entries: Vec<OplogEntry>,
    clock: Timestamp,
    majority_point: Timestamp,
}

impl Default for Oplog {
    fn default() -> Self {
        Oplog {
            entries: Vec::new(),
            clock: Timestamp::new(1, 0),
            majority_point: Timestamp::MIN,
        }
    }
}

impl Oplog {
    pub fn new() -> Self {
        Oplog::default()
    }

    /// Issue the next timestamp and append the entry
    pub fn append(&mut self, ns: Namespace, op: OplogOp) -> Timestamp {
        self.clock = self.clock.next();
        let ts = self.clock;
        self.entries.push(OplogEntry { ts, ns, op });
        ts
    }

    /// Advance the issuing clock past a timestamp observed from another node
    pub fn observe_cluster_time(&mut self, ts: Timestamp) {
        if ts > self.clock {
            self.clock = ts;
        }
    }

    /// Timestamp of the newest surviving entry
    pub fn last_applied(&self) -> Timestamp {
        self.entries.last().map(|e| e.ts).unwrap_or(Timestamp::MIN)
    }

    pub fn majority_commit_point(&self) -> Timestamp {
        self.majority_point
    }

    /// Move the majority commit point forward (clamped to the last applied entry)
    pub fn advance_majority_to(&mut self, ts: Timestamp) {
        let target = ts.min(self.last_applied());
        if target > self.majority_point {
            self.majority_point = target;
        }
    }

    pub fn entries(&self) -> &[OplogEntry] {
        &self.entries
    }

    /// Entries with `ts > after`, at most `limit`
    pub fn entries_after(&self, after: Timestamp, limit: usize) -> Vec<OplogEntry> {
        let start = self.entries.partition_point(|e| e.ts <= after);
        self.entries[start..].iter().take(limit).cloned().collect()
    }

    /// Drop every entry after `point`; returns the removed entries
    pub fn truncate_after(&mut self, point: Timestamp) -> Result<Vec<OplogEntry>> {
        if point < self.majority_point {
            return Err(StrataError::InvalidState(format!(
                "cannot roll back to {} behind majority commit point {}",
                point, self.majority_point
            )));
        }
        let keep = self.entries.partition_point(|e| e.ts <= point);
        Ok(self.entries.split_off(keep))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        "test.coll".parse().unwrap()
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let mut log = Oplog::new();
        let a = log.append(ns(), OplogOp::Insert { doc: Document::new(1) });
        let b = log.append(ns(), OplogOp::Insert { doc: Document::new(2) });
        assert!(a < b);
        assert_eq!(log.last_applied(), b);
        assert_eq!(log.entries_after(a, 10).len(), 1);
        assert_eq!(log.entries_after(Timestamp::MIN, 1).len(), 1);
    }

    #[test]
    fn test_observed_cluster_time_orders_later_writes() {
        let mut log = Oplog::new();
        log.observe_cluster_time(Timestamp::new(50, 3));
        let ts = log.append(ns(), OplogOp::Insert { doc: Document::new(1) });
        assert!(ts > Timestamp::new(50, 3));

        // Observing an older time is a no-op
        log.observe_cluster_time(Timestamp::new(2, 0));
        assert!(log.append(ns(), OplogOp::Insert { doc: Document::new(2) }) > ts);
    }

    #[test]
    fn test_majority_point_is_clamped() {
        let mut log = Oplog::new();
        let a = log.append(ns(), OplogOp::Insert { doc: Document::new(1) });
        log.advance_majority_to(Timestamp::new(999, 0));
        assert_eq!(log.majority_commit_point(), a);

        // Never moves backwards
        log.advance_majority_to(Timestamp::MIN);
        assert_eq!(log.majority_commit_point(), a);
    }

    #[test]
    fn test_truncate_respects_majority_and_clock() {
        let mut log = Oplog::new();
        let a = log.append(ns(), OplogOp::Insert { doc: Document::new(1) });
        let b = log.append(ns(), OplogOp::Insert { doc: Document::new(2) });
        log.advance_majority_to(a);

        assert!(log.truncate_after(Timestamp::MIN).is_err());
        let removed = log.truncate_after(a).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(log.last_applied(), a);

        // The clock keeps moving forward past the discarded entry
        let c = log.append(ns(), OplogOp::Insert { doc: Document::new(3) });
        assert!(c > b);
    }
}
