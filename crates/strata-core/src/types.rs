// CORE IDENTIFIERS
// Shard, namespace, logical time and operation identities shared by every role
//
// INVARIANTS:
// 1. Timestamps are totally ordered (seconds, then increment)
// 2. Operation and build identifiers are globally unique (UUID v4)
// 3. Namespaces always carry a non-empty database and collection name

use serde::{Serialize, Deserialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::StrataError;

/// ShardId uniquely identifies a shard (replica set) in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct ShardId(pub u64);

impl ShardId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard{}", self.0)
    }
}

/// Logical cluster time.
///
/// Ordered first by `secs`, then by `inc`, which is exactly the derived order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash, Default)]
pub struct Timestamp {
    pub secs: u32,
    pub inc: u32,
}

impl Timestamp {
    pub const MIN: Timestamp = Timestamp { secs: 0, inc: 0 };

    pub fn new(secs: u32, inc: u32) -> Self {
        Timestamp { secs, inc }
    }

    /// The smallest timestamp strictly greater than `self`
    pub fn next(&self) -> Self {
        match self.inc.checked_add(1) {
            Some(inc) => Timestamp { secs: self.secs, inc },
            None => Timestamp { secs: self.secs.saturating_add(1), inc: 0 },
        }
    }

    pub fn is_null(&self) -> bool {
        *self == Timestamp::MIN
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

/// Database + collection name, rendered as `db.coll`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Result<Self, StrataError> {
        let db = db.into();
        let coll = coll.into();
        if db.is_empty() || coll.is_empty() {
            return Err(StrataError::InvalidNamespace(format!("{}.{}", db, coll)));
        }
        if db.contains('.') {
            return Err(StrataError::InvalidNamespace(format!("{}.{}", db, coll)));
        }
        Ok(Namespace { db, coll })
    }

    /// Temporary collection a recipient clones into for one resharding operation
    pub fn temporary_resharding(&self, source_uuid: Uuid) -> Namespace {
        Namespace {
            db: self.db.clone(),
            coll: format!("system.resharding.{}", source_uuid),
        }
    }

    pub fn is_temporary_resharding(&self) -> bool {
        self.coll.starts_with("system.resharding.")
    }
}

impl FromStr for Namespace {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((db, coll)) => Namespace::new(db, coll),
            None => Err(StrataError::InvalidNamespace(s.to_string())),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Identity of one resharding operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct OperationId(pub Uuid);

impl OperationId {
    pub fn generate() -> Self {
        OperationId(Uuid::new_v4())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one index build
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct BuildId(pub Uuid);

impl BuildId {
    pub fn generate() -> Self {
        BuildId(Uuid::new_v4())
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_ordering() {
        assert!(Timestamp::new(1, 5) < Timestamp::new(2, 0));
        assert!(Timestamp::new(2, 0) < Timestamp::new(2, 1));
        assert_eq!(Timestamp::new(3, 9).next(), Timestamp::new(3, 10));
        assert_eq!(Timestamp::new(3, u32::MAX).next(), Timestamp::new(4, 0));
    }

    #[test]
    fn test_namespace_parse() {
        let ns: Namespace = "reshardingDb.coll".parse().unwrap();
        assert_eq!(ns.db, "reshardingDb");
        assert_eq!(ns.coll, "coll");
        assert_eq!(ns.to_string(), "reshardingDb.coll");

        // Collection names may themselves contain dots
        let ns: Namespace = "db.system.views".parse().unwrap();
        assert_eq!(ns.coll, "system.views");

        assert!("nodot".parse::<Namespace>().is_err());
        assert!(".coll".parse::<Namespace>().is_err());
    }

    #[test]
    fn test_temporary_namespace() {
        let ns: Namespace = "db.coll".parse().unwrap();
        let tmp = ns.temporary_resharding(Uuid::nil());
        assert!(tmp.is_temporary_resharding());
        assert_eq!(tmp.db, "db");
        assert!(!ns.is_temporary_resharding());
    }
}
