// DOCUMENT MODEL
// Minimal ordered value model used by collections, partition keys and index keys

use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::fmt;

/// Field value.
///
/// Variant order defines the comparison order: `MinKey < Null < Int < Str < MaxKey`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub enum Value {
    MinKey,
    Null,
    Int(i64),
    Str(String),
    MaxKey,
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::MinKey => write!(f, "MinKey"),
            Value::Null => write!(f, "null"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{:?}", v),
            Value::MaxKey => write!(f, "MaxKey"),
        }
    }
}

/// A stored document, addressed by its integer `_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub fields: BTreeMap<String, Value>,
}

impl Document {
    pub fn new(id: i64) -> Self {
        Document { id, fields: BTreeMap::new() }
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    /// Field lookup; `_id` resolves to the document id and missing fields to `Null`
    pub fn get(&self, field: &str) -> Value {
        if field == "_id" {
            return Value::Int(self.id);
        }
        self.fields.get(field).cloned().unwrap_or(Value::Null)
    }
}

/// Ordered list of fields that partitions (or indexes) a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct PartitionKey {
    pub fields: Vec<String>,
}

impl PartitionKey {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PartitionKey { fields: fields.into_iter().map(Into::into).collect() }
    }

    pub fn single(field: &str) -> Self {
        PartitionKey { fields: vec![field.to_string()] }
    }

    /// Key values of `doc` in field order
    pub fn extract(&self, doc: &Document) -> Vec<Value> {
        self.fields.iter().map(|f| doc.get(f)).collect()
    }

    /// True if `other` starts with every field of `self`, in order
    pub fn is_prefix_of(&self, other: &PartitionKey) -> bool {
        self.fields.len() <= other.fields.len()
            && self.fields.iter().zip(other.fields.iter()).all(|(a, b)| a == b)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.fields.iter().map(|k| format!("{}: 1", k)).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_ordering_brackets_everything() {
        let values = vec![
            Value::MaxKey,
            Value::Str("a".into()),
            Value::Int(-5),
            Value::Null,
            Value::MinKey,
        ];
        let mut sorted = values.clone();
        sorted.sort();
        assert_eq!(sorted.first(), Some(&Value::MinKey));
        assert_eq!(sorted.last(), Some(&Value::MaxKey));
        assert!(Value::Int(i64::MAX) < Value::Str(String::new()));
    }

    #[test]
    fn test_document_field_lookup() {
        let doc = Document::new(7).with("a", 3).with("b", "x");
        assert_eq!(doc.get("_id"), Value::Int(7));
        assert_eq!(doc.get("a"), Value::Int(3));
        assert_eq!(doc.get("missing"), Value::Null);
    }

    #[test]
    fn test_partition_key_prefix() {
        let old = PartitionKey::single("oldKey");
        let refined = PartitionKey::new(["oldKey", "suffix"]);
        assert!(old.is_prefix_of(&refined));
        assert!(!refined.is_prefix_of(&old));
        assert!(!PartitionKey::single("newKey").is_prefix_of(&refined));
        assert_eq!(refined.to_string(), "{oldKey: 1, suffix: 1}");
    }
}
