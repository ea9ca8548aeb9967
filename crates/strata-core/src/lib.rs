// === Identifiers & Logical Time ===
pub mod types;

// === Document Model ===
pub mod document;

// === Errors & Configuration ===
pub mod error;
pub mod config;

// === Re-exports for broader ecosystem access ===
pub use types::{BuildId, Namespace, OperationId, ShardId, Timestamp};
pub use document::{Document, PartitionKey, Value};
pub use error::{Result, StrataError};
pub use config::{IndexBuildConfig, ReshardingConfig, RetryPolicy, StorageConfig, StrataConfig};
