// ERROR TAXONOMY
//
// Propagation policy:
// 1. ParticipantUnreachable is transient: retried with backoff, never aborts an operation
// 2. ConstraintViolation is fatal to an index build and forces the owning operation to abort
// 3. RollbackDiscontinuity is absorbed by the rollback adapter; it only escapes when a caller
//    asks for a specific checkpoint that no longer exists

use thiserror::Error;

use crate::types::{Namespace, ShardId};

#[derive(Debug, Error)]
pub enum StrataError {
    #[error("A resharding operation is already in progress for {0}")]
    AlreadyInProgress(Namespace),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Participants unreachable: {}", format_shards(.0))]
    ParticipantUnreachable(Vec<ShardId>),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Rollback discontinuity: {0}")]
    RollbackDiscontinuity(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation aborted: {0}")]
    Aborted(String),

    #[error("Interrupted: {0}")]
    Interrupted(String),
}

fn format_shards(shards: &[ShardId]) -> String {
    shards.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

impl StrataError {
    /// Transient errors are retried with backoff instead of failing the operation
    pub fn is_transient(&self) -> bool {
        matches!(self, StrataError::ParticipantUnreachable(_))
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        StrataError::InvalidState(msg.into())
    }
}

impl From<config::ConfigError> for StrataError {
    fn from(e: config::ConfigError) -> Self {
        StrataError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;
