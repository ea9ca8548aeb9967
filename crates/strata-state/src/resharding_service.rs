// RESHARDING SERVICE
// Namespace-level entry points: reshard, commit, abort and status

use std::sync::Arc;
use std::time::Duration;
use log::{info, warn};

use strata_core::{Namespace, Result, StrataError, Timestamp};
use crate::resharding_coordinator::ReshardingCoordinator;
use crate::resharding_document::{CoordinationDocument, CoordinationStatus, CoordinatorPhase, Decision, ReshardingRequest};

#[derive(Clone)]
pub struct ReshardingService {
    coordinator: Arc<ReshardingCoordinator>,
}

impl ReshardingService {
    pub fn new(coordinator: Arc<ReshardingCoordinator>) -> Self {
        ReshardingService { coordinator }
    }

    /// Start resharding `request.source_ns`.
    ///
    /// With `auto_commit` the call waits until the operation can commit, commits it and
    /// returns the finished document; otherwise it returns as soon as the operation is registered.
    pub async fn reshard_collection(&self, request: ReshardingRequest, auto_commit: bool) -> Result<CoordinationDocument> {
        let doc = self.coordinator.start_operation(request).await?;
        if !auto_commit {
            return Ok(doc);
        }
        let operation_id = doc.operation_id;
        let timeout = self.coordinator.config().report_timeout();
        loop {
            let ready = self
                .coordinator
                .wait_for(
                    operation_id,
                    |d| d.phase == CoordinatorPhase::AwaitingCommit || !d.phase.is_undecided(),
                    timeout,
                )
                .await;
            match ready {
                Ok(d) if d.decision == Some(Decision::Abort) => {
                    return Err(StrataError::Aborted(
                        d.abort_reason.unwrap_or_else(|| format!("resharding {} aborted", operation_id)),
                    ))
                }
                Ok(_) => break,
                Err(e) if e.is_transient() => warn!("Resharding {} still waiting: {}", operation_id, e),
                Err(e) => return Err(e),
            }
        }
        self.coordinator.commit(operation_id).await?;
        self.wait_for_completion(&doc.source_ns, timeout).await
    }

    /// Commit the operation on `ns`; repeating a successful commit is not an error
    pub async fn commit_reshard_collection(&self, ns: &Namespace) -> Result<CoordinationDocument> {
        if let Some(active) = self.active(ns)? {
            return self.coordinator.commit(active.operation_id).await;
        }
        match self.coordinator.find_by_namespace(ns)? {
            Some(done) if done.decision == Some(Decision::Commit) => {
                info!("Resharding {} of {} was already committed", done.operation_id, ns);
                Ok(done)
            }
            Some(done) => Err(StrataError::InvalidState(format!(
                "resharding {} of {} ended in {:?}",
                done.operation_id, ns, done.phase
            ))),
            None => Err(StrataError::NotFound(format!("resharding operation for {}", ns))),
        }
    }

    pub async fn abort_reshard_collection(&self, ns: &Namespace, reason: &str) -> Result<CoordinationDocument> {
        if let Some(active) = self.active(ns)? {
            return self.coordinator.abort(active.operation_id, reason).await;
        }
        match self.coordinator.find_by_namespace(ns)? {
            Some(done) if done.decision == Some(Decision::Abort) => Ok(done),
            Some(done) => Err(StrataError::InvalidState(format!(
                "resharding {} of {} already committed",
                done.operation_id, ns
            ))),
            None => Err(StrataError::NotFound(format!("resharding operation for {}", ns))),
        }
    }

    /// Status of the active operation on `ns`, or of the last finished one
    pub fn coordination_status(&self, ns: &Namespace) -> Result<Option<CoordinationStatus>> {
        Ok(self.coordinator.find_by_namespace(ns)?.map(|d| d.status()))
    }

    /// Wait for the fetch timestamp of the active operation on `ns`
    pub async fn wait_until_fetch_timestamp(&self, ns: &Namespace, timeout: Duration) -> Result<Timestamp> {
        let active = self
            .active(ns)?
            .ok_or_else(|| StrataError::NotFound(format!("active resharding operation for {}", ns)))?;
        let doc = self
            .coordinator
            .wait_for(active.operation_id, |d| d.fetch_timestamp.is_some() || d.decision.is_some(), timeout)
            .await?;
        doc.fetch_timestamp.ok_or_else(|| {
            StrataError::Aborted(format!("resharding {} aborted before choosing a fetch timestamp", doc.operation_id))
        })
    }

    /// Wait until the operation on `ns` reaches Committed or Aborted
    pub async fn wait_for_completion(&self, ns: &Namespace, timeout: Duration) -> Result<CoordinationDocument> {
        let doc = match self.active(ns)? {
            Some(active) => active,
            None => {
                return self
                    .coordinator
                    .find_by_namespace(ns)?
                    .ok_or_else(|| StrataError::NotFound(format!("resharding operation for {}", ns)))
            }
        };
        self.coordinator
            .wait_for(doc.operation_id, |d| d.phase.is_terminal(), timeout)
            .await
    }

    /// Not yet archived; a terminal document here is still installing routing
    fn active(&self, ns: &Namespace) -> Result<Option<CoordinationDocument>> {
        self.coordinator.find_active(ns)
    }
}
