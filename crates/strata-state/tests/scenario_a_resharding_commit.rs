// RESHARDING COMMIT TESTS
// End-to-end resharding over an in-process two-shard cluster
//
// Test Categories:
// 1. Readiness Tests - nothing can commit while a participant is unreachable
// 2. Commit Tests - data lands on the shard owning it under the new key
// 3. Idempotency Tests - repeated commit requests after completion

use std::time::Duration;

use strata_core::{Document, Namespace, PartitionKey, ShardId, StrataConfig, StrataError, Value};
use strata_state::{
    ChunkMap, CoordinatorPhase, Decision, IndexSpec, LocalCluster, RecipientState, ReshardingRequest,
};

const WAIT: Duration = Duration::from_secs(10);

fn ns() -> Namespace {
    "reshardingDb.coll".parse().unwrap()
}

fn new_key() -> PartitionKey {
    PartitionKey::single("newKey")
}

fn request() -> ReshardingRequest {
    ReshardingRequest {
        source_ns: ns(),
        new_key: new_key(),
        donors: [ShardId(0), ShardId(1)].into_iter().collect(),
        recipients: [ShardId(0), ShardId(1)].into_iter().collect(),
        chunk_map: ChunkMap::split_at(new_key(), vec![Value::Int(0)], ShardId(0), ShardId(1)).unwrap(),
    }
}

fn config() -> StrataConfig {
    let mut config = StrataConfig::default();
    config.resharding.catchup_interval_ms = 5;
    config.resharding.report_timeout_ms = 5_000;
    config.resharding.retry.initial_backoff_ms = 2;
    config.resharding.retry.max_backoff_ms = 20;
    config
}

/// shard0 holds _id 0..3 with newKey -2..1, shard1 holds _id 100..103 with newKey 2..-1
async fn seeded_cluster() -> LocalCluster {
    let cluster = LocalCluster::start(2, config()).await.unwrap();
    for id in 0..4 {
        cluster.node(ShardId(0)).unwrap().insert(&ns(), Document::new(id).with("newKey", id - 2)).unwrap();
        cluster.node(ShardId(1)).unwrap().insert(&ns(), Document::new(100 + id).with("newKey", 2 - id)).unwrap();
    }
    cluster.replicate();
    cluster
}

fn ids_on(cluster: &LocalCluster, shard: ShardId) -> Vec<i64> {
    cluster.node(shard).unwrap().find_all(&ns()).iter().map(|d| d.id).collect()
}

fn temporary_collections(cluster: &LocalCluster) -> Vec<String> {
    cluster
        .nodes()
        .flat_map(|n| n.collection_names(&ns().db))
        .filter(|c| c.starts_with("system.resharding."))
        .collect()
}

// ============================================================================
// READINESS TESTS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_01_unreachable_donor_blocks_fetch_timestamp_and_commit() {
    let cluster = seeded_cluster().await;
    let service = cluster.service();
    cluster.set_reachable(ShardId(1), false);

    let started = service.reshard_collection(request(), false).await.unwrap();
    assert_eq!(started.phase, CoordinatorPhase::Initializing);

    // Give shard0 time to report everything it can
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = service.coordination_status(&ns()).unwrap().unwrap();
    assert_eq!(status.phase, CoordinatorPhase::Initializing);
    assert_eq!(status.fetch_timestamp, None);

    let refused = service.commit_reshard_collection(&ns()).await;
    assert!(matches!(refused, Err(StrataError::InvalidState(_))));
    let unchanged = service.coordination_status(&ns()).unwrap().unwrap();
    assert_eq!(unchanged.decision, None);

    let waited = service.wait_until_fetch_timestamp(&ns(), Duration::from_millis(100)).await;
    assert!(matches!(waited, Err(StrataError::ParticipantUnreachable(ref pending)) if pending.contains(&ShardId(1))));

    service.abort_reshard_collection(&ns(), "test done").await.unwrap();
    cluster.set_reachable(ShardId(1), true);
    let done = service.wait_for_completion(&ns(), WAIT).await.unwrap();
    assert_eq!(done.phase, CoordinatorPhase::Aborted);
    assert!(temporary_collections(&cluster).is_empty());
}

// ============================================================================
// COMMIT TESTS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_02_commit_after_reconnect_moves_documents_to_new_owners() {
    let cluster = seeded_cluster().await;
    let service = cluster.service();
    cluster.set_reachable(ShardId(1), false);
    let op = service.reshard_collection(request(), false).await.unwrap().operation_id;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(service.coordination_status(&ns()).unwrap().unwrap().fetch_timestamp, None);

    cluster.set_reachable(ShardId(1), true);
    let fetch = service.wait_until_fetch_timestamp(&ns(), WAIT).await.unwrap();
    cluster
        .coordinator()
        .wait_for(op, |d| d.phase == CoordinatorPhase::AwaitingCommit, WAIT)
        .await
        .unwrap();

    // Writes after the fetch timestamp reach the new owners through catch-up
    let node0 = cluster.node(ShardId(0)).unwrap();
    node0.insert(&ns(), Document::new(10).with("newKey", 5)).unwrap();
    node0.update(&ns(), Document::new(0).with("newKey", 7)).unwrap();
    cluster.node(ShardId(1)).unwrap().delete(&ns(), 101).unwrap();
    cluster.replicate();

    let committed = service.commit_reshard_collection(&ns()).await.unwrap();
    assert_eq!(committed.decision, Some(Decision::Commit));
    assert_eq!(committed.fetch_timestamp, Some(fetch));

    let done = service.wait_for_completion(&ns(), WAIT).await.unwrap();
    assert_eq!(done.phase, CoordinatorPhase::Committed);
    assert_eq!(done.fetch_timestamp, Some(fetch));

    assert_eq!(ids_on(&cluster, ShardId(0)), vec![1, 103]);
    assert_eq!(ids_on(&cluster, ShardId(1)), vec![0, 2, 3, 10, 100, 102]);
    assert_eq!(
        cluster.node(ShardId(1)).unwrap().find(&ns(), 0).unwrap().get("newKey"),
        Value::Int(7)
    );
    assert!(temporary_collections(&cluster).is_empty());

    let index = IndexSpec::default_name(&new_key());
    for node in cluster.nodes() {
        assert!(node.list_indexes(&ns()).iter().any(|s| s.name == index));
        let state = cluster.host(node.shard_id()).unwrap().recipient_state(op).unwrap().unwrap();
        assert_eq!(state.state, RecipientState::Done);
        assert_eq!(state.decision, Some(Decision::Commit));
    }

    let routing = cluster.routing().get(&ns()).unwrap();
    assert_eq!(routing.chunk_map, request().chunk_map);
    assert_eq!(routing.chunk_map.key(), &new_key());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_03_auto_commit_waits_for_catch_up() {
    let cluster = seeded_cluster().await;
    let done = cluster.service().reshard_collection(request(), true).await.unwrap();
    assert_eq!(done.phase, CoordinatorPhase::Committed);
    assert!(done.fetch_timestamp.is_some());

    let total: usize = cluster.nodes().map(|n| n.count(&ns())).sum();
    assert_eq!(total, 8);
    for node in cluster.nodes() {
        for doc in node.find_all(&ns()) {
            assert_eq!(request().chunk_map.owner_of(&doc), Some(node.shard_id()));
        }
    }
}

// ============================================================================
// IDEMPOTENCY TESTS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_04_repeated_commit_after_completion_succeeds() {
    let cluster = seeded_cluster().await;
    let service = cluster.service();
    let first = service.reshard_collection(request(), true).await.unwrap();
    let version = cluster.routing().get(&ns()).unwrap().version;

    let again = service.commit_reshard_collection(&ns()).await.unwrap();
    assert_eq!(again.operation_id, first.operation_id);
    assert_eq!(again.phase, CoordinatorPhase::Committed);
    assert_eq!(cluster.routing().get(&ns()).unwrap().version, version);

    let aborted = service.abort_reshard_collection(&ns(), "too late").await;
    assert!(matches!(aborted, Err(StrataError::InvalidState(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_05_commit_without_operation_is_not_found() {
    let cluster = LocalCluster::start(2, config()).await.unwrap();
    let missing = cluster.service().commit_reshard_collection(&ns()).await;
    assert!(matches!(missing, Err(StrataError::NotFound(_))));
    assert!(cluster.service().coordination_status(&ns()).unwrap().is_none());
}
