// LOCAL CLUSTER
// A coordinator, its routing table and N shard nodes wired together in-process,
// with a background replication tick that advances every node's majority point

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use log::info;

use strata_core::{Result, ShardId, StrataConfig};
use crate::checkpoint_store::CheckpointStore;
use crate::durable_store::{DurableStore, MemoryStore, SledStore};
use crate::resharding_coordinator::ReshardingCoordinator;
use crate::resharding_document::CoordinationStore;
use crate::resharding_participant::ParticipantHost;
use crate::resharding_service::ReshardingService;
use crate::routing::InMemoryRoutingTable;
use crate::shard_node::ShardNode;
use crate::transport::{CoordinatorHandle, LocalNetwork};

fn open_store(data_dir: Option<&Path>, name: &str) -> Result<CheckpointStore> {
    let inner: Arc<dyn DurableStore> = match data_dir {
        Some(dir) => Arc::new(SledStore::open(&dir.join(name))?),
        None => Arc::new(MemoryStore::new()),
    };
    Ok(CheckpointStore::new(inner))
}

pub struct LocalCluster {
    nodes: BTreeMap<ShardId, Arc<ShardNode>>,
    hosts: BTreeMap<ShardId, Arc<ParticipantHost>>,
    network: Arc<LocalNetwork>,
    coordinator: Arc<ReshardingCoordinator>,
    routing: Arc<InMemoryRoutingTable>,
    config: StrataConfig,
    tasks: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl LocalCluster {
    /// Start `shards` nodes named shard0..shardN-1; must run inside a Tokio runtime
    pub async fn start(shards: u64, config: StrataConfig) -> Result<Self> {
        config.validate()?;
        let data_dir = config.storage.data_dir.clone();
        let network = Arc::new(LocalNetwork::new());
        let routing = Arc::new(InMemoryRoutingTable::new());
        let coordinator = Arc::new(ReshardingCoordinator::new(
            CoordinationStore::new(open_store(data_dir.as_deref(), "config")?),
            network.clone(),
            routing.clone(),
            config.resharding.clone(),
        ));
        let shutdown = CancellationToken::new();

        let mut nodes = BTreeMap::new();
        let mut hosts = BTreeMap::new();
        let mut tasks = Vec::new();
        for n in 0..shards {
            let shard = ShardId(n);
            let node = Arc::new(ShardNode::new(shard, open_store(data_dir.as_deref(), &shard.to_string())?));
            let inbox = network.register(node.clone());
            let handle: Arc<dyn CoordinatorHandle> = coordinator.clone();
            let host = Arc::new(ParticipantHost::new(
                node.clone(),
                network.coordinator_link(shard, handle),
                network.clone(),
                config.resharding.clone(),
                config.index_build.clone(),
            ));
            tasks.push(host.spawn_inbox(inbox));
            nodes.insert(shard, node);
            hosts.insert(shard, host);
        }

        let replicated: Vec<Arc<ShardNode>> = nodes.values().cloned().collect();
        let interval = config.resharding.catchup_interval();
        let stop = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        for node in &replicated {
                            node.commit_majority();
                        }
                    }
                    _ = stop.cancelled() => break,
                }
            }
        }));

        info!("Local cluster started with {} shards", shards);
        Ok(LocalCluster { nodes, hosts, network, coordinator, routing, config, tasks, shutdown })
    }

    pub fn node(&self, shard: ShardId) -> Option<&Arc<ShardNode>> {
        self.nodes.get(&shard)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<ShardNode>> {
        self.nodes.values()
    }

    pub fn host(&self, shard: ShardId) -> Option<&Arc<ParticipantHost>> {
        self.hosts.get(&shard)
    }

    pub fn coordinator(&self) -> &Arc<ReshardingCoordinator> {
        &self.coordinator
    }

    pub fn service(&self) -> ReshardingService {
        ReshardingService::new(self.coordinator.clone())
    }

    pub fn routing(&self) -> &Arc<InMemoryRoutingTable> {
        &self.routing
    }

    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    /// Majority-commit everything applied so far on every node
    pub fn replicate(&self) {
        for node in self.nodes.values() {
            node.commit_majority();
        }
    }

    /// Cut a shard off from the coordinator and other shards, or reconnect it
    pub fn set_reachable(&self, shard: ShardId, reachable: bool) {
        self.network.set_reachable(shard, reachable);
    }

    pub fn shutdown(&mut self) {
        self.shutdown.cancel();
        self.coordinator.shutdown();
        for host in self.hosts.values() {
            host.shutdown();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("Local cluster stopped");
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown();
        }
    }
}
