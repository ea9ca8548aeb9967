use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use strata_core::{Document, Namespace, PartitionKey, ShardId, StrataConfig, Value};
use strata_state::{
    ChunkMap, CheckpointStore, IndexBuildPhase, IndexBuilder, IndexSpec, LocalCluster, MemoryStore, ReshardingRequest,
    ShardNode,
};

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Resharding and resumable index builds on an in-process cluster", long_about = None)]
struct Cli {
    /// Configuration file; STRATA__* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reshard a seeded collection across two shards on a new key
    Reshard {
        /// Collection to reshard, as db.coll
        #[arg(long, default_value = "reshardingDb.coll")]
        namespace: String,

        /// New partition key field
        #[arg(long, default_value = "newKey")]
        key: String,

        /// Documents seeded per shard
        #[arg(long, default_value_t = 100)]
        docs: i64,

        /// Key value at which shard1 takes over from shard0
        #[arg(long, default_value_t = 0)]
        split: i64,

        /// Abort once the recipients have caught up instead of committing
        #[arg(long)]
        abort: bool,
    },

    /// Build an index, interrupt it, resume it and report the result
    IndexBuild {
        /// Documents seeded into the collection
        #[arg(long, default_value_t = 1_000)]
        docs: i64,

        /// Steps taken before the build is interrupted
        #[arg(long, default_value_t = 5)]
        interrupt_after: usize,

        /// Writes made while the build is interrupted
        #[arg(long, default_value_t = 50)]
        writes: i64,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    let config = StrataConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Reshard { namespace, key, docs, split, abort } => {
            let ns: Namespace = namespace.parse()?;
            reshard(config, ns, &key, docs, split, abort).await?;
        }
        Commands::IndexBuild { docs, interrupt_after, writes } => {
            index_build(config, docs, interrupt_after, writes)?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn reshard(config: StrataConfig, ns: Namespace, key: &str, docs: i64, split: i64, abort: bool) -> Result<()> {
    let timeout = config.resharding.report_timeout();
    let mut cluster = LocalCluster::start(2, config).await?;
    for n in 0..2u64 {
        let node = cluster.node(ShardId(n)).context("shard missing from cluster")?;
        for i in 0..docs {
            let id = n as i64 * docs + i;
            node.insert(&ns, Document::new(id).with(key, split - docs / 2 + i))?;
        }
    }
    cluster.replicate();

    let new_key = PartitionKey::single(key);
    let request = ReshardingRequest {
        source_ns: ns.clone(),
        new_key: new_key.clone(),
        donors: [ShardId(0), ShardId(1)].into_iter().collect(),
        recipients: [ShardId(0), ShardId(1)].into_iter().collect(),
        chunk_map: ChunkMap::split_at(new_key, vec![Value::Int(split)], ShardId(0), ShardId(1))?,
    };

    let service = cluster.service();
    let done = if abort {
        let started = service.reshard_collection(request, false).await?;
        let fetch = service.wait_until_fetch_timestamp(&ns, timeout).await?;
        info!("Resharding {} chose fetch timestamp {}", started.operation_id, fetch);
        service.abort_reshard_collection(&ns, "aborted from the command line").await?;
        service.wait_for_completion(&ns, timeout).await?
    } else {
        service.reshard_collection(request, true).await?
    };

    println!("{}", serde_json::to_string_pretty(&done.status())?);
    for node in cluster.nodes() {
        println!("{}: {} documents in {}", node.shard_id(), node.count(&ns), ns);
    }
    cluster.shutdown();
    Ok(())
}

fn index_build(config: StrataConfig, docs: i64, interrupt_after: usize, writes: i64) -> Result<()> {
    let ns: Namespace = "indexDb.coll".parse()?;
    let node = Arc::new(ShardNode::new(ShardId(0), CheckpointStore::new(Arc::new(MemoryStore::new()))));
    for id in 0..docs {
        node.insert(&ns, Document::new(id).with("a", id % 97))?;
    }
    node.commit_majority();

    let key = PartitionKey::single("a");
    let spec = IndexSpec::new(&IndexSpec::default_name(&key), key);
    let mut builder = IndexBuilder::start(node.clone(), node.store().clone(), config.index_build.clone(), ns.clone(), spec)?;
    let reached = builder.drive(interrupt_after)?;
    let build_id = builder.build_id();
    if reached.is_terminal() {
        bail!("index build {} reached {:?} before the interruption point", build_id, reached);
    }
    info!("Interrupting index build {} in {:?}", build_id, reached);
    drop(builder);

    for i in 0..writes {
        node.upsert(&ns, Document::new(docs + i).with("a", -i))?;
    }
    node.commit_majority();

    let mut builder = IndexBuilder::resume(build_id, node.clone(), node.store().clone(), config.index_build)?;
    let started = Instant::now();
    if builder.drive(usize::MAX)? != IndexBuildPhase::Done {
        bail!("index build {} ended in {:?}", build_id, builder.phase());
    }
    info!("Index build {} finished {:?} after resuming", build_id, started.elapsed());

    println!("{}", serde_json::to_string_pretty(&builder.status())?);
    println!("{} entries in index {} on {}", builder.index().len(), builder.record().spec.name, ns);
    Ok(())
}
