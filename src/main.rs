use anyhow::Context;
use clap::Parser;
use distributed_grid::compute::task::FnTask;
use distributed_grid::config::GridConfig;
use distributed_grid::grid::context::GridContext;
use distributed_grid::grid::service::Grid;
use distributed_grid::membership::service::MembershipService;
use distributed_grid::pipeline::types::{Pipeline, Stage};
use distributed_grid::storage::StateStore;
use distributed_grid::storage::file::FileStore;
use distributed_grid::storage::memory::MemoryStore;
use distributed_grid::transport::gossip::GossipTransport;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// A grid node: gossip membership on `--bind`, worker RPC on the port + 1000.
#[derive(Parser, Debug)]
#[command(name = "grid-node", version)]
struct Args {
    /// Gossip address, e.g. 127.0.0.1:5000
    #[arg(long)]
    bind: SocketAddr,

    /// Address of an existing member. Repeat for several seeds.
    #[arg(long)]
    seed: Vec<SocketAddr>,

    /// TOML file with timing overrides (defaults to $GRID_CONFIG).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for durable state. In-memory when omitted.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Run the demo pipeline once the cluster has settled.
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => GridConfig::load_from(path)?,
        None => GridConfig::load()?,
    };

    tracing::info!("Starting node on {}", args.bind);
    if args.seed.is_empty() {
        tracing::info!("Starting as seed node (founder)");
    } else {
        tracing::info!("Seed nodes: {:?}", args.seed);
    }

    // 1. Membership + transport:
    let membership = MembershipService::new(args.bind, args.seed.clone()).await?;
    tracing::info!("Node ID: {}", membership.local_node.id);
    let transport = GossipTransport::start(membership.clone()).await?;

    // 2. Durable state:
    let storage: Arc<dyn StateStore> = match &args.state_dir {
        Some(dir) => FileStore::open(dir.clone())
            .with_context(|| format!("opening state directory {}", dir.display()))?,
        None => {
            if !args.seed.is_empty() {
                tracing::warn!(
                    "No --state-dir: durable state is private to this node and will not survive a coordinator change"
                );
            }
            MemoryStore::new()
        }
    };

    // 3. Grid:
    let grid = Grid::new(transport.clone(), storage, config);

    // 4. Stats reporter:
    let stats_grid = grid.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            let members = stats_grid.members();
            tracing::info!(
                "Cluster stats: {} alive nodes, coordinator {:?}, {} running task(s)",
                members.len(),
                stats_grid.coordinator(),
                stats_grid.worker().running_task_count()
            );
            for node in transport.membership().get_alive_members() {
                tracing::debug!(
                    "  - {} gossip={} http={} (inc={})",
                    node.id,
                    node.gossip_addr,
                    node.http_addr,
                    node.incarnation
                );
            }
        }
    });

    // 5. Optional demo workload:
    if args.demo {
        let demo_grid = grid.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            match demo_grid.compute().execute_pipeline(&demo_pipeline()).await {
                Ok(result) => tracing::info!("Demo pipeline finished: {:?}", result),
                Err(e) => tracing::error!("Demo pipeline failed: {}", e),
            }
        });
    }

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;
    grid.shutdown().await;

    Ok(())
}

fn demo_pipeline() -> Pipeline {
    let prepare = FnTask::new("demo-prepare", |context: GridContext| async move {
        tracing::info!("Preparing on coordinator {}", context.node_id());
        Ok::<_, anyhow::Error>(Some(json!({ "members": context.members().len() })))
    });

    let fan_out = FnTask::new("demo-fan-out", |context: GridContext| async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok::<_, anyhow::Error>(Some(json!({ "node": context.node_id().to_string() })))
    })
    .all_nodes();

    let bootstrap = FnTask::new("demo-bootstrap", |_context: GridContext| async move {
        tracing::info!("One-time bootstrap");
        Ok::<_, anyhow::Error>(None)
    })
    .once();

    let report = FnTask::new("demo-report", |context: GridContext| async move {
        tracing::info!("Pipeline report from {}", context.node_id());
        Ok::<_, anyhow::Error>(None)
    });

    Pipeline::new(
        "demo",
        vec![
            Stage::new(prepare.into_task()),
            Stage::new(fan_out.into_task()),
            Stage::new(bootstrap.into_task()).only_if(|context| context.members().len() > 1),
            Stage::new(report.into_task()).always(),
        ],
    )
}
