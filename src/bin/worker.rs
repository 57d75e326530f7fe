//! Worker process: pulls tasks off the tiered queues and executes them.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use agentflow::config::Config;
use agentflow::dag::{NodeType, Tier};
use agentflow::executor::{ExecutorSet, FunctionExecutor};
use agentflow::log::PostgresLog;
use agentflow::store::PostgresStore;
use agentflow::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "agentflow-worker", about = "AgentFlow worker")]
struct Args {
    /// PostgreSQL connection URL (overrides AGENTFLOW_DATABASE_URL)
    #[arg(long)]
    database_url: Option<String>,

    /// Comma-separated tiers to subscribe to, highest priority first
    #[arg(long, default_value = "Gold,Silver,Bronze")]
    tiers: String,
}

fn parse_tiers(spec: &str) -> anyhow::Result<Vec<Tier>> {
    spec.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            Tier::parse(part).ok_or_else(|| anyhow::anyhow!("unknown tier '{part}'"))
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    agentflow::observability::init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if args.database_url.is_some() {
        config.database_url = args.database_url;
    }
    let database_url = config.require_database_url()?.to_string();
    let tiers = parse_tiers(&args.tiers)?;

    let store = Arc::new(PostgresStore::connect(&database_url).await?);
    let log = Arc::new(PostgresLog::new(store.pool().clone()));

    // LLM and Tool executors are registered by deployments that provide
    // them; a bare worker serves Function nodes only.
    let mut executors = ExecutorSet::new();
    executors.register(NodeType::Function, Arc::new(FunctionExecutor::with_builtins()));

    let worker = Worker::new(store, log, executors, config.worker_config(tiers));
    let handle = worker.start();

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    handle.shutdown().await;

    Ok(())
}
