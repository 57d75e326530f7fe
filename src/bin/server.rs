//! Control-plane server: scheduler plus monitor over Postgres.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use agentflow::config::Config;
use agentflow::control_plane::ControlPlane;
use agentflow::log::PostgresLog;
use agentflow::store::PostgresStore;

#[derive(Parser, Debug)]
#[command(name = "agentflow-server", about = "AgentFlow control plane")]
struct Args {
    /// PostgreSQL connection URL (overrides AGENTFLOW_DATABASE_URL)
    #[arg(long)]
    database_url: Option<String>,
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

    let store = Arc::new(PostgresStore::connect(&database_url).await?);
    let log = Arc::new(PostgresLog::new(store.pool().clone()));

    let control_plane = ControlPlane::new(
        store,
        log,
        config.scheduler_config(),
        config.monitor_config(),
    );
    control_plane.start()?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    control_plane.shutdown().await?;

    Ok(())
}
