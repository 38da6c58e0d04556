use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use statline_core::SystemClock;
use statline_storage::{connect_postgres, ApiClient, EntityStores, PgScopeSource, RateGate};
use statline_sync::{Dispatcher, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "statline")]
#[command(about = "Synchronise sports statistics from the upstream API into the store")]
struct Cli {
    /// `entity[:scope]`, e.g. `fixture:current-season` or `result`
    command: String,
    /// Comma-separated IDs, or `today`
    option: Option<String>,
    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = SyncConfig::load()?;
    info!(
        command = %cli.command,
        option = cli.option.as_deref().unwrap_or(""),
        rate_limit = config.rate_limit,
        "starting sync"
    );
    let tuning = config.tuning();
    let client = ApiClient::new(config.api_client_config()).context("building upstream client")?;
    let pool_size = (tuning.fetch_concurrency + tuning.reconcile_workers) as u32;
    let pool = connect_postgres(&config.database_url, pool_size)
        .await
        .context("connecting to the store")?;

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(client),
        EntityStores::postgres(pool.clone()),
        Arc::new(PgScopeSource::new(pool)),
        Arc::new(SystemClock),
        Arc::new(RateGate::new(config.rate_limit)),
        tuning,
    ));

    let done = dispatcher.process(cli.command.clone(), cli.option.clone());
    let summary = Dispatcher::completion(done)
        .await
        .with_context(|| format!("sync `{}` failed", cli.command))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "sync complete: run_id={} entity={} targets={} pages={} created={} updated={} failed={} truncated={}",
            summary.run_id,
            summary.entity,
            summary.targets,
            summary.pages,
            summary.created,
            summary.updated,
            summary.failed,
            summary.truncated
        );
    }
    Ok(())
}
