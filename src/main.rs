//! Service entry point: configuration, recovery, serving, shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use scoreforge::api::server::ApiServer;
use scoreforge::api::{self, ApiState};
use scoreforge::config::Config;
use scoreforge::job::{JobManager, JobStore};
use scoreforge::pipeline::TranscriptionPipeline;

/// How often the expiry sweep runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "scoreforge", version, about = "Audio-to-sheet-music transcription backend")]
struct Args {
    /// Address to bind the API server to.
    #[arg(long, default_value = "0.0.0.0", env = "SCOREFORGE_HOST")]
    host: String,

    /// Port to bind the API server to.
    #[arg(long, default_value_t = 8000, env = "SCOREFORGE_PORT")]
    port: u16,

    /// Emit logs as JSON instead of human-readable lines.
    #[arg(long, env = "SCOREFORGE_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = Config::from_env().map_err(|e| anyhow::anyhow!(e))?;
    std::fs::create_dir_all(&config.storage_dir)?;

    let store = JobStore::new(&config.storage_dir)?;
    let processor = Arc::new(TranscriptionPipeline::new(&config));
    let manager = Arc::new(JobManager::new(&config, store, processor));

    // Requeue whatever a previous process left unfinished before the HTTP
    // surface starts accepting new work.
    manager.load_existing_jobs().await?;
    manager.start().await;

    let cleanup = tokio::spawn(cleanup_loop(manager.clone()));

    let state = ApiState {
        manager: manager.clone(),
        config: Arc::new(config),
    };
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let mut server = ApiServer::start(addr, api::router(state)).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    server.shutdown().await;
    cleanup.abort();
    let _ = cleanup.await;
    manager.shutdown().await;
    Ok(())
}

/// Periodic reclamation of expired jobs. Lookups also reclaim
/// opportunistically; this sweep catches jobs nobody asks about.
async fn cleanup_loop(manager: Arc<JobManager>) {
    let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it so startup recovery
    // and the first sweep don't race.
    interval.tick().await;
    loop {
        interval.tick().await;
        manager.cleanup_expired().await;
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
