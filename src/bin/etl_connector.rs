//! ETL service: bronze partitions -> relational warehouse.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use dotenv::dotenv;
use marketpipe::config::PipelineConfig;
use marketpipe::etl::{BronzeReader, EtlOrchestrator, MarketDb};
use marketpipe::health::{serve_health, HealthReport, HealthSource};
use marketpipe::store::FsObjectStore;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "etl-connector")]
#[command(about = "Load bronze partitions into the market_data warehouse")]
struct Args {
    /// Path to the service YAML config
    #[arg(long, default_value = "config/etl.yaml")]
    config: String,

    /// Root directory of the local object store
    #[arg(long, default_value = "./data", env = "MARKETPIPE_DATA_DIR")]
    data_dir: String,
}

struct ServiceHealth {
    orchestrator: Arc<EtlOrchestrator>,
}

#[async_trait]
impl HealthSource for ServiceHealth {
    async fn health_check(&self) -> HealthReport {
        self.orchestrator.health_check().await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = PipelineConfig::load(&args.config)
        .with_context(|| format!("loading config {}", args.config))?;

    let store = Arc::new(FsObjectStore::new(&args.data_dir));
    let reader = BronzeReader::new(store, &config.storage.bucket, &config.storage.bronze_prefix);
    let db = Arc::new(MarketDb::open(&config.etl.db_path).context("opening warehouse")?);
    let orchestrator = EtlOrchestrator::new(reader, db, config.etl.clone());

    let health = Arc::new(ServiceHealth {
        orchestrator: Arc::clone(&orchestrator),
    });
    let health_port = config.health.port;
    tokio::spawn(async move {
        if let Err(e) = serve_health(health_port, health).await {
            tracing::error!(error = %e, "health_endpoint_failed");
        }
    });

    info!(db = %config.etl.db_path, "etl_connector_starting");
    let run = tokio::spawn(Arc::clone(&orchestrator).run());

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutdown_requested");

    orchestrator.stop();
    run.await.context("etl task panicked")?
}
