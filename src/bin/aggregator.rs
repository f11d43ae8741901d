//! Aggregation service: bus streams -> windowed features -> hot store.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use dotenv::dotenv;
use marketpipe::aggregator::{FeatureWriter, StreamAggregator};
use marketpipe::bus::{BusConsumer, BusConsumerConfig, MemoryBus};
use marketpipe::config::PipelineConfig;
use marketpipe::health::{serve_health, HealthReport, HealthSource};
use marketpipe::store::MemoryHotStore;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "aggregator")]
#[command(about = "Aggregate bus streams into hot-store feature records")]
struct Args {
    /// Path to the service YAML config
    #[arg(long, default_value = "config/aggregator.yaml")]
    config: String,
}

struct ServiceHealth {
    aggregator: Arc<StreamAggregator>,
}

#[async_trait]
impl HealthSource for ServiceHealth {
    async fn health_check(&self) -> HealthReport {
        self.aggregator.health_check().await
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

    let bus = Arc::new(MemoryBus::with_streams(&config.bus.streams(), 4));
    let consumer = BusConsumer::new(bus, BusConsumerConfig::from(&config.bus));
    let hot = Arc::new(MemoryHotStore::new());
    let writer = FeatureWriter::new(hot, &config.hot_store);
    let aggregator = StreamAggregator::new(consumer, writer, config.aggregation.clone());

    let health = Arc::new(ServiceHealth {
        aggregator: Arc::clone(&aggregator),
    });
    let health_port = config.health.port;
    tokio::spawn(async move {
        if let Err(e) = serve_health(health_port, health).await {
            tracing::error!(error = %e, "health_endpoint_failed");
        }
    });

    info!("aggregator_starting");
    let run = tokio::spawn(Arc::clone(&aggregator).run());

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutdown_requested");

    aggregator.stop();
    run.await.context("aggregator task panicked")?
}
