//! Live ingestion service: SBE streaming feed -> message bus.
//!
//! Decodes the binary feed, normalizes records, and publishes them to the
//! per-message-type bus streams through the batching producer. Runs with
//! the in-process bus; a managed-bus deployment swaps the client behind
//! the same trait.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use dotenv::dotenv;
use marketpipe::bus::{BusProducer, BusProducerConfig, MemoryBus};
use marketpipe::config::{BusConfig, PipelineConfig};
use marketpipe::health::{serve_health, HealthReport, HealthSource};
use marketpipe::models::{MarketMessage, MessageType};
use marketpipe::sbe::client::MessageHandler;
use marketpipe::sbe::{SbeClient, SbeClientConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "stream-ingest")]
#[command(about = "Stream live market data from the SBE feed onto the bus")]
struct Args {
    /// Path to the service YAML config
    #[arg(long, default_value = "config/stream_ingest.yaml")]
    config: String,
}

/// Forwards each normalized record to its stream.
struct PublishHandler {
    producer: Arc<BusProducer>,
    stream: String,
}

#[async_trait]
impl MessageHandler for PublishHandler {
    async fn handle(&self, message: MarketMessage) -> Result<()> {
        self.producer.publish(&self.stream, &message).await
    }
}

struct ServiceHealth {
    client: Arc<SbeClient>,
    producer: Arc<BusProducer>,
}

#[async_trait]
impl HealthSource for ServiceHealth {
    async fn health_check(&self) -> HealthReport {
        let mut components = BTreeMap::new();
        components.insert("stream_client".to_string(), self.client.health_check());
        components.insert("bus_producer".to_string(), self.producer.health_check());
        HealthReport::aggregate(components)
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
    let producer = BusProducer::new(bus, BusProducerConfig::from(&config.bus));
    producer.start();

    let client = SbeClient::new(SbeClientConfig::from(&config.exchange));
    register_handlers(&client, &producer, &config.bus);

    let health = Arc::new(ServiceHealth {
        client: Arc::clone(&client),
        producer: Arc::clone(&producer),
    });
    let health_port = config.health.port;
    tokio::spawn(async move {
        if let Err(e) = serve_health(health_port, health).await {
            tracing::error!(error = %e, "health_endpoint_failed");
        }
    });

    info!(symbols = ?config.exchange.symbols, "stream_ingest_starting");
    let run = tokio::spawn(Arc::clone(&client).run());

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutdown_requested");

    client.stop();
    let run_result = run.await.context("client task panicked")?;
    producer.stop().await;
    run_result
}

fn register_handlers(client: &Arc<SbeClient>, producer: &Arc<BusProducer>, bus: &BusConfig) {
    for message_type in [MessageType::Trade, MessageType::BestBidAsk, MessageType::Depth] {
        client.register_handler(
            message_type,
            Arc::new(PublishHandler {
                producer: Arc::clone(producer),
                stream: bus.stream_for(message_type).to_string(),
            }),
        );
    }
}
