//! Historical backfill service: exchange REST -> bronze partitions.
//!
//! Pulls aggregated trades (and optionally klines and a depth snapshot)
//! for every configured symbol over a time range, resuming from
//! checkpoints, and lands the records as partitioned JSONL in the object
//! store.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use marketpipe::config::PipelineConfig;
use marketpipe::models::now_ms;
use marketpipe::rest::{Backfiller, BinanceRestClient, CheckpointStore, FsCheckpointStore};
use marketpipe::store::{FsObjectStore, PartitionWriter, PartitionWriterConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "backfill")]
#[command(about = "Backfill historical market data into the bronze layer")]
struct Args {
    /// Path to the service YAML config
    #[arg(long, default_value = "config/backfill.yaml")]
    config: String,

    /// Root directory of the local object store
    #[arg(long, default_value = "./data", env = "MARKETPIPE_DATA_DIR")]
    data_dir: String,

    /// Start of the backfill range (unix millis); default: 24h ago
    #[arg(long)]
    start_ms: Option<i64>,

    /// End of the backfill range (unix millis); default: now
    #[arg(long)]
    end_ms: Option<i64>,

    /// Also pull 1m klines over the range
    #[arg(long)]
    with_klines: bool,

    /// Also take a current depth snapshot per symbol
    #[arg(long)]
    with_depth: bool,

    /// Drop checkpoints older than this many days, then exit
    #[arg(long)]
    cleanup_checkpoints_days: Option<i64>,
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

    let checkpoints = FsCheckpointStore::new(&config.storage.checkpoint_dir);

    if let Some(days) = args.cleanup_checkpoints_days {
        let removed = checkpoints.cleanup_older_than(days).await?;
        info!(removed, days, "checkpoint_cleanup_done");
        return Ok(());
    }

    let end_ms = args.end_ms.unwrap_or_else(now_ms);
    let start_ms = args.start_ms.unwrap_or(end_ms - 24 * 3600 * 1000);
    anyhow::ensure!(start_ms < end_ms, "start must precede end");

    let store = Arc::new(FsObjectStore::new(&args.data_dir));
    let writer = Arc::new(PartitionWriter::new(
        store,
        PartitionWriterConfig::from(&config.storage),
        &config.dedup,
    ));
    let client = BinanceRestClient::new(&config.exchange, &config.retry)?;
    let backfiller = Backfiller::new(&client, &checkpoints);

    for symbol in &config.exchange.symbols {
        info!(symbol, start_ms, end_ms, "symbol_backfill_starting");

        let trade_writer = Arc::clone(&writer);
        let report = backfiller
            .backfill_agg_trades(symbol, start_ms, end_ms, |batch| {
                let writer = Arc::clone(&trade_writer);
                let symbol = symbol.clone();
                async move {
                    let partition_ts = batch.first().map(|t| t.event_ts).unwrap_or(start_ms);
                    writer.write_agg_trades(&symbol, &batch, partition_ts).await?;
                    Ok(())
                }
            })
            .await;

        match report {
            Ok(report) => info!(
                symbol,
                records = report.records,
                batches = report.batches,
                "symbol_backfill_done"
            ),
            Err(e) => error!(symbol, error = %e, "symbol_backfill_failed"),
        }

        if args.with_klines {
            let kline_writer = Arc::clone(&writer);
            let report = backfiller
                .collect_klines(symbol, "1m", start_ms, end_ms, |batch| {
                    let writer = Arc::clone(&kline_writer);
                    let symbol = symbol.clone();
                    async move {
                        let partition_ts = batch.first().map(|k| k.open_time).unwrap_or(start_ms);
                        writer.write_klines(&symbol, &batch, partition_ts).await?;
                        Ok(())
                    }
                })
                .await;
            if let Err(e) = report {
                error!(symbol, error = %e, "kline_backfill_failed");
            }
        }

        if args.with_depth {
            match backfiller.collect_depth_snapshot(symbol, 100).await {
                Ok(snapshot) => {
                    writer.write_depth_snapshot(&snapshot).await?;
                }
                Err(e) => error!(symbol, error = %e, "depth_snapshot_failed"),
            }
        }
    }

    writer.flush_all_buffers().await?;
    info!(stats = %writer.stats_json(), "backfill_finished");
    Ok(())
}
