//! The ETL cycle: discover new bronze objects, read and transform them,
//! insert into the warehouse, advance the watermark.
//!
//! A failing file is isolated and counted; the rest of the batch
//! continues. A failing cycle is retried on the next tick.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use super::db::MarketDb;
use super::reader::BronzeReader;
use super::transform::DataTransformer;
use crate::config::EtlConfig;
use crate::health::HealthReport;
use crate::models::now_ms;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleStats {
    pub files_discovered: u64,
    pub files_processed: u64,
    pub records_processed: u64,
    pub records_written: u64,
    pub duplicate_skips: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
pub struct OrchestratorStats {
    pub files_processed: AtomicU64,
    pub records_processed: AtomicU64,
    pub records_written: AtomicU64,
    pub errors: AtomicU64,
}

pub struct EtlOrchestrator {
    reader: BronzeReader,
    transformer: DataTransformer,
    db: Arc<MarketDb>,
    config: EtlConfig,
    running: AtomicBool,
    cycles_run: AtomicU64,
    stats: OrchestratorStats,
}

impl EtlOrchestrator {
    pub fn new(reader: BronzeReader, db: Arc<MarketDb>, config: EtlConfig) -> Arc<Self> {
        Arc::new(Self {
            reader,
            transformer: DataTransformer::new(),
            db,
            config,
            running: AtomicBool::new(false),
            cycles_run: AtomicU64::new(0),
            stats: OrchestratorStats::default(),
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Cycle until stopped. Store verification failures at startup are
    /// fatal; per-cycle failures are logged and retried next interval.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        let startup = self.reader.health_check().await;
        if !startup.is_healthy() {
            anyhow::bail!("bronze store verification failed: {:?}", startup.issues);
        }

        info!(
            cycle_interval_s = self.config.cycle_interval_seconds,
            "etl_orchestrator_started"
        );

        while self.running.load(Ordering::SeqCst) {
            match self.run_cycle().await {
                Ok(cycle) => {
                    if cycle.files_processed > 0 {
                        info!(
                            files = cycle.files_processed,
                            records = cycle.records_written,
                            duplicates = cycle.duplicate_skips,
                            errors = cycle.errors,
                            "etl_cycle_completed"
                        );
                    }
                }
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "etl_cycle_failed");
                }
            }
            self.wait_for_next_cycle().await;
        }

        info!("etl_orchestrator_stopped");
        Ok(())
    }

    /// One discover → read → transform → write pass.
    pub async fn run_cycle(&self) -> Result<CycleStats> {
        let mut cycle = CycleStats::default();

        let files = self.reader.discover_new_files().await?;
        cycle.files_discovered = files.len() as u64;
        if files.is_empty() {
            return Ok(cycle);
        }

        let mut max_modified: Option<i64> = None;
        for batch in files.chunks(self.config.batch_size.max(1)) {
            for file in batch {
                match self.process_file(file).await {
                    Ok((processed, written, duplicates)) => {
                        cycle.files_processed += 1;
                        cycle.records_processed += processed;
                        cycle.records_written += written;
                        cycle.duplicate_skips += duplicates;
                        max_modified = max_modified.max(Some(file.last_modified));
                    }
                    Err(e) => {
                        cycle.errors += 1;
                        warn!(key = %file.key, error = %e, "file_processing_failed");
                    }
                }
            }
        }

        if let Some(watermark) = max_modified {
            self.reader.advance_watermark(watermark);
        }

        self.cycles_run.fetch_add(1, Ordering::Relaxed);
        self.stats
            .files_processed
            .fetch_add(cycle.files_processed, Ordering::Relaxed);
        self.stats
            .records_processed
            .fetch_add(cycle.records_processed, Ordering::Relaxed);
        self.stats
            .records_written
            .fetch_add(cycle.records_written, Ordering::Relaxed);
        self.stats.errors.fetch_add(cycle.errors, Ordering::Relaxed);

        Ok(cycle)
    }

    async fn process_file(
        &self,
        file: &super::reader::DiscoveredFile,
    ) -> Result<(u64, u64, u64)> {
        let records = self.reader.read_file(file).await?;
        if records.is_empty() {
            return Ok((0, 0, 0));
        }

        let mut rows = self.transformer.transform(&records, file);
        if rows.is_empty() {
            return Ok((records.len() as u64, 0, 0));
        }
        self.transformer.add_derived_features(&mut rows);

        let outcome = self.db.insert_batch(&rows)?;
        Ok((records.len() as u64, outcome.written, outcome.duplicates))
    }

    /// Sleep the cycle interval in short slices so shutdown stays
    /// responsive.
    async fn wait_for_next_cycle(&self) {
        let mut remaining = self.config.cycle_interval_seconds;
        while remaining > 0 && self.running.load(Ordering::SeqCst) {
            let step = remaining.min(1);
            tokio::time::sleep(Duration::from_secs(step)).await;
            remaining -= step;
        }
    }

    pub fn stats_json(&self) -> serde_json::Value {
        serde_json::json!({
            "cycles_run": self.cycles_run.load(Ordering::Relaxed),
            "files_processed": self.stats.files_processed.load(Ordering::Relaxed),
            "records_processed": self.stats.records_processed.load(Ordering::Relaxed),
            "records_written": self.stats.records_written.load(Ordering::Relaxed),
            "errors": self.stats.errors.load(Ordering::Relaxed),
            "transform": {
                "validation_errors": self.transformer.stats().validation_errors,
                "records_skipped": self.transformer.stats().records_skipped,
            },
            "last_cycle_ms": now_ms(),
        })
    }

    pub async fn health_check(&self) -> HealthReport {
        let mut components = std::collections::BTreeMap::new();
        components.insert("reader".to_string(), self.reader.health_check().await);
        components.insert("db".to_string(), self.db.health_check());
        let mut report = HealthReport::aggregate(components);

        let files = self.stats.files_processed.load(Ordering::Relaxed);
        let errors = self.stats.errors.load(Ordering::Relaxed);
        if files > 0 && errors as f64 / files as f64 > 0.1 {
            report.issues.push("high file error rate".to_string());
            if report.is_healthy() {
                report.status = crate::health::HealthStatus::Degraded;
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FsObjectStore, ObjectStore, PutOptions};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gz(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    fn trade_line(trade_id: i64, event_ts: i64) -> String {
        serde_json::json!({
            "symbol": "BTCUSDT",
            "event_ts": event_ts,
            "ingest_ts": event_ts + 5,
            "trade_id": trade_id,
            "price": "50000.10",
            "qty": "0.5",
            "is_buyer_maker": false,
            "source": "rest",
        })
        .to_string()
    }

    async fn orchestrator_over(
        store: Arc<dyn ObjectStore>,
    ) -> (Arc<EtlOrchestrator>, Arc<MarketDb>) {
        let reader = BronzeReader::new(store, "market-data", "bronze");
        let db = Arc::new(MarketDb::open_in_memory().unwrap());
        let orchestrator = EtlOrchestrator::new(
            reader,
            Arc::clone(&db),
            EtlConfig {
                cycle_interval_seconds: 60,
                batch_size: 10,
                db_path: ":memory:".into(),
            },
        );
        (orchestrator, db)
    }

    #[tokio::test]
    async fn cycle_moves_bronze_records_into_the_warehouse() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir.path()));
        store
            .put_object(
                "market-data",
                "bronze/BTCUSDT/aggTrades/yyyy=2023/mm=11/dd=14/hh=22/aggTrades_20231114_221320.jsonl.gz",
                gz(&format!(
                    "{}\n{}\n",
                    trade_line(1, 1_700_000_000_000),
                    trade_line(2, 1_700_000_001_000)
                )),
                PutOptions::default(),
            )
            .await
            .unwrap();

        let (orchestrator, db) = orchestrator_over(store).await;
        let cycle = orchestrator.run_cycle().await.unwrap();

        assert_eq!(cycle.files_processed, 1);
        assert_eq!(cycle.records_written, 2);
        assert_eq!(db.record_count(Some("BTCUSDT")).unwrap(), 2);
        assert!(orchestrator.reader.watermark().is_some());
    }

    #[tokio::test]
    async fn reprocessing_is_absorbed_as_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir.path()));
        let body = gz(&format!("{}\n", trade_line(42, 1_700_000_000_000)));
        store
            .put_object(
                "market-data",
                "bronze/BTCUSDT/aggTrades/a.jsonl.gz",
                body.clone(),
                PutOptions::default(),
            )
            .await
            .unwrap();
        // Same trade written twice upstream under a different object key.
        store
            .put_object(
                "market-data",
                "bronze/BTCUSDT/aggTrades/b.jsonl.gz",
                body,
                PutOptions::default(),
            )
            .await
            .unwrap();

        let (orchestrator, db) = orchestrator_over(store).await;
        let cycle = orchestrator.run_cycle().await.unwrap();

        assert_eq!(cycle.records_written, 1);
        assert_eq!(cycle.duplicate_skips, 1);
        assert_eq!(cycle.errors, 0);
        assert_eq!(db.record_count(None).unwrap(), 1);
    }

    #[tokio::test]
    async fn second_cycle_sees_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir.path()));
        store
            .put_object(
                "market-data",
                "bronze/BTCUSDT/aggTrades/a.jsonl",
                trade_line(1, 1_700_000_000_000).into_bytes(),
                PutOptions::default(),
            )
            .await
            .unwrap();

        let (orchestrator, _db) = orchestrator_over(store).await;
        orchestrator.run_cycle().await.unwrap();

        let second = orchestrator.run_cycle().await.unwrap();
        assert_eq!(second.files_discovered, 0);
        assert_eq!(second.files_processed, 0);
    }

    #[tokio::test]
    async fn unparseable_file_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir.path()));
        // A .gz key with a non-gzip body fails to read.
        store
            .put_object(
                "market-data",
                "bronze/BTCUSDT/aggTrades/bad.jsonl.gz",
                b"definitely not gzip".to_vec(),
                PutOptions::default(),
            )
            .await
            .unwrap();
        store
            .put_object(
                "market-data",
                "bronze/BTCUSDT/aggTrades/good.jsonl",
                trade_line(1, 1_700_000_000_000).into_bytes(),
                PutOptions::default(),
            )
            .await
            .unwrap();

        let (orchestrator, db) = orchestrator_over(store).await;
        let cycle = orchestrator.run_cycle().await.unwrap();

        assert_eq!(cycle.errors, 1);
        assert_eq!(cycle.files_processed, 1);
        assert_eq!(db.record_count(None).unwrap(), 1);
    }

    #[tokio::test]
    async fn health_aggregates_reader_and_db() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir.path()));
        // Bucket does not exist yet: reader is unhealthy.
        let (orchestrator, _db) = orchestrator_over(store).await;
        let report = orchestrator.health_check().await;
        assert!(!report.is_healthy());
    }
}
