//! Warehouse writer.
//!
//! The `market_data` table is split into monthly partition tables
//! (`market_data_YYYY_MM`) routed on the record timestamp; partitions for
//! the current and next three months are created at startup and on first
//! use. Uniqueness is enforced per partition on
//! `(symbol, timestamp, data_type, COALESCE(trade_id, 0))`; a violated
//! insert counts as a duplicate skip, never as an error.

use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::{Datelike, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use super::transform::MarketRow;
use crate::health::HealthReport;
use crate::models::now_ms;

const PARTITIONS_AHEAD: u32 = 3;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub written: u64,
    pub duplicates: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
pub struct DbStats {
    pub records_written: AtomicU64,
    pub batches_written: AtomicU64,
    pub write_errors: AtomicU64,
    pub duplicate_skips: AtomicU64,
    pub last_write_ms: AtomicI64,
}

pub struct MarketDb {
    conn: Mutex<Connection>,
    pub stats: DbStats,
}

impl MarketDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("opening database {}", path.as_ref().display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        let db = Self {
            conn: Mutex::new(conn),
            stats: DbStats::default(),
        };
        db.create_initial_partitions()?;
        Ok(db)
    }

    fn partition_name(timestamp: i64) -> String {
        let dt = Utc
            .timestamp_millis_opt(timestamp)
            .single()
            .unwrap_or_else(Utc::now);
        format!("market_data_{}_{:02}", dt.year(), dt.month())
    }

    /// Partitions for the current month plus the next `PARTITIONS_AHEAD`.
    fn create_initial_partitions(&self) -> Result<()> {
        let now = Utc::now();
        let conn = self.conn.lock();
        for offset in 0..=PARTITIONS_AHEAD {
            let total = now.month0() + offset;
            let year = now.year() + (total / 12) as i32;
            let month = total % 12 + 1;
            let name = format!("market_data_{year}_{month:02}");
            Self::ensure_partition(&conn, &name)?;
        }
        info!(ahead = PARTITIONS_AHEAD, "warehouse_partitions_ready");
        Ok(())
    }

    fn ensure_partition(conn: &Connection, table: &str) -> Result<()> {
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY,
                symbol TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                price TEXT NOT NULL,
                volume TEXT NOT NULL,
                trade_id INTEGER,
                is_buyer_maker INTEGER,
                source TEXT NOT NULL,
                data_type TEXT NOT NULL,
                ingest_timestamp INTEGER,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),

                open_price TEXT,
                high_price TEXT,
                low_price TEXT,
                close_price TEXT,
                quote_volume TEXT,
                vwap TEXT,
                trade_count INTEGER,
                interval TEXT,

                best_bid_price TEXT,
                best_bid_size TEXT,
                best_ask_price TEXT,
                best_ask_size TEXT,
                spread TEXT,
                mid_price TEXT,
                last_update_id INTEGER,

                price_change TEXT,
                price_change_pct TEXT,
                hour_of_day INTEGER,
                day_of_week INTEGER
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_{table}_unique
                ON {table}(symbol, timestamp, data_type, COALESCE(trade_id, 0));
            CREATE INDEX IF NOT EXISTS idx_{table}_symbol_timestamp
                ON {table}(symbol, timestamp);
            CREATE INDEX IF NOT EXISTS idx_{table}_timestamp
                ON {table}(timestamp);
            CREATE INDEX IF NOT EXISTS idx_{table}_symbol_data_type
                ON {table}(symbol, data_type);
            "#
        ))?;
        Ok(())
    }

    fn partition_tables(conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'market_data_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Insert a batch. Unique-key violations are expected under
    /// at-least-once delivery and are absorbed as duplicate skips.
    pub fn insert_batch(&self, rows: &[MarketRow]) -> Result<BatchOutcome> {
        if rows.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let mut outcome = BatchOutcome::default();
        let conn = self.conn.lock();

        for row in rows {
            let table = Self::partition_name(row.timestamp);
            Self::ensure_partition(&conn, &table)?;

            let dec = |value: &Option<rust_decimal::Decimal>| value.map(|d| d.to_string());
            let result = conn.execute(
                &format!(
                    r#"
                    INSERT INTO {table} (
                        symbol, timestamp, price, volume, trade_id, is_buyer_maker,
                        source, data_type, ingest_timestamp,
                        open_price, high_price, low_price, close_price, quote_volume,
                        vwap, trade_count, interval,
                        best_bid_price, best_bid_size, best_ask_price, best_ask_size,
                        spread, mid_price, last_update_id,
                        price_change, price_change_pct, hour_of_day, day_of_week
                    ) VALUES (
                        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                        ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28
                    )
                    "#
                ),
                rusqlite::params![
                    row.symbol,
                    row.timestamp,
                    row.price.to_string(),
                    row.volume.to_string(),
                    row.trade_id,
                    row.is_buyer_maker,
                    row.source,
                    row.data_type,
                    row.ingest_timestamp,
                    dec(&row.open_price),
                    dec(&row.high_price),
                    dec(&row.low_price),
                    dec(&row.close_price),
                    dec(&row.quote_volume),
                    dec(&row.vwap),
                    row.trade_count,
                    row.interval,
                    dec(&row.best_bid_price),
                    dec(&row.best_bid_size),
                    dec(&row.best_ask_price),
                    dec(&row.best_ask_size),
                    dec(&row.spread),
                    dec(&row.mid_price),
                    row.last_update_id,
                    dec(&row.price_change),
                    dec(&row.price_change_pct),
                    row.hour_of_day,
                    row.day_of_week,
                ],
            );

            match result {
                Ok(_) => outcome.written += 1,
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
                {
                    outcome.duplicates += 1;
                    debug!(symbol = %row.symbol, timestamp = row.timestamp, "duplicate_skip");
                }
                Err(e) => {
                    outcome.errors += 1;
                    warn!(symbol = %row.symbol, error = %e, "row_insert_failed");
                }
            }
        }

        self.stats
            .records_written
            .fetch_add(outcome.written, Ordering::Relaxed);
        self.stats
            .duplicate_skips
            .fetch_add(outcome.duplicates, Ordering::Relaxed);
        self.stats
            .write_errors
            .fetch_add(outcome.errors, Ordering::Relaxed);
        self.stats.batches_written.fetch_add(1, Ordering::Relaxed);
        self.stats.last_write_ms.store(now_ms(), Ordering::Relaxed);

        Ok(outcome)
    }

    pub fn latest_timestamp(&self, symbol: &str, data_type: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let mut latest: Option<i64> = None;
        for table in Self::partition_tables(&conn)? {
            let value: Option<i64> = conn.query_row(
                &format!(
                    "SELECT MAX(timestamp) FROM {table} WHERE symbol = ?1 AND data_type = ?2"
                ),
                rusqlite::params![symbol, data_type],
                |row| row.get(0),
            )?;
            latest = latest.max(value);
        }
        Ok(latest)
    }

    pub fn record_count(&self, symbol: Option<&str>) -> Result<u64> {
        let conn = self.conn.lock();
        let mut total: u64 = 0;
        for table in Self::partition_tables(&conn)? {
            let count: u64 = match symbol {
                Some(symbol) => conn.query_row(
                    &format!("SELECT COUNT(*) FROM {table} WHERE symbol = ?1"),
                    rusqlite::params![symbol],
                    |row| row.get(0),
                )?,
                None => conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })?,
            };
            total += count;
        }
        Ok(total)
    }

    pub fn stats_json(&self) -> serde_json::Value {
        serde_json::json!({
            "records_written": self.stats.records_written.load(Ordering::Relaxed),
            "batches_written": self.stats.batches_written.load(Ordering::Relaxed),
            "write_errors": self.stats.write_errors.load(Ordering::Relaxed),
            "duplicate_skips": self.stats.duplicate_skips.load(Ordering::Relaxed),
        })
    }

    pub fn health_check(&self) -> HealthReport {
        let conn = self.conn.lock();
        match conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)) {
            Ok(_) => HealthReport::healthy(self.stats_json()),
            Err(e) => HealthReport::unhealthy(
                vec![format!("database check failed: {e}")],
                self.stats_json(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn row(symbol: &str, timestamp: i64, trade_id: Option<i64>) -> MarketRow {
        MarketRow {
            symbol: symbol.into(),
            timestamp,
            price: dec!(50000.10),
            volume: dec!(0.5),
            trade_id,
            is_buyer_maker: Some(false),
            source: "rest".into(),
            data_type: "aggTrade".into(),
            ..Default::default()
        }
    }

    #[test]
    fn insert_then_duplicate_is_skipped_not_errored() {
        let db = MarketDb::open_in_memory().unwrap();
        let r = row("BTCUSDT", 1_700_000_000_000, Some(42));

        let first = db.insert_batch(std::slice::from_ref(&r)).unwrap();
        assert_eq!(first, BatchOutcome { written: 1, duplicates: 0, errors: 0 });

        let second = db.insert_batch(std::slice::from_ref(&r)).unwrap();
        assert_eq!(second, BatchOutcome { written: 0, duplicates: 1, errors: 0 });

        assert_eq!(db.record_count(Some("BTCUSDT")).unwrap(), 1);
        assert_eq!(db.stats.duplicate_skips.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn null_trade_ids_coalesce_in_the_unique_key() {
        let db = MarketDb::open_in_memory().unwrap();
        let r = row("BTCUSDT", 1_700_000_000_000, None);

        db.insert_batch(std::slice::from_ref(&r)).unwrap();
        let outcome = db.insert_batch(std::slice::from_ref(&r)).unwrap();
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(db.record_count(None).unwrap(), 1);
    }

    #[test]
    fn same_key_different_trade_id_both_persist() {
        let db = MarketDb::open_in_memory().unwrap();
        db.insert_batch(&[row("BTCUSDT", 1_700_000_000_000, Some(1))])
            .unwrap();
        let outcome = db
            .insert_batch(&[row("BTCUSDT", 1_700_000_000_000, Some(2))])
            .unwrap();
        assert_eq!(outcome.written, 1);
        assert_eq!(db.record_count(None).unwrap(), 2);
    }

    #[test]
    fn rows_route_to_monthly_partitions() {
        let db = MarketDb::open_in_memory().unwrap();
        // 2023-11 and 2023-12.
        db.insert_batch(&[
            row("BTCUSDT", 1_700_000_000_000, Some(1)),
            row("BTCUSDT", 1_701_500_000_000, Some(2)),
        ])
        .unwrap();

        let conn = db.conn.lock();
        let tables = MarketDb::partition_tables(&conn).unwrap();
        assert!(tables.contains(&"market_data_2023_11".to_string()));
        assert!(tables.contains(&"market_data_2023_12".to_string()));

        let in_november: u64 = conn
            .query_row("SELECT COUNT(*) FROM market_data_2023_11", [], |r| r.get(0))
            .unwrap();
        assert_eq!(in_november, 1);
    }

    #[test]
    fn latest_timestamp_spans_partitions() {
        let db = MarketDb::open_in_memory().unwrap();
        db.insert_batch(&[
            row("BTCUSDT", 1_700_000_000_000, Some(1)),
            row("BTCUSDT", 1_701_500_000_000, Some(2)),
        ])
        .unwrap();

        assert_eq!(
            db.latest_timestamp("BTCUSDT", "aggTrade").unwrap(),
            Some(1_701_500_000_000)
        );
        assert_eq!(db.latest_timestamp("ETHUSDT", "aggTrade").unwrap(), None);
    }

    #[test]
    fn decimal_columns_round_trip_as_text() {
        let db = MarketDb::open_in_memory().unwrap();
        let mut r = row("BTCUSDT", 1_700_000_000_000, Some(1));
        r.volume = dec!(0.00150000);
        db.insert_batch(std::slice::from_ref(&r)).unwrap();

        let conn = db.conn.lock();
        let stored: String = conn
            .query_row(
                "SELECT volume FROM market_data_2023_11 WHERE trade_id = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(stored, "0.00150000");
    }

    #[test]
    fn health_check_reports_healthy() {
        let db = MarketDb::open_in_memory().unwrap();
        assert!(db.health_check().is_healthy());
    }
}
