//! Service configuration.
//!
//! Each service binary loads one YAML file. Values may reference
//! environment variables as `${VAR}` or `${VAR:-default}`; substitution is
//! applied to the raw text before deserialization. Validation failures are
//! fatal at startup.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::MessageType;

/// Top-level pipeline configuration. Every section has defaults so a
/// service YAML only needs the parts it cares about.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub exchange: ExchangeConfig,
    pub retry: RetryConfig,
    pub bus: BusConfig,
    pub storage: StorageConfig,
    pub hot_store: HotStoreConfig,
    pub aggregation: AggregationConfig,
    pub etl: EtlConfig,
    pub dedup: DedupConfig,
    pub health: HealthConfig,
}

/// Exchange endpoints and subscription set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub rest_base_url: String,
    pub sbe_ws_url: String,
    /// API key sent as `X-MBX-APIKEY`; required by the SBE streams.
    pub api_key: Option<String>,
    pub symbols: Vec<String>,
    /// Stream subset to subscribe to: trade, bestBidAsk, depth.
    pub message_types: Vec<String>,
    pub rate_limit_requests_per_minute: u32,
    pub request_timeout_seconds: u64,
    /// Reject frames with unknown template IDs instead of assuming trades.
    pub strict_schema: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_base_url: "https://api.binance.com".into(),
            sbe_ws_url: "wss://stream-sbe.binance.com:9443/stream".into(),
            api_key: None,
            symbols: vec!["BTCUSDT".into()],
            message_types: vec!["trade".into(), "bestBidAsk".into(), "depth".into()],
            rate_limit_requests_per_minute: 1200,
            request_timeout_seconds: 30,
            strict_schema: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Bus stream names and producer/consumer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub trade_stream: String,
    pub bba_stream: String,
    pub depth_stream: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub polling_interval_ms: u64,
    pub max_records_per_request: usize,
    pub op_timeout_seconds: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            trade_stream: "market-trades".into(),
            bba_stream: "market-bba".into(),
            depth_stream: "market-depth".into(),
            batch_size: 500,
            flush_interval_ms: 1_000,
            polling_interval_ms: 1_000,
            max_records_per_request: 1_000,
            op_timeout_seconds: 10,
        }
    }
}

impl BusConfig {
    /// Stream name carrying the given message type.
    pub fn stream_for(&self, message_type: MessageType) -> &str {
        match message_type {
            MessageType::Trade => &self.trade_stream,
            MessageType::BestBidAsk => &self.bba_stream,
            MessageType::Depth => &self.depth_stream,
        }
    }

    pub fn streams(&self) -> Vec<String> {
        vec![
            self.trade_stream.clone(),
            self.bba_stream.clone(),
            self.depth_stream.clone(),
        ]
    }
}

/// Object-store layout and checkpoint placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub bucket: String,
    pub bronze_prefix: String,
    pub checkpoint_prefix: String,
    /// Local directory used when checkpoints are kept on the filesystem.
    pub checkpoint_dir: String,
    pub compression: bool,
    /// Streaming-buffer flush bounds for the partition writer.
    pub buffer_max_records: usize,
    pub buffer_timeout_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: "market-data".into(),
            bronze_prefix: "bronze".into(),
            checkpoint_prefix: "checkpoints".into(),
            checkpoint_dir: "./checkpoints".into(),
            compression: true,
            buffer_max_records: 1_000,
            buffer_timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotStoreConfig {
    pub key_prefix: String,
    pub ttl_seconds: u64,
}

impl Default for HotStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "features".into(),
            ttl_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub min_messages: usize,
    pub max_interval_seconds: u64,
    pub check_interval_seconds: u64,
    pub buffer_capacity: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            min_messages: 10,
            max_interval_seconds: 30,
            check_interval_seconds: 1,
            buffer_capacity: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    pub cycle_interval_seconds: u64,
    pub batch_size: usize,
    pub db_path: String,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            cycle_interval_seconds: 60,
            batch_size: 1_000,
            db_path: "./market_data.db".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub window_seconds: u64,
    pub max_records_per_symbol: usize,
    pub cleanup_interval_seconds: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_seconds: 3_600,
            max_records_per_symbol: 100_000,
            cleanup_interval_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl PipelineConfig {
    /// Load a YAML config file, applying environment substitution.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw)?;
        let config: Self = serde_yaml::from_str(&substituted).context("invalid config YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation; failures here exit the process.
    pub fn validate(&self) -> Result<()> {
        let mut issues = Vec::new();

        if self.exchange.symbols.is_empty() {
            issues.push("exchange.symbols must not be empty".to_string());
        }
        for symbol in &self.exchange.symbols {
            if symbol.trim().is_empty() || *symbol != symbol.to_uppercase() {
                issues.push(format!("invalid symbol {symbol:?}: must be upper-case"));
            }
        }
        if self.exchange.rate_limit_requests_per_minute == 0 {
            issues.push("exchange.rate_limit_requests_per_minute must be > 0".to_string());
        }
        for message_type in &self.exchange.message_types {
            if MessageType::parse(message_type).is_none() {
                issues.push(format!("unknown exchange.message_types entry {message_type:?}"));
            }
        }
        for (name, value) in [
            ("bus.trade_stream", &self.bus.trade_stream),
            ("bus.bba_stream", &self.bus.bba_stream),
            ("bus.depth_stream", &self.bus.depth_stream),
            ("storage.bucket", &self.storage.bucket),
            ("storage.bronze_prefix", &self.storage.bronze_prefix),
        ] {
            if value.trim().is_empty() {
                issues.push(format!("{name} must not be empty"));
            }
        }
        if self.bus.batch_size == 0 {
            issues.push("bus.batch_size must be > 0".to_string());
        }
        if self.retry.max_attempts == 0 {
            issues.push("retry.max_attempts must be > 0".to_string());
        }
        if self.hot_store.ttl_seconds == 0 {
            issues.push("hot_store.ttl_seconds must be > 0".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            bail!("config validation failed: {}", issues.join("; "))
        }
    }
}

/// Replace `${VAR}` and `${VAR:-default}` references with environment
/// values. A reference without a default to an unset variable is an error.
pub fn substitute_env_vars(raw: &str) -> Result<String> {
    substitute_with(raw, |name| std::env::var(name).ok())
}

fn substitute_with(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            bail!("unterminated ${{...}} reference in config");
        };
        let reference = &after[..end];

        let (name, default) = match reference.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (reference, None),
        };
        if name.is_empty() {
            bail!("empty variable name in ${{...}} reference");
        }

        match lookup(name).or_else(|| default.map(str::to_string)) {
            Some(value) => out.push_str(&value),
            None => bail!("environment variable {name} is not set and has no default"),
        }

        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
