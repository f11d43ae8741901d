//! SBE WebSocket session.
//!
//! One logical connection carrying binary frames for the configured
//! `{trade, bestBidAsk, depth} x symbols` subset. The session is driven by
//! a state machine; reconnects back off as `min(2^attempts, 60)` seconds
//! and give up for good after ten straight failures. A decode-error storm
//! (>5% of frames over the last minute) or thirty seconds of silence also
//! force a reconnect.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use super::decoder::SbeDecoder;
use crate::config::ExchangeConfig;
use crate::health::HealthReport;
use crate::models::{now_ms, MarketMessage, MessageType};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STALE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const MAX_BACKOFF_SECS: u64 = 60;
const ERROR_RATE_WINDOW: Duration = Duration::from_secs(60);
const ERROR_RATE_LIMIT: f64 = 0.05;

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Why a connection attempt ended.
enum ConnectionEnd {
    Shutdown,
    TransportClosed,
    Stale,
    DecodeStorm,
}

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone)]
pub struct SbeClientConfig {
    pub ws_url: String,
    pub api_key: Option<String>,
    pub symbols: Vec<String>,
    pub message_types: Vec<MessageType>,
    pub strict_schema: bool,
}

impl From<&ExchangeConfig> for SbeClientConfig {
    fn from(exchange: &ExchangeConfig) -> Self {
        let mut message_types: Vec<MessageType> = exchange
            .message_types
            .iter()
            .filter_map(|s| MessageType::parse(s))
            .collect();
        if message_types.is_empty() {
            message_types = vec![MessageType::Trade, MessageType::BestBidAsk, MessageType::Depth];
        }
        Self {
            ws_url: exchange.sbe_ws_url.clone(),
            api_key: exchange.api_key.clone(),
            symbols: exchange.symbols.clone(),
            message_types,
            strict_schema: exchange.strict_schema,
        }
    }
}

impl SbeClientConfig {
    /// Subscription path: `<symbol_lower>@<type>` segments joined by `/`.
    pub fn stream_path(&self) -> String {
        let mut streams = Vec::new();
        for symbol in &self.symbols {
            let lower = symbol.to_lowercase();
            for message_type in &self.message_types {
                streams.push(format!("{lower}@{}", message_type.as_str()));
            }
        }
        if streams.is_empty() {
            "btcusdt@trade".to_string()
        } else {
            streams.join("/")
        }
    }

    pub fn url(&self) -> String {
        format!("{}/{}", self.ws_url.trim_end_matches('/'), self.stream_path())
    }
}

// =============================================================================
// HANDLERS & STATS
// =============================================================================

/// Typed sink for normalized records. Handlers are invoked sequentially
/// from the read path and must only enqueue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: MarketMessage) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct SbeClientStats {
    pub messages_received: AtomicU64,
    pub messages_processed: AtomicU64,
    pub decode_errors: AtomicU64,
    pub handler_errors: AtomicU64,
    pub connection_count: AtomicU64,
    pub last_message_ms: AtomicI64,
}

/// Rolling one-minute window of (frame, was-error) observations.
struct ErrorWindow {
    samples: VecDeque<(i64, bool)>,
}

impl ErrorWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }

    fn record(&mut self, now: i64, is_error: bool) {
        self.samples.push_back((now, is_error));
        self.prune(now);
    }

    fn prune(&mut self, now: i64) {
        let cutoff = now - ERROR_RATE_WINDOW.as_millis() as i64;
        while self.samples.front().is_some_and(|(ts, _)| *ts < cutoff) {
            self.samples.pop_front();
        }
    }

    fn rate(&mut self, now: i64) -> f64 {
        self.prune(now);
        if self.samples.is_empty() {
            return 0.0;
        }
        let errors = self.samples.iter().filter(|(_, e)| *e).count();
        errors as f64 / self.samples.len() as f64
    }
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct SbeClient {
    config: SbeClientConfig,
    decoder: SbeDecoder,
    handlers: RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>,
    state: RwLock<SessionState>,
    running: AtomicBool,
    error_window: Mutex<ErrorWindow>,
    pub stats: SbeClientStats,
}

impl SbeClient {
    pub fn new(config: SbeClientConfig) -> Arc<Self> {
        let strict = config.strict_schema;
        Arc::new(Self {
            config,
            decoder: SbeDecoder::new(strict),
            handlers: RwLock::new(HashMap::new()),
            state: RwLock::new(SessionState::Disconnected),
            running: AtomicBool::new(false),
            error_window: Mutex::new(ErrorWindow::new()),
            stats: SbeClientStats::default(),
        })
    }

    pub fn register_handler(&self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().insert(message_type, handler);
        info!(message_type = %message_type, "handler_registered");
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn transition(&self, new_state: SessionState, reason: &str) {
        let old = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };
        if old != new_state {
            info!(from = %old, to = %new_state, reason, "session_transition");
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.transition(SessionState::Closed, "operator_stop");
    }

    /// Backoff before reconnect attempt `attempt` (1-based).
    fn backoff_for_attempt(attempt: u32) -> Duration {
        Duration::from_secs(2u64.saturating_pow(attempt).min(MAX_BACKOFF_SECS))
    }

    /// Drive the connection until stopped or the reconnect budget is
    /// exhausted (which is fatal and surfaces as an error).
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let mut attempts: u32 = 0;

        while self.running.load(Ordering::SeqCst) {
            self.transition(SessionState::Connecting, "connect");
            let connections_before = self.stats.connection_count.load(Ordering::Relaxed);

            let outcome = self.run_connection().await;

            // A completed handshake resets the reconnect budget.
            if self.stats.connection_count.load(Ordering::Relaxed) > connections_before {
                attempts = 0;
            }

            match outcome {
                Ok(ConnectionEnd::Shutdown) => {
                    self.transition(SessionState::Closed, "shutdown");
                    return Ok(());
                }
                Ok(end) => {
                    let reason = match end {
                        ConnectionEnd::TransportClosed => "transport_closed",
                        ConnectionEnd::Stale => "no_data",
                        ConnectionEnd::DecodeStorm => "decode_error_storm",
                        ConnectionEnd::Shutdown => unreachable!(),
                    };
                    attempts += 1;
                    if attempts >= MAX_RECONNECT_ATTEMPTS {
                        self.transition(SessionState::Closed, "reconnect_budget_exhausted");
                        anyhow::bail!("streaming client exhausted {MAX_RECONNECT_ATTEMPTS} reconnect attempts");
                    }
                    self.transition(SessionState::Reconnecting, reason);
                    let backoff = Self::backoff_for_attempt(attempts);
                    info!(attempt = attempts, backoff_secs = backoff.as_secs(), "reconnect_backoff");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= MAX_RECONNECT_ATTEMPTS {
                        self.transition(SessionState::Closed, "reconnect_budget_exhausted");
                        return Err(e.context(format!(
                            "streaming client exhausted {MAX_RECONNECT_ATTEMPTS} reconnect attempts"
                        )));
                    }
                    error!(error = %e, attempt = attempts, "connection_error");
                    self.transition(SessionState::Reconnecting, "connect_error");
                    tokio::time::sleep(Self::backoff_for_attempt(attempts)).await;
                }
            }
        }

        self.transition(SessionState::Closed, "stopped");
        Ok(())
    }

    async fn run_connection(&self) -> Result<ConnectionEnd> {
        let url = self.config.url();
        debug!(url = %url, "connecting");

        let mut request = url
            .as_str()
            .into_client_request()
            .context("invalid stream URL")?;
        match &self.config.api_key {
            Some(key) => {
                request.headers_mut().insert(
                    "X-MBX-APIKEY",
                    key.parse().context("API key is not a valid header value")?,
                );
            }
            None => warn!("no API key configured; the SBE feed requires authentication"),
        }

        let (ws, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .context("connect timeout")?
            .context("websocket connect failed")?;

        self.stats.connection_count.fetch_add(1, Ordering::Relaxed);
        self.transition(SessionState::Connected, "handshake_ok");

        let (mut write, mut read) = ws.split();

        loop {
            if !self.running.load(Ordering::SeqCst) {
                let _ = write.send(Message::Close(None)).await;
                return Ok(ConnectionEnd::Shutdown);
            }

            // A quiet wire for the staleness window forces a reconnect.
            let frame = match tokio::time::timeout(STALE_TIMEOUT, read.next()).await {
                Ok(frame) => frame,
                Err(_) => {
                    warn!(timeout_secs = STALE_TIMEOUT.as_secs(), "stream_stale");
                    return Ok(ConnectionEnd::Stale);
                }
            };

            match frame {
                Some(Ok(Message::Binary(data))) => {
                    if self.on_frame(&data).await {
                        continue;
                    }
                    return Ok(ConnectionEnd::DecodeStorm);
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "server_close");
                    return Ok(ConnectionEnd::TransportClosed);
                }
                Some(Ok(other)) => {
                    debug!(kind = ?other, "non_binary_message_ignored");
                }
                Some(Err(e)) => {
                    warn!(error = %e, "ws_error");
                    return Ok(ConnectionEnd::TransportClosed);
                }
                None => {
                    warn!("stream_ended");
                    return Ok(ConnectionEnd::TransportClosed);
                }
            }
        }
    }

    /// Decode one frame and dispatch it. Returns false when the rolling
    /// decode-error rate crossed the storm threshold.
    async fn on_frame(&self, data: &[u8]) -> bool {
        let now = now_ms();
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        self.stats.last_message_ms.store(now, Ordering::Relaxed);

        match self.decoder.decode(data) {
            Ok(message) => {
                self.error_window.lock().record(now, false);
                self.dispatch(message).await;
                true
            }
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, frame_len = data.len(), "decode_error");
                let rate = {
                    let mut window = self.error_window.lock();
                    window.record(now, true);
                    window.rate(now)
                };
                rate <= ERROR_RATE_LIMIT
            }
        }
    }

    async fn dispatch(&self, message: MarketMessage) {
        let handler = self.handlers.read().get(&message.message_type()).cloned();
        match handler {
            Some(handler) => {
                if let Err(e) = handler.handle(message).await {
                    self.stats.handler_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "handler_error");
                } else {
                    self.stats.messages_processed.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                debug!(message_type = %message.message_type(), "no_handler_registered");
            }
        }
    }

    pub fn decode_error_rate(&self) -> f64 {
        self.error_window.lock().rate(now_ms())
    }

    pub fn is_healthy(&self) -> bool {
        let connected = self.state() == SessionState::Connected;
        let last = self.stats.last_message_ms.load(Ordering::Relaxed);
        let fresh = last > 0 && now_ms() - last <= STALE_TIMEOUT.as_millis() as i64;
        connected && fresh && self.decode_error_rate() <= ERROR_RATE_LIMIT
    }

    pub fn stats_json(&self) -> serde_json::Value {
        serde_json::json!({
            "state": self.state().to_string(),
            "messages_received": self.stats.messages_received.load(Ordering::Relaxed),
            "messages_processed": self.stats.messages_processed.load(Ordering::Relaxed),
            "decode_errors": self.stats.decode_errors.load(Ordering::Relaxed),
            "handler_errors": self.stats.handler_errors.load(Ordering::Relaxed),
            "connection_count": self.stats.connection_count.load(Ordering::Relaxed),
            "decode_error_rate": self.decode_error_rate(),
        })
    }

    pub fn health_check(&self) -> HealthReport {
        let mut issues = Vec::new();

        if self.state() != SessionState::Connected {
            issues.push(format!("session is {}", self.state()));
        }
        let last = self.stats.last_message_ms.load(Ordering::Relaxed);
        if last > 0 {
            let age_ms = now_ms() - last;
            if age_ms > STALE_TIMEOUT.as_millis() as i64 {
                issues.push(format!("no messages for {}s", age_ms / 1000));
            }
        }
        let rate = self.decode_error_rate();
        if rate > ERROR_RATE_LIMIT {
            issues.push(format!("decode error rate {:.1}%", rate * 100.0));
        }

        if issues.is_empty() {
            HealthReport::healthy(self.stats_json())
        } else {
            HealthReport::unhealthy(issues, self.stats_json())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sbe::decoder::encode_trade;

    fn client(strict: bool) -> Arc<SbeClient> {
        SbeClient::new(SbeClientConfig {
            ws_url: "wss://example.test/stream".into(),
            api_key: Some("key".into()),
            symbols: vec!["BTCUSDT".into(), "ETHUSDT".into()],
            message_types: vec![MessageType::Trade, MessageType::Depth],
            strict_schema: strict,
        })
    }

    struct Collector(Mutex<Vec<MarketMessage>>);

    #[async_trait]
    impl MessageHandler for Collector {
        async fn handle(&self, message: MarketMessage) -> Result<()> {
            self.0.lock().push(message);
            Ok(())
        }
    }

    #[test]
    fn stream_path_covers_symbol_type_product() {
        let client = client(true);
        assert_eq!(
            client.config.stream_path(),
            "btcusdt@trade/btcusdt@depth/ethusdt@trade/ethusdt@depth"
        );
        assert!(client.config.url().starts_with("wss://example.test/stream/"));
    }

    #[test]
    fn backoff_doubles_then_caps_at_sixty() {
        assert_eq!(SbeClient::backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(SbeClient::backoff_for_attempt(3), Duration::from_secs(8));
        assert_eq!(SbeClient::backoff_for_attempt(6), Duration::from_secs(60));
        assert_eq!(SbeClient::backoff_for_attempt(10), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn frames_dispatch_to_registered_handler() {
        let client = client(true);
        let collector = Arc::new(Collector(Mutex::new(Vec::new())));
        client.register_handler(MessageType::Trade, collector.clone());

        let frame = encode_trade("BTCUSDT", 1_700_000_000_000, 7, (5_000_010, -2), (5, -1), false);
        assert!(client.on_frame(&frame).await);

        let seen = collector.0.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].symbol(), "BTCUSDT");
        assert_eq!(client.stats.messages_processed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn bad_frames_count_and_eventually_trip_the_storm() {
        let client = client(true);

        // One bad frame among many good ones stays under the 5% line.
        let good = encode_trade("BTCUSDT", 1, 1, (1, 0), (1, 0), false);
        for _ in 0..40 {
            assert!(client.on_frame(&good).await);
        }
        assert!(client.on_frame(b"garbage").await);
        assert!(client.decode_error_rate() <= ERROR_RATE_LIMIT);

        // A run of bad frames crosses it and requests a reconnect.
        let mut tripped = false;
        for _ in 0..5 {
            if !client.on_frame(b"garbage").await {
                tripped = true;
                break;
            }
        }
        assert!(tripped);
        assert!(client.stats.decode_errors.load(Ordering::Relaxed) >= 2);
    }

    #[tokio::test]
    async fn schema_mismatch_drops_frame_and_counts() {
        let client = client(true);
        let mut frame = encode_trade("BTCUSDT", 1, 1, (1, 0), (1, 0), false);
        frame[4] = 99;

        client.on_frame(&frame).await;
        assert_eq!(client.stats.decode_errors.load(Ordering::Relaxed), 1);
        assert_eq!(client.stats.messages_processed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn health_requires_connected_and_fresh() {
        let client = client(true);
        assert!(!client.is_healthy());

        client.transition(SessionState::Connected, "test");
        client
            .stats
            .last_message_ms
            .store(now_ms(), Ordering::Relaxed);
        assert!(client.is_healthy());

        client
            .stats
            .last_message_ms
            .store(now_ms() - 31_000, Ordering::Relaxed);
        assert!(!client.is_healthy());
        let report = client.health_check();
        assert!(!report.is_healthy());
    }

    #[test]
    fn stop_transitions_to_closed() {
        let client = client(true);
        client.stop();
        assert_eq!(client.state(), SessionState::Closed);
    }
}
