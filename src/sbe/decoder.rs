//! SBE frame decoding.
//!
//! Every frame starts with a fixed 8-byte header, four little-endian u16s:
//!
//! ```text
//! Offset  Size  Field
//! 0       2     blockLength
//! 2       2     templateId
//! 4       2     schemaId
//! 6       2     version
//! ```
//!
//! Frames whose `(schemaId, version)` do not match the expected pair are
//! rejected before any field is read. Prices and quantities arrive as
//! (mantissa: i64, exponent: i8) pairs and are reconstructed as decimals
//! directly; they never pass through binary floating point.
//!
//! Body layout after the header (all integers little-endian, decimals as
//! mantissa + exponent, symbol as a length-prefixed ASCII string at the
//! end of the body):
//!
//! * trade (10000): event_time i64, trade_id i64, price, qty,
//!   is_buyer_maker u8, symbol
//! * bestBidAsk (10001): event_time i64, bid_px, bid_sz, ask_px, ask_sz,
//!   symbol
//! * depth (10002 diff / 10003 snapshot): event_time i64,
//!   last_update_id i64, bid_count u16, ask_count u16, bid levels,
//!   ask levels, symbol; each level is price + qty

use rust_decimal::Decimal;

use crate::models::{
    format_level, now_ms, BestBidAsk, DepthSnapshot, MarketMessage, MessageType, Source, Trade,
};

pub const SBE_HEADER_SIZE: usize = 8;

pub const EXPECTED_SCHEMA_ID: u16 = 1;
pub const EXPECTED_SCHEMA_VERSION: u16 = 0;

pub const TEMPLATE_TRADE: u16 = 10_000;
pub const TEMPLATE_BEST_BID_ASK: u16 = 10_001;
pub const TEMPLATE_DEPTH_DIFF: u16 = 10_002;
pub const TEMPLATE_DEPTH_SNAPSHOT: u16 = 10_003;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SbeDecodeError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("schema mismatch: got {schema_id}:{version}, expected {expected_id}:{expected_version}")]
    SchemaMismatch {
        schema_id: u16,
        version: u16,
        expected_id: u16,
        expected_version: u16,
    },
    #[error("unknown template id {0}")]
    UnknownTemplate(u16),
    #[error("truncated body reading {0}")]
    Truncated(&'static str),
    #[error("symbol is not valid ASCII")]
    BadSymbol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub block_length: u16,
    pub template_id: u16,
    pub schema_id: u16,
    pub version: u16,
}

impl FrameHeader {
    pub fn parse(frame: &[u8]) -> Result<Self, SbeDecodeError> {
        if frame.len() < SBE_HEADER_SIZE {
            return Err(SbeDecodeError::TooShort(frame.len()));
        }
        let u16_at = |offset: usize| u16::from_le_bytes([frame[offset], frame[offset + 1]]);
        Ok(Self {
            block_length: u16_at(0),
            template_id: u16_at(2),
            schema_id: u16_at(4),
            version: u16_at(6),
        })
    }
}

/// Cursor over a frame body.
struct Body<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Body<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], SbeDecodeError> {
        if self.pos + n > self.bytes.len() {
            return Err(SbeDecodeError::Truncated(field));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn i64(&mut self, field: &'static str) -> Result<i64, SbeDecodeError> {
        let bytes = self.take(8, field)?;
        Ok(i64::from_le_bytes(bytes.try_into().expect("8 bytes")))
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, SbeDecodeError> {
        let bytes = self.take(2, field)?;
        Ok(u16::from_le_bytes(bytes.try_into().expect("2 bytes")))
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, SbeDecodeError> {
        Ok(self.take(1, field)?[0])
    }

    /// Mantissa + exponent, reconstructed without a float round-trip.
    fn decimal(&mut self, field: &'static str) -> Result<Decimal, SbeDecodeError> {
        let mantissa = self.i64(field)?;
        let exponent = self.u8(field)? as i8;
        Ok(decimal_from_parts(mantissa, exponent))
    }

    fn symbol(&mut self) -> Result<String, SbeDecodeError> {
        let len = self.u8("symbol length")? as usize;
        let bytes = self.take(len, "symbol")?;
        let symbol = std::str::from_utf8(bytes).map_err(|_| SbeDecodeError::BadSymbol)?;
        if !symbol.is_ascii() {
            return Err(SbeDecodeError::BadSymbol);
        }
        Ok(symbol.to_uppercase())
    }
}

/// `mantissa * 10^exponent` as an exact decimal.
pub fn decimal_from_parts(mantissa: i64, exponent: i8) -> Decimal {
    if exponent <= 0 {
        Decimal::from_i128_with_scale(mantissa as i128, (-exponent) as u32)
    } else {
        Decimal::from_i128_with_scale(mantissa as i128 * 10i128.pow(exponent as u32), 0)
    }
}

/// Stateless frame decoder. `strict` controls the unknown-template policy:
/// strict rejects, lax falls back to the trade layout for first-day
/// compatibility with a schema bump.
pub struct SbeDecoder {
    strict: bool,
}

impl SbeDecoder {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Header sanity check without decoding the body.
    pub fn is_valid_frame(&self, frame: &[u8]) -> bool {
        FrameHeader::parse(frame)
            .map(|h| {
                h.schema_id == EXPECTED_SCHEMA_ID && h.version == EXPECTED_SCHEMA_VERSION
            })
            .unwrap_or(false)
    }

    pub fn message_type_for(&self, template_id: u16) -> Result<MessageType, SbeDecodeError> {
        match template_id {
            TEMPLATE_TRADE => Ok(MessageType::Trade),
            TEMPLATE_BEST_BID_ASK => Ok(MessageType::BestBidAsk),
            TEMPLATE_DEPTH_DIFF | TEMPLATE_DEPTH_SNAPSHOT => Ok(MessageType::Depth),
            other if self.strict => Err(SbeDecodeError::UnknownTemplate(other)),
            // Lax mode: unknown templates are treated as trades.
            _ => Ok(MessageType::Trade),
        }
    }

    pub fn decode(&self, frame: &[u8]) -> Result<MarketMessage, SbeDecodeError> {
        let header = FrameHeader::parse(frame)?;
        if header.schema_id != EXPECTED_SCHEMA_ID || header.version != EXPECTED_SCHEMA_VERSION {
            return Err(SbeDecodeError::SchemaMismatch {
                schema_id: header.schema_id,
                version: header.version,
                expected_id: EXPECTED_SCHEMA_ID,
                expected_version: EXPECTED_SCHEMA_VERSION,
            });
        }

        let message_type = self.message_type_for(header.template_id)?;
        let mut body = Body::new(&frame[SBE_HEADER_SIZE..]);

        match message_type {
            MessageType::Trade => {
                let event_ts = body.i64("event_time")?;
                let trade_id = body.i64("trade_id")?;
                let price = body.decimal("price")?;
                let qty = body.decimal("qty")?;
                let is_buyer_maker = body.u8("is_buyer_maker")? != 0;
                let symbol = body.symbol()?;
                Ok(MarketMessage::Trade(Trade {
                    symbol,
                    event_ts,
                    ingest_ts: now_ms(),
                    trade_id,
                    price,
                    qty,
                    is_buyer_maker,
                    source: Source::Sbe,
                }))
            }
            MessageType::BestBidAsk => {
                let event_ts = body.i64("event_time")?;
                let bid_px = body.decimal("bid_px")?;
                let bid_sz = body.decimal("bid_sz")?;
                let ask_px = body.decimal("ask_px")?;
                let ask_sz = body.decimal("ask_sz")?;
                let symbol = body.symbol()?;
                Ok(MarketMessage::BestBidAsk(BestBidAsk {
                    symbol,
                    event_ts,
                    ingest_ts: now_ms(),
                    bid_px,
                    bid_sz,
                    ask_px,
                    ask_sz,
                    source: Source::Sbe,
                }))
            }
            MessageType::Depth => {
                let event_ts = body.i64("event_time")?;
                let last_update_id = body.i64("last_update_id")?;
                let bid_count = body.u16("bid_count")? as usize;
                let ask_count = body.u16("ask_count")? as usize;

                let mut read_levels = |count: usize| -> Result<Vec<[String; 2]>, SbeDecodeError> {
                    let mut levels = Vec::with_capacity(count);
                    for _ in 0..count {
                        let price = body.decimal("level price")?;
                        let qty = body.decimal("level qty")?;
                        levels.push([format_level(price), format_level(qty)]);
                    }
                    Ok(levels)
                };
                let bids = read_levels(bid_count)?;
                let asks = read_levels(ask_count)?;
                let symbol = body.symbol()?;

                Ok(MarketMessage::Depth(DepthSnapshot {
                    symbol,
                    event_ts,
                    ingest_ts: now_ms(),
                    bids,
                    asks,
                    last_update_id: Some(last_update_id),
                    source: Source::Sbe,
                }))
            }
        }
    }
}

// =============================================================================
// ENCODING (replay tooling and tests)
// =============================================================================

fn put_header(out: &mut Vec<u8>, template_id: u16, body_len: usize) {
    out.extend_from_slice(&(body_len as u16).to_le_bytes());
    out.extend_from_slice(&template_id.to_le_bytes());
    out.extend_from_slice(&EXPECTED_SCHEMA_ID.to_le_bytes());
    out.extend_from_slice(&EXPECTED_SCHEMA_VERSION.to_le_bytes());
}

fn put_decimal(out: &mut Vec<u8>, mantissa: i64, exponent: i8) {
    out.extend_from_slice(&mantissa.to_le_bytes());
    out.push(exponent as u8);
}

fn put_symbol(out: &mut Vec<u8>, symbol: &str) {
    out.push(symbol.len() as u8);
    out.extend_from_slice(symbol.as_bytes());
}

pub fn encode_trade(
    symbol: &str,
    event_ts: i64,
    trade_id: i64,
    price: (i64, i8),
    qty: (i64, i8),
    is_buyer_maker: bool,
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&event_ts.to_le_bytes());
    body.extend_from_slice(&trade_id.to_le_bytes());
    put_decimal(&mut body, price.0, price.1);
    put_decimal(&mut body, qty.0, qty.1);
    body.push(is_buyer_maker as u8);
    put_symbol(&mut body, symbol);

    let mut frame = Vec::with_capacity(SBE_HEADER_SIZE + body.len());
    put_header(&mut frame, TEMPLATE_TRADE, body.len());
    frame.extend_from_slice(&body);
    frame
}

pub fn encode_best_bid_ask(
    symbol: &str,
    event_ts: i64,
    bid_px: (i64, i8),
    bid_sz: (i64, i8),
    ask_px: (i64, i8),
    ask_sz: (i64, i8),
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&event_ts.to_le_bytes());
    put_decimal(&mut body, bid_px.0, bid_px.1);
    put_decimal(&mut body, bid_sz.0, bid_sz.1);
    put_decimal(&mut body, ask_px.0, ask_px.1);
    put_decimal(&mut body, ask_sz.0, ask_sz.1);
    put_symbol(&mut body, symbol);

    let mut frame = Vec::with_capacity(SBE_HEADER_SIZE + body.len());
    put_header(&mut frame, TEMPLATE_BEST_BID_ASK, body.len());
    frame.extend_from_slice(&body);
    frame
}

#[allow(clippy::type_complexity)]
pub fn encode_depth(
    symbol: &str,
    event_ts: i64,
    last_update_id: i64,
    bids: &[((i64, i8), (i64, i8))],
    asks: &[((i64, i8), (i64, i8))],
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&event_ts.to_le_bytes());
    body.extend_from_slice(&last_update_id.to_le_bytes());
    body.extend_from_slice(&(bids.len() as u16).to_le_bytes());
    body.extend_from_slice(&(asks.len() as u16).to_le_bytes());
    for (price, qty) in bids.iter().chain(asks.iter()) {
        put_decimal(&mut body, price.0, price.1);
        put_decimal(&mut body, qty.0, qty.1);
    }
    put_symbol(&mut body, symbol);

    let mut frame = Vec::with_capacity(SBE_HEADER_SIZE + body.len());
    put_header(&mut frame, TEMPLATE_DEPTH_SNAPSHOT, body.len());
    frame.extend_from_slice(&body);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_parses_little_endian() {
        let frame = encode_trade("BTCUSDT", 1, 2, (3, 0), (4, 0), false);
        let header = FrameHeader::parse(&frame).unwrap();
        assert_eq!(header.template_id, TEMPLATE_TRADE);
        assert_eq!(header.schema_id, EXPECTED_SCHEMA_ID);
        assert_eq!(header.version, EXPECTED_SCHEMA_VERSION);
    }

    #[test]
    fn trade_roundtrip_reconstructs_exact_decimals() {
        let decoder = SbeDecoder::new(true);
        // price 50000.10 = 5000010 * 10^-2, qty 0.00150000 = 150000 * 10^-8
        let frame = encode_trade(
            "btcusdt",
            1_700_000_000_000,
            42,
            (5_000_010, -2),
            (150_000, -8),
            true,
        );

        let MarketMessage::Trade(trade) = decoder.decode(&frame).unwrap() else {
            panic!("expected trade");
        };
        assert_eq!(trade.symbol, "BTCUSDT");
        assert_eq!(trade.trade_id, 42);
        assert_eq!(trade.price.to_string(), "50000.10");
        assert_eq!(trade.qty.to_string(), "0.00150000");
        assert!(trade.is_buyer_maker);
        assert_eq!(trade.source, Source::Sbe);
    }

    #[test]
    fn schema_mismatch_rejected_before_body() {
        let decoder = SbeDecoder::new(true);
        let mut frame = encode_trade("BTCUSDT", 1, 2, (3, 0), (4, 0), false);
        frame[4] = 9; // schemaId -> 9

        let err = decoder.decode(&frame).unwrap_err();
        assert!(matches!(err, SbeDecodeError::SchemaMismatch { schema_id: 9, .. }));
    }

    #[test]
    fn unknown_template_strict_vs_lax() {
        let frame_body = encode_trade("BTCUSDT", 1, 2, (3, 0), (4, 0), false);
        let mut frame = frame_body.clone();
        frame[2..4].copy_from_slice(&10_042u16.to_le_bytes());

        let strict = SbeDecoder::new(true);
        assert_eq!(
            strict.decode(&frame).unwrap_err(),
            SbeDecodeError::UnknownTemplate(10_042)
        );

        // Lax mode decodes the unknown template with the trade layout.
        let lax = SbeDecoder::new(false);
        assert!(matches!(
            lax.decode(&frame).unwrap(),
            MarketMessage::Trade(_)
        ));
    }

    #[test]
    fn short_and_truncated_frames_are_rejected() {
        let decoder = SbeDecoder::new(true);
        assert_eq!(
            decoder.decode(&[0u8; 4]).unwrap_err(),
            SbeDecodeError::TooShort(4)
        );

        let frame = encode_trade("BTCUSDT", 1, 2, (3, 0), (4, 0), false);
        let truncated = &frame[..frame.len() - 10];
        assert!(matches!(
            decoder.decode(truncated).unwrap_err(),
            SbeDecodeError::Truncated(_)
        ));
    }

    #[test]
    fn best_bid_ask_roundtrip() {
        let decoder = SbeDecoder::new(true);
        let frame = encode_best_bid_ask(
            "ethusdt",
            1_700_000_000_123,
            (300_001, -2),
            (15, -1),
            (300_002, -2),
            (25, -1),
        );

        let MarketMessage::BestBidAsk(bba) = decoder.decode(&frame).unwrap() else {
            panic!("expected bestBidAsk");
        };
        assert_eq!(bba.symbol, "ETHUSDT");
        assert_eq!(bba.bid_px.to_string(), "3000.01");
        assert_eq!(bba.ask_px.to_string(), "3000.02");
        assert_eq!(bba.bid_sz.to_string(), "1.5");
    }

    #[test]
    fn depth_levels_format_compactly_and_keep_order() {
        let decoder = SbeDecoder::new(true);
        let frame = encode_depth(
            "BTCUSDT",
            1_700_000_000_000,
            987_654,
            &[((5_000_010, -2), (15, -1)), ((5_000_000, -2), (30, -1))],
            &[((5_000_020, -2), (20, -1))],
        );

        let MarketMessage::Depth(depth) = decoder.decode(&frame).unwrap() else {
            panic!("expected depth");
        };
        assert_eq!(depth.last_update_id, Some(987_654));
        assert_eq!(depth.bids.len(), 2);
        // Compact rendering: no trailing zeros.
        assert_eq!(depth.bids[0], ["50000.1".to_string(), "1.5".to_string()]);
        assert_eq!(depth.bids[1], ["50000".to_string(), "3".to_string()]);
        assert_eq!(depth.asks[0], ["50000.2".to_string(), "2".to_string()]);
    }

    #[test]
    fn decimal_from_parts_handles_positive_exponent() {
        assert_eq!(decimal_from_parts(5, 2).to_string(), "500");
        assert_eq!(decimal_from_parts(-15, -1).to_string(), "-1.5");
        assert_eq!(decimal_from_parts(0, -8).to_string(), "0.00000000");
    }
}
