//! Binary streaming feed: frame decoding and the WebSocket session.

pub mod client;
pub mod decoder;

pub use client::{SbeClient, SbeClientConfig, SessionState};
pub use decoder::{
    FrameHeader, SbeDecodeError, SbeDecoder, EXPECTED_SCHEMA_ID, EXPECTED_SCHEMA_VERSION,
    SBE_HEADER_SIZE, TEMPLATE_BEST_BID_ASK, TEMPLATE_DEPTH_DIFF, TEMPLATE_DEPTH_SNAPSHOT,
    TEMPLATE_TRADE,
};
