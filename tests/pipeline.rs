//! Cross-component pipeline tests: the live path (decode -> bus ->
//! aggregate -> hot store) and the batch path (bronze write -> ETL ->
//! warehouse).

use std::sync::Arc;
use std::time::Duration;

use marketpipe::aggregator::{FeatureWriter, StreamAggregator};
use marketpipe::bus::{BusClient, BusConsumer, BusConsumerConfig, BusProducer, BusProducerConfig, MemoryBus};
use marketpipe::config::{AggregationConfig, DedupConfig, HotStoreConfig};
use marketpipe::etl::{BronzeReader, EtlOrchestrator, MarketDb};
use marketpipe::models::{MarketMessage, Source, Trade};
use marketpipe::sbe::decoder::{encode_best_bid_ask, encode_trade, SbeDecoder};
use marketpipe::store::{
    FsObjectStore, HotStore, MemoryHotStore, ObjectStore, PartitionWriter, PartitionWriterConfig,
};
use rust_decimal_macros::dec;

fn trade(symbol: &str, trade_id: i64, event_ts: i64) -> Trade {
    Trade {
        symbol: symbol.into(),
        event_ts,
        ingest_ts: event_ts + 3,
        trade_id,
        price: dec!(50000.10),
        qty: dec!(0.00150000),
        is_buyer_maker: false,
        source: Source::Rest,
    }
}

fn partition_writer(store: Arc<dyn ObjectStore>) -> PartitionWriter {
    PartitionWriter::new(
        store,
        PartitionWriterConfig {
            bucket: "market-data".into(),
            bronze_prefix: "bronze".into(),
            compression: true,
            buffer_max_records: 1000,
            buffer_timeout: Duration::from_secs(300),
        },
        &DedupConfig::default(),
    )
}

/// Bronze objects written by the partition writer come back out of the
/// ETL as warehouse rows with identical identity and exact decimals.
#[tokio::test]
async fn bronze_roundtrip_lands_identical_rows_in_warehouse() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir.path()));

    let writer = partition_writer(Arc::clone(&store));
    let trades = vec![
        trade("BTCUSDT", 1, 1_700_000_000_000),
        trade("BTCUSDT", 2, 1_700_000_001_000),
        trade("BTCUSDT", 3, 1_700_000_002_000),
    ];
    let written = writer
        .write_agg_trades("BTCUSDT", &trades, 1_700_000_000_000)
        .await
        .unwrap();
    assert_eq!(written, 3);

    let reader = BronzeReader::new(Arc::clone(&store), "market-data", "bronze");
    let db = Arc::new(MarketDb::open_in_memory().unwrap());
    let orchestrator = EtlOrchestrator::new(
        reader,
        Arc::clone(&db),
        marketpipe::config::EtlConfig {
            cycle_interval_seconds: 60,
            batch_size: 100,
            db_path: ":memory:".into(),
        },
    );

    let cycle = orchestrator.run_cycle().await.unwrap();
    assert_eq!(cycle.files_processed, 1);
    assert_eq!(cycle.records_written, 3);

    assert_eq!(db.record_count(Some("BTCUSDT")).unwrap(), 3);
    assert_eq!(
        db.latest_timestamp("BTCUSDT", "aggTrade").unwrap(),
        Some(1_700_000_002_000)
    );

    // Replaying the same upstream data under a new object key is fully
    // absorbed by the unique index. (Give the second object a strictly
    // later mtime so it clears the watermark.)
    tokio::time::sleep(Duration::from_millis(20)).await;
    let writer2 = partition_writer(Arc::clone(&store));
    writer2
        .write_agg_trades("BTCUSDT", &trades, 1_700_000_010_000)
        .await
        .unwrap();
    let cycle = orchestrator.run_cycle().await.unwrap();
    assert_eq!(cycle.duplicate_skips, 3);
    assert_eq!(db.record_count(Some("BTCUSDT")).unwrap(), 3);
}

/// Decoded SBE frames pushed through producer, bus, consumer, and
/// aggregator end up as a feature record under both hot-store keys.
#[tokio::test]
async fn live_path_from_frames_to_hot_store_features() {
    let decoder = SbeDecoder::new(true);
    let frames = vec![
        encode_trade("BTCUSDT", 1_700_000_000_000, 1, (100, 0), (1, 0), true),
        encode_trade("BTCUSDT", 1_700_000_001_000, 2, (102, 0), (2, 0), false),
        encode_trade("BTCUSDT", 1_700_000_002_000, 3, (101, 0), (1, 0), false),
    ];

    let bus = Arc::new(MemoryBus::with_streams(&["market-trades".to_string()], 2));
    let producer = BusProducer::new(
        Arc::clone(&bus) as Arc<dyn BusClient>,
        BusProducerConfig {
            batch_size: 500,
            flush_interval: Duration::from_secs(1),
            op_timeout: Duration::from_secs(10),
        },
    );

    let consumer_config = BusConsumerConfig {
        streams: vec!["market-trades".into()],
        polling_interval: Duration::from_millis(10),
        max_records_per_request: 100,
    };
    // One consumer feeds the test loop; the aggregator gets its own for
    // the service-run path it would use in production.
    let consumer = BusConsumer::new(Arc::clone(&bus) as Arc<dyn BusClient>, consumer_config.clone());
    consumer.start().await.unwrap();

    let hot = Arc::new(MemoryHotStore::new());
    let feature_writer = FeatureWriter::new(
        Arc::clone(&hot) as Arc<dyn HotStore>,
        &HotStoreConfig {
            key_prefix: "features".into(),
            ttl_seconds: 300,
        },
    );
    let aggregator = StreamAggregator::new(
        BusConsumer::new(Arc::clone(&bus) as Arc<dyn BusClient>, consumer_config),
        feature_writer,
        AggregationConfig {
            min_messages: 3,
            max_interval_seconds: 30,
            check_interval_seconds: 1,
            buffer_capacity: 1000,
        },
    );

    for frame in &frames {
        let message = decoder.decode(frame).unwrap();
        producer.publish("market-trades", &message).await.unwrap();
    }
    producer.flush_all().await;
    assert_eq!(bus.stream_len("market-trades"), 3);

    // Drive one poll + aggregation round manually.
    for message in consumer.poll_once().await {
        aggregator.ingest(message);
    }
    aggregator.aggregate_ready().await;

    let latest = hot.get("features:BTCUSDT:latest").await.unwrap().unwrap();
    let features: serde_json::Value = serde_json::from_str(&latest).unwrap();
    assert_eq!(features["price"], 101.0);
    assert_eq!(features["volume"], 4.0);
    assert_eq!(features["vwap"], 101.25);
    assert_eq!(features["buy_volume"], 3.0);
    assert_eq!(features["sell_volume"], 1.0);
    assert_eq!(features["volume_imbalance"], 0.5);
    assert_eq!(features["trade_count"], 3);
    assert_eq!(features["message_type"], "trade");

    let ts = features["timestamp"].as_i64().unwrap();
    let at_key = format!("features:BTCUSDT:{ts}");
    assert_eq!(hot.get(&at_key).await.unwrap().unwrap(), latest);
}

/// Records sharing (symbol, message_type) published by one producer are
/// consumed in publication order.
#[tokio::test]
async fn per_symbol_ordering_survives_producer_and_bus() {
    let bus = Arc::new(MemoryBus::with_streams(&["market-trades".to_string()], 4));
    let producer = BusProducer::new(
        Arc::clone(&bus) as Arc<dyn BusClient>,
        BusProducerConfig {
            batch_size: 10,
            flush_interval: Duration::from_secs(1),
            op_timeout: Duration::from_secs(10),
        },
    );
    let consumer = BusConsumer::new(
        Arc::clone(&bus) as Arc<dyn BusClient>,
        BusConsumerConfig {
            streams: vec!["market-trades".into()],
            polling_interval: Duration::from_millis(10),
            max_records_per_request: 1000,
        },
    );
    consumer.start().await.unwrap();

    for i in 0..50 {
        let message = MarketMessage::Trade(trade("BTCUSDT", i, 1_700_000_000_000 + i));
        producer.publish("market-trades", &message).await.unwrap();
    }
    producer.flush_all().await;

    let mut seen = Vec::new();
    for message in consumer.poll_once().await {
        if message.partition_key == "BTCUSDT" {
            let parsed: MarketMessage = serde_json::from_value(message.data).unwrap();
            if let MarketMessage::Trade(t) = parsed {
                seen.push(t.trade_id);
            }
        }
    }
    assert_eq!(seen, (0..50).collect::<Vec<i64>>());
}

/// Best bid/ask frames make it through to orderbook features.
#[tokio::test]
async fn bba_frames_produce_spread_features() {
    let decoder = SbeDecoder::new(true);
    let frame = encode_best_bid_ask(
        "BTCUSDT",
        1_700_000_000_000,
        (5_000_000, -2),
        (15, -1),
        (5_000_020, -2),
        (25, -1),
    );
    let message = decoder.decode(&frame).unwrap();

    let hot = Arc::new(MemoryHotStore::new());
    let writer = FeatureWriter::new(
        Arc::clone(&hot) as Arc<dyn HotStore>,
        &HotStoreConfig {
            key_prefix: "features".into(),
            ttl_seconds: 300,
        },
    );

    let builder = marketpipe::aggregator::FeatureBuilder::new();
    let features = builder
        .build(
            "BTCUSDT",
            &[message],
            marketpipe::models::MessageType::BestBidAsk,
            1_700_000_001,
        )
        .unwrap();
    writer.write_features("BTCUSDT", &features).await.unwrap();

    let stored = hot.get("features:BTCUSDT:latest").await.unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(&stored).unwrap();
    assert_eq!(value["bid_price"], 50000.0);
    assert_eq!(value["ask_price"], 50000.2);
    assert!((value["spread"].as_f64().unwrap() - 0.2).abs() < 1e-9);
    assert_eq!(value["message_type"], "bestBidAsk");
}
