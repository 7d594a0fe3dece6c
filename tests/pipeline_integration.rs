//! End-to-end pipeline tests: scripted gateway -> scheduler sweep ->
//! change detection -> queue -> drain -> store writes + room broadcast.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use uuid::Uuid;

use quotewire::{
    ingest::scheduler::{IngestScheduler, SchedulerConfig, SweepSpec},
    market::{
        detector::ChangeDetector,
        gateway::{FetchError, QuoteGateway},
        types::{InstrumentSnapshot, UpdateRecord, UpdateSource},
    },
    metrics::counters::Counters,
    queue::{
        UpdateQueue,
        batch::{BatchProcessor, DrainConfig, DrainOutcome},
    },
    resilience::{BreakerConfig, Resilience, RetryPolicy},
    rooms::{
        connection::Frame,
        manager::{ConnectionManager, RoomConfig},
    },
    store::{SnapshotStore, keys, memory::MemorySnapshotStore},
};

const VOLUME: u64 = 1_000;

// -----------------------
// Scripted gateway + harness
// -----------------------

/// Returns the next scripted price per symbol; an exhausted or missing
/// script fails transiently, like an unavailable upstream.
struct ScriptedGateway {
    prices: Mutex<HashMap<String, VecDeque<f64>>>,
}

impl ScriptedGateway {
    fn new(scripts: &[(&str, &[f64])]) -> Self {
        Self {
            prices: Mutex::new(
                scripts
                    .iter()
                    .map(|(sym, prices)| (sym.to_string(), prices.iter().copied().collect()))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl QuoteGateway for ScriptedGateway {
    async fn fetch(&self, symbol: &str) -> Result<InstrumentSnapshot, FetchError> {
        let price = self
            .prices
            .lock()
            .get_mut(symbol)
            .and_then(|q| q.pop_front())
            .ok_or_else(|| FetchError::Transient("upstream unavailable".to_string()))?;

        Ok(InstrumentSnapshot {
            symbol: symbol.to_string(),
            price,
            change: price - 100.0,
            change_percent: price - 100.0,
            volume: VOLUME,
            open: 100.0,
            high: price.max(100.0),
            low: price.min(100.0),
            previous_close: 100.0,
            market_cap: None,
            source: "scripted-feed".to_string(),
            captured_at: Utc::now(),
        })
    }
}

struct Pipeline {
    scheduler: Arc<IngestScheduler<ScriptedGateway>>,
    processor: Arc<BatchProcessor>,
    queue: Arc<UpdateQueue>,
    store: Arc<dyn SnapshotStore>,
    rooms: Arc<ConnectionManager>,
}

fn pipeline(gateway: ScriptedGateway, universe: &[&str]) -> Pipeline {
    let mut retry = RetryPolicy::new(1, Duration::from_millis(1), 2.0, Duration::from_millis(2));
    retry.jitter = false;
    let resilience = Arc::new(Resilience::new(retry, BreakerConfig::default()));

    let queue = Arc::new(UpdateQueue::new());
    let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
    let counters = Counters::default();

    let rooms = Arc::new(ConnectionManager::new(
        Arc::clone(&store),
        RoomConfig::default(),
        counters.clone(),
    ));

    let processor = Arc::new(BatchProcessor::new(
        Arc::clone(&queue),
        Arc::clone(&store),
        Arc::clone(&resilience),
        Arc::clone(&rooms),
        DrainConfig::default(),
        counters.clone(),
    ));

    let scheduler = Arc::new(IngestScheduler::new(
        Arc::new(gateway),
        resilience,
        Arc::new(ChangeDetector::new(0.001)),
        Arc::clone(&queue),
        Arc::clone(&store),
        Arc::clone(&rooms),
        SchedulerConfig {
            sweep_batch_size: 2,
            inter_batch_pause: Duration::from_millis(1),
            summary_ttl_secs: 60,
        },
        counters,
    ));

    scheduler.register_group(SweepSpec {
        group: "universe".to_string(),
        symbols: universe.iter().map(|s| s.to_string()).collect(),
        source: UpdateSource::FullSweep,
        interval: Duration::from_secs(3_600),
    });

    Pipeline {
        scheduler,
        processor,
        queue,
        store,
        rooms,
    }
}

fn connect(rooms: &ConnectionManager) -> (Uuid, UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (rooms.connect(tx), rx)
}

fn drain_frames(rx: &mut UnboundedReceiver<Frame>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let Frame::Text(t) = frame {
            out.push(serde_json::from_str(&t).unwrap());
        }
    }
    out
}

fn stock_updates(msgs: &[Value]) -> Vec<(String, f64)> {
    msgs.iter()
        .filter(|m| m["type"] == "stock_update")
        .map(|m| {
            (
                m["symbol"].as_str().unwrap().to_string(),
                m["data"]["price"].as_f64().unwrap(),
            )
        })
        .collect()
}

// -----------------------
// Scenarios
// -----------------------

#[tokio::test]
async fn epsilon_scenario_suppresses_noise_and_broadcasts_material_moves() {
    let p = pipeline(
        ScriptedGateway::new(&[
            ("AAA", &[100.0, 100.0005, 101.0]),
            ("BBB", &[50.0, 50.0, 50.0]),
        ]),
        &["AAA", "BBB"],
    );

    let (sub, mut rx) = connect(&p.rooms);
    p.rooms
        .handle_message(sub, r#"{"type":"subscribe","symbols":["AAA"]}"#)
        .await;
    drain_frames(&mut rx);

    // Sweep 1: both instruments are first-seen, both broadcast. The
    // subscriber sits in the global room too, so it sees BBB as well.
    p.scheduler.run_sweep_once("universe").await.unwrap();
    assert_eq!(p.processor.drain_once().await, DrainOutcome::Completed(2));

    let mut seen: Vec<String> = stock_updates(&drain_frames(&mut rx))
        .into_iter()
        .map(|(sym, _)| sym)
        .collect();
    seen.sort();
    seen.dedup();
    assert_eq!(seen, ["AAA", "BBB"]);

    // Sweep 2: AAA moves within epsilon at unchanged volume, BBB is
    // flat. Nothing broadcasts, but the cache still refreshes.
    p.scheduler.run_sweep_once("universe").await.unwrap();
    assert_eq!(p.processor.drain_once().await, DrainOutcome::Completed(2));

    assert!(stock_updates(&drain_frames(&mut rx)).is_empty());
    let cached = p.store.get(&keys::latest("AAA")).await.unwrap().unwrap();
    assert_eq!(cached["price"].as_f64().unwrap(), 100.0005);

    // Sweep 3: AAA jumps past epsilon; exactly one broadcast.
    p.scheduler.run_sweep_once("universe").await.unwrap();
    p.processor.drain_once().await;

    let updates = stock_updates(&drain_frames(&mut rx));
    assert_eq!(updates, [("AAA".to_string(), 101.0)]);
}

#[tokio::test]
async fn room_scoping_keeps_instrument_updates_out_of_other_rooms() {
    let p = pipeline(ScriptedGateway::new(&[("AAA", &[100.0])]), &["AAA"]);

    let (watcher, mut rx_watcher) = connect(&p.rooms);
    p.rooms
        .handle_message(watcher, r#"{"type":"subscribe","symbols":["AAA"]}"#)
        .await;
    let (bystander, mut rx_bystander) = connect(&p.rooms);
    p.rooms
        .handle_message(bystander, r#"{"type":"subscribe","symbols":["ZZZ"]}"#)
        .await;
    drain_frames(&mut rx_watcher);
    drain_frames(&mut rx_bystander);

    p.scheduler.run_sweep_once("universe").await.unwrap();
    p.processor.drain_once().await;

    // The AAA subscriber hears it through the instrument room AND the
    // global room; the bystander only through the global room.
    assert_eq!(stock_updates(&drain_frames(&mut rx_watcher)).len(), 2);
    assert_eq!(stock_updates(&drain_frames(&mut rx_bystander)).len(), 1);
}

#[tokio::test]
async fn drain_fans_out_in_enqueue_order() {
    let p = pipeline(ScriptedGateway::new(&[]), &[]);

    let (sub, mut rx) = connect(&p.rooms);
    p.rooms
        .handle_message(sub, r#"{"type":"subscribe","symbols":["AAA"]}"#)
        .await;
    drain_frames(&mut rx);

    for price in [101.0, 102.0, 103.0] {
        p.queue.push(UpdateRecord {
            snapshot: InstrumentSnapshot {
                symbol: "AAA".to_string(),
                price,
                change: 0.0,
                change_percent: 0.0,
                volume: VOLUME,
                open: 100.0,
                high: price,
                low: 100.0,
                previous_close: 100.0,
                market_cap: None,
                source: "scripted-feed".to_string(),
                captured_at: Utc::now(),
            },
            source: UpdateSource::PrioritySweep,
            change_detected: true,
        });
    }

    assert_eq!(p.processor.drain_once().await, DrainOutcome::Completed(3));

    // Two rooms per record (instrument + global); relative price order
    // must match enqueue order throughout.
    let prices: Vec<f64> = stock_updates(&drain_frames(&mut rx))
        .into_iter()
        .map(|(_, price)| price)
        .collect();
    assert_eq!(prices, [101.0, 101.0, 102.0, 102.0, 103.0, 103.0]);
}

#[tokio::test]
async fn failed_instruments_do_not_block_the_rest_of_the_pipeline() {
    // BBB has no script entries: every fetch fails.
    let p = pipeline(
        ScriptedGateway::new(&[("AAA", &[100.0, 101.0])]),
        &["AAA", "BBB"],
    );

    let outcome = p.scheduler.run_sweep_once("universe").await.unwrap();
    assert_eq!(outcome.attempted, 2);
    assert_eq!(outcome.succeeded, 1);

    p.processor.drain_once().await;
    assert!(p.store.get(&keys::latest("AAA")).await.unwrap().is_some());
    assert!(p.store.get(&keys::latest("BBB")).await.unwrap().is_none());

    // The healthy instrument keeps flowing on the next sweep.
    let outcome = p.scheduler.run_sweep_once("universe").await.unwrap();
    assert_eq!(outcome.succeeded, 1);
    p.processor.drain_once().await;
    let cached = p.store.get(&keys::latest("AAA")).await.unwrap().unwrap();
    assert_eq!(cached["price"].as_f64().unwrap(), 101.0);
}

#[tokio::test]
async fn series_and_history_accumulate_material_updates() {
    let p = pipeline(
        ScriptedGateway::new(&[("AAA", &[100.0, 101.0, 102.0])]),
        &["AAA"],
    );

    for _ in 0..3 {
        p.scheduler.run_sweep_once("universe").await.unwrap();
        p.processor.drain_once().await;
    }

    let series = p
        .store
        .range_by_score(&keys::series("AAA"), 0, u64::MAX)
        .await
        .unwrap();
    assert_eq!(series.len(), 3, "every snapshot lands in the series");

    let history = p
        .store
        .range_by_score(&keys::history(Utc::now().date_naive()), 0, u64::MAX)
        .await
        .unwrap();
    assert_eq!(history.len(), 3, "all three updates were material");

    let m = p.processor.metrics();
    assert_eq!(m.total_processed, 3);
    assert_eq!(m.queue_depth, 0);
}
