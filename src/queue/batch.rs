//! Batch processor: the sole consumer of the update queue.
//!
//! A periodic drain pops a bounded batch and fans it out three ways
//! concurrently: write-through to the snapshot store, room broadcast of
//! material updates, and the day-bucketed history log. The branches are
//! isolated; one failing does not cancel the siblings or the drain.
//!
//! At most one drain runs at a time. A tick that fires while a drain is
//! still in flight is skipped for that tick, so a slow store cannot pile
//! up concurrent fan-out storms.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::logger::warn_if_slow;
use crate::market::types::UpdateRecord;
use crate::metrics::counters::Counters;
use crate::queue::UpdateQueue;
use crate::resilience::Resilience;
use crate::rooms::manager::ConnectionManager;
use crate::rooms::protocol::ServerMessage;
use crate::rooms::registry;
use crate::store::{SNAPSHOT_STORE, SnapshotStore, keys};

#[derive(Clone, Debug)]
pub struct DrainConfig {
    /// Drain tick period.
    pub interval: Duration,
    /// Maximum records popped per tick.
    pub batch_size: usize,
    /// TTL of the latest-value write.
    pub snapshot_ttl_secs: u64,
    /// Bound on each per-instrument series.
    pub series_max_len: usize,
    /// Bound on each day-bucketed history log.
    pub history_max_len: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// A drain was already in flight; this tick did nothing.
    Skipped,
    /// Number of records fanned out.
    Completed(usize),
}

/// Rolling pipeline metrics published after each drain.
#[derive(Clone, Default)]
pub struct PipelineMetrics {
    total_processed: Arc<AtomicU64>,
    queue_depth: Arc<AtomicU64>,
    recent: Arc<Mutex<VecDeque<Duration>>>,
}

const METRICS_WINDOW: usize = 50;

impl PipelineMetrics {
    fn record_drain(&self, processed: usize, took: Duration, depth: usize) {
        self.total_processed
            .fetch_add(processed as u64, Ordering::Relaxed);
        self.queue_depth.store(depth as u64, Ordering::Relaxed);

        let mut recent = self.recent.lock();
        recent.push_back(took);
        while recent.len() > METRICS_WINDOW {
            recent.pop_front();
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let recent = self.recent.lock();
        let avg_drain_ms = if recent.is_empty() {
            0.0
        } else {
            recent.iter().map(|d| d.as_secs_f64() * 1_000.0).sum::<f64>() / recent.len() as f64
        };

        MetricsSnapshot {
            total_processed: self.total_processed.load(Ordering::Relaxed),
            avg_drain_ms,
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub total_processed: u64,
    pub avg_drain_ms: f64,
    pub queue_depth: u64,
}

pub struct BatchProcessor {
    queue: Arc<UpdateQueue>,
    store: Arc<dyn SnapshotStore>,
    resilience: Arc<Resilience>,
    rooms: Arc<ConnectionManager>,
    cfg: DrainConfig,
    metrics: PipelineMetrics,
    counters: Counters,
    drain_in_flight: std::sync::atomic::AtomicBool,
}

impl BatchProcessor {
    pub fn new(
        queue: Arc<UpdateQueue>,
        store: Arc<dyn SnapshotStore>,
        resilience: Arc<Resilience>,
        rooms: Arc<ConnectionManager>,
        cfg: DrainConfig,
        counters: Counters,
    ) -> Self {
        Self {
            queue,
            store,
            resilience,
            rooms,
            cfg,
            metrics: PipelineMetrics::default(),
            counters,
            drain_in_flight: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Drain loop. Runs until `stop` flips to true.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            every_ms = self.cfg.interval.as_millis() as u64,
            batch_size = self.cfg.batch_size,
            "batch processor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.drain_once().await;
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        info!("batch processor stopped");
                        break;
                    }
                }
            }
        }
    }

    /// One drain tick. Public so tests and operational surfaces can
    /// trigger a drain without waiting on the timer; the in-flight
    /// guard applies either way.
    pub async fn drain_once(&self) -> DrainOutcome {
        if self.drain_in_flight.swap(true, Ordering::SeqCst) {
            self.counters.drains_skipped.fetch_add(1, Ordering::Relaxed);
            debug!("drain already in flight; skipping tick");
            return DrainOutcome::Skipped;
        }

        let outcome = self.drain_batch().await;
        self.drain_in_flight.store(false, Ordering::SeqCst);
        outcome
    }

    async fn drain_batch(&self) -> DrainOutcome {
        let started = Instant::now();
        let batch = self.queue.drain(self.cfg.batch_size);

        if batch.is_empty() {
            return DrainOutcome::Completed(0);
        }

        let (stored, broadcast, history) = tokio::join!(
            self.write_through(&batch),
            self.broadcast_material(&batch),
            self.append_history(&batch),
        );

        if let Err(e) = stored {
            warn!(error = %e, "snapshot write-through branch failed");
        }
        if let Err(e) = broadcast {
            warn!(error = %e, "broadcast branch failed");
        }
        if let Err(e) = history {
            warn!(error = %e, "history branch failed");
        }

        self.counters.drains_run.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .record_drain(batch.len(), started.elapsed(), self.queue.len());

        debug!(
            processed = batch.len(),
            queue_depth = self.queue.len(),
            took_ms = started.elapsed().as_millis() as u64,
            "drain complete"
        );

        DrainOutcome::Completed(batch.len())
    }

    /// Branch 1: latest-value write with TTL plus the bounded series.
    /// Runs for every record, material or not, so cache TTLs refresh
    /// even when nothing is broadcast.
    async fn write_through(&self, batch: &[UpdateRecord]) -> anyhow::Result<()> {
        let mut failures = 0usize;

        for rec in batch {
            let symbol = &rec.snapshot.symbol;
            let payload = match serde_json::to_value(&rec.snapshot) {
                Ok(v) => v,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "snapshot not serializable; skipping");
                    failures += 1;
                    continue;
                }
            };

            let latest_key = keys::latest(symbol);
            let latest = warn_if_slow("store_set_latest", Duration::from_millis(100), async {
                self.resilience
                    .call(SNAPSHOT_STORE, "set_latest", || {
                        self.store.set_with_ttl(
                            &latest_key,
                            payload.clone(),
                            self.cfg.snapshot_ttl_secs,
                        )
                    })
                    .await
            })
            .await;

            if let Err(e) = latest {
                warn!(symbol = %symbol, error = %e, "latest-value write failed");
                failures += 1;
            }

            let series_key = keys::series(symbol);
            let appended = self
                .resilience
                .call(SNAPSHOT_STORE, "append_series", || {
                    self.store
                        .append_series(&series_key, rec.snapshot.score(), payload.clone())
                })
                .await;

            match appended {
                Ok(()) => {
                    if let Err(e) = self
                        .store
                        .trim_series(&series_key, self.cfg.series_max_len)
                        .await
                    {
                        warn!(symbol = %symbol, error = %e, "series trim failed");
                    }
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "series append failed");
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            anyhow::bail!("{failures} of {} snapshot writes failed", batch.len());
        }
        Ok(())
    }

    /// Branch 2: material records go to their instrument room and the
    /// global room, in enqueue order.
    async fn broadcast_material(&self, batch: &[UpdateRecord]) -> anyhow::Result<()> {
        for rec in batch.iter().filter(|r| r.change_detected) {
            let msg = ServerMessage::stock_update(&rec.snapshot);

            self.rooms
                .broadcast_room(&registry::instrument_room(&rec.snapshot.symbol), &msg);
            self.rooms.broadcast_room(registry::GLOBAL_ROOM, &msg);
        }
        Ok(())
    }

    /// Branch 3: material records append to the current day's history
    /// log, bounded by trim. Day bucketing means old logs simply stop
    /// being written and age out of the cache.
    async fn append_history(&self, batch: &[UpdateRecord]) -> anyhow::Result<()> {
        let mut failures = 0usize;

        for rec in batch.iter().filter(|r| r.change_detected) {
            let key = keys::history(rec.snapshot.captured_at.date_naive());
            let entry = match serde_json::to_value(&rec.snapshot) {
                Ok(v) => v,
                Err(_) => continue,
            };

            let appended = self
                .resilience
                .call(SNAPSHOT_STORE, "append_history", || {
                    self.store.append_series(&key, rec.snapshot.score(), entry.clone())
                })
                .await;

            match appended {
                Ok(()) => {
                    let _ = self.store.trim_series(&key, self.cfg.history_max_len).await;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "history append failed");
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            anyhow::bail!("{failures} history appends failed");
        }
        Ok(())
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 50,
            snapshot_ttl_secs: 60,
            series_max_len: 100,
            history_max_len: 1_000,
        }
    }
}
