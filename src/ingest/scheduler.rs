//! Ingestion scheduler.
//!
//! Responsibilities:
//! - Drive the three polling sweeps (full universe, priority subset,
//!   market summary/health) off one shared job mechanism.
//! - Fan each sweep out over its symbols in bounded batches with an
//!   inter-batch pause, every fetch independent: a per-instrument
//!   failure is logged and counted, never aborts the sweep.
//! - Feed every successful fetch through the change detector into the
//!   update queue.
//!
//! Non-responsibilities:
//! - Draining the queue (batch processor).
//! - Serving data-pull requests (connection manager reads the store).
//!
//! Lifecycle: `start`/`stop` are idempotent; stop signals every job
//! loop, which exits at its next suspension point. A sweep batch
//! already in flight completes and still enqueues its records, but no
//! further batch starts and the job never reschedules.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, instrument, warn};

use crate::market::detector::ChangeDetector;
use crate::market::gateway::QuoteGateway;
use crate::market::summary::derive_summary;
use crate::market::types::UpdateSource;
use crate::metrics::counters::Counters;
use crate::queue::UpdateQueue;
use crate::resilience::Resilience;
use crate::rooms::manager::ConnectionManager;
use crate::rooms::protocol::ServerMessage;
use crate::rooms::registry::GLOBAL_ROOM;
use crate::store::{SNAPSHOT_STORE, SnapshotStore, keys};
use crate::time::now_ms;

/// Upstream service name the gateway breaker is keyed by.
pub const PRIMARY_FEED: &str = "primary-feed";

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Instruments fetched concurrently per sweep batch.
    pub sweep_batch_size: usize,
    /// Pause between sweep batches.
    pub inter_batch_pause: Duration,
    /// TTL of the stored market summary.
    pub summary_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_batch_size: 10,
            inter_batch_pause: Duration::from_millis(250),
            summary_ttl_secs: 120,
        }
    }
}

/// One registrable polling unit.
#[derive(Clone, Debug)]
pub struct SweepSpec {
    /// Unique group name, e.g. `universe` or `priority`.
    pub group: String,
    pub symbols: Vec<String>,
    pub source: UpdateSource,
    pub interval: Duration,
}

/// Bookkeeping state of one registered job.
#[derive(Clone, Debug)]
pub struct ScheduleJob {
    pub group: String,
    pub interval: Duration,
    pub next_run_ms: u64,
    pub running: bool,
    pub consecutive_failures: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub attempted: usize,
    pub succeeded: usize,
}

/// Health view derived from the running flag and the error rate over
/// the most recent summary window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Health {
    pub running: bool,
    pub recent_error_rate: f64,
}

struct JobEntry {
    spec: SweepSpec,
    state: Arc<Mutex<ScheduleJob>>,
    handle: Option<JoinHandle<()>>,
}

pub struct IngestScheduler<G: QuoteGateway> {
    gateway: Arc<G>,
    resilience: Arc<Resilience>,
    detector: Arc<ChangeDetector>,
    queue: Arc<UpdateQueue>,
    store: Arc<dyn SnapshotStore>,
    rooms: Arc<ConnectionManager>,
    cfg: SchedulerConfig,
    counters: Counters,

    jobs: Mutex<HashMap<String, JobEntry>>,
    running: AtomicBool,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,

    // Error-rate window, reset by each summary sweep.
    window_attempts: AtomicU64,
    window_failures: AtomicU64,
    recent_error_rate_bits: AtomicU64,
}

impl<G: QuoteGateway> IngestScheduler<G> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<G>,
        resilience: Arc<Resilience>,
        detector: Arc<ChangeDetector>,
        queue: Arc<UpdateQueue>,
        store: Arc<dyn SnapshotStore>,
        rooms: Arc<ConnectionManager>,
        cfg: SchedulerConfig,
        counters: Counters,
    ) -> Self {
        Self {
            gateway,
            resilience,
            detector,
            queue,
            store,
            rooms,
            cfg,
            counters,
            jobs: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            stop_tx: Mutex::new(None),
            window_attempts: AtomicU64::new(0),
            window_failures: AtomicU64::new(0),
            recent_error_rate_bits: AtomicU64::new(0),
        }
    }

    /* =========================
     * Job registration
     * ========================= */

    /// Registers a sweep group. If the scheduler is already running the
    /// job starts immediately; otherwise it starts with `start`.
    pub fn register_group(self: &Arc<Self>, spec: SweepSpec) {
        let state = Arc::new(Mutex::new(ScheduleJob {
            group: spec.group.clone(),
            interval: spec.interval,
            next_run_ms: now_ms() + spec.interval.as_millis() as u64,
            running: false,
            consecutive_failures: 0,
        }));

        let handle = if self.running.load(Ordering::SeqCst) {
            self.stop_tx
                .lock()
                .as_ref()
                .map(|tx| self.spawn_job(spec.clone(), Arc::clone(&state), tx.subscribe()))
        } else {
            None
        };

        info!(group = %spec.group, symbols = spec.symbols.len(), "sweep group registered");
        self.jobs.lock().insert(
            spec.group.clone(),
            JobEntry {
                spec,
                state,
                handle,
            },
        );
    }

    /// Removes a group and cancels its timer, even mid-sweep.
    pub fn unregister_group(&self, group: &str) {
        if let Some(entry) = self.jobs.lock().remove(group) {
            if let Some(handle) = entry.handle {
                handle.abort();
            }
            info!(group, "sweep group unregistered");
        }
    }

    /// Snapshot of every registered job's bookkeeping state.
    pub fn jobs(&self) -> Vec<ScheduleJob> {
        self.jobs.lock().values().map(|e| e.state.lock().clone()).collect()
    }

    /* =========================
     * Lifecycle
     * ========================= */

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("scheduler already running; start ignored");
            return;
        }

        let (tx, _) = watch::channel(false);

        {
            let mut jobs = self.jobs.lock();
            for entry in jobs.values_mut() {
                entry.handle = Some(self.spawn_job(
                    entry.spec.clone(),
                    Arc::clone(&entry.state),
                    tx.subscribe(),
                ));
            }
        }

        *self.stop_tx.lock() = Some(tx);
        info!(jobs = self.jobs.lock().len(), "scheduler started");
    }

    /// Signals every job loop to exit. A batch already in flight
    /// completes and its records stay enqueued; nothing reschedules.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            info!("scheduler already stopped; stop ignored");
            return;
        }

        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(true);
        }

        for entry in self.jobs.lock().values_mut() {
            entry.handle = None;
        }

        info!("scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> Health {
        Health {
            running: self.is_running(),
            recent_error_rate: f64::from_bits(self.recent_error_rate_bits.load(Ordering::Relaxed)),
        }
    }

    fn spawn_job(
        self: &Arc<Self>,
        spec: SweepSpec,
        state: Arc<Mutex<ScheduleJob>>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let sched = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = interval(spec.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                group = %spec.group,
                every_ms = spec.interval.as_millis() as u64,
                "sweep job started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        state.lock().running = true;

                        let outcome = sched.run_spec(&spec, Some(&stop_rx)).await;

                        {
                            let mut s = state.lock();
                            s.running = false;
                            // Reschedule happens whether the sweep
                            // succeeded or failed.
                            s.next_run_ms = now_ms() + spec.interval.as_millis() as u64;
                            if outcome.attempted > 0 && outcome.succeeded == 0 {
                                s.consecutive_failures += 1;
                            } else {
                                s.consecutive_failures = 0;
                            }
                        }

                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!(group = %spec.group, "sweep job exited");
        })
    }

    /* =========================
     * Sweep execution
     * ========================= */

    /// Runs one sweep of a registered group immediately. Used by the
    /// job loops and by tests that drive the scheduler by hand.
    pub async fn run_sweep_once(&self, group: &str) -> Option<SweepOutcome> {
        let spec = self.jobs.lock().get(group).map(|e| e.spec.clone())?;
        Some(self.run_spec(&spec, None).await)
    }

    async fn run_spec(&self, spec: &SweepSpec, stop: Option<&watch::Receiver<bool>>) -> SweepOutcome {
        let outcome = match spec.source {
            UpdateSource::SummarySweep => self.run_summary_sweep().await,
            _ => self.run_quote_sweep(spec, stop).await,
        };

        self.counters.sweeps_run.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    /// Batched fan-out over the group's symbols. Every fetch is
    /// independent; failures are tolerated and tallied.
    #[instrument(skip(self, spec, stop), fields(group = %spec.group))]
    async fn run_quote_sweep(
        &self,
        spec: &SweepSpec,
        stop: Option<&watch::Receiver<bool>>,
    ) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let batch_size = self.cfg.sweep_batch_size.max(1);
        let chunks = spec.symbols.chunks(batch_size).count();

        for (i, chunk) in spec.symbols.chunks(batch_size).enumerate() {
            if stop.is_some_and(|s| *s.borrow()) {
                debug!(group = %spec.group, "stop requested; abandoning remaining batches");
                break;
            }

            let results = join_all(
                chunk
                    .iter()
                    .map(|symbol| self.fetch_and_enqueue(symbol, spec.source)),
            )
            .await;

            outcome.attempted += results.len();
            outcome.succeeded += results.iter().filter(|ok| **ok).count();

            if i + 1 < chunks {
                tokio::time::sleep(self.cfg.inter_batch_pause).await;
            }
        }

        debug!(
            group = %spec.group,
            attempted = outcome.attempted,
            succeeded = outcome.succeeded,
            "sweep complete"
        );
        outcome
    }

    async fn fetch_and_enqueue(&self, symbol: &str, source: UpdateSource) -> bool {
        self.window_attempts.fetch_add(1, Ordering::Relaxed);

        let fetched = self
            .resilience
            .call(PRIMARY_FEED, "fetch_quote", || self.gateway.fetch(symbol))
            .await;

        match fetched {
            Ok(snapshot) => {
                self.counters.fetch_ok.fetch_add(1, Ordering::Relaxed);
                let record = self.detector.observe(snapshot, source);
                self.queue.push(record);
                self.counters.updates_enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.window_failures.fetch_add(1, Ordering::Relaxed);
                if e.is_circuit_open() {
                    self.counters.fetch_rejected_open.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.fetch_failed.fetch_add(1, Ordering::Relaxed);
                }
                warn!(symbol, error = %e, "quote fetch failed");
                false
            }
        }
    }

    /// Summary/health sweep: derive the market summary from current
    /// baselines, store it with a TTL, broadcast it to the global room,
    /// and roll the error-rate window.
    #[instrument(skip(self))]
    async fn run_summary_sweep(&self) -> SweepOutcome {
        let baselines = self.detector.baselines();
        let summary = derive_summary(&baselines);

        let attempts = self.window_attempts.swap(0, Ordering::Relaxed);
        let failures = self.window_failures.swap(0, Ordering::Relaxed);
        let rate = if attempts == 0 {
            0.0
        } else {
            failures as f64 / attempts as f64
        };
        self.recent_error_rate_bits
            .store(rate.to_bits(), Ordering::Relaxed);

        if rate > 0.5 {
            warn!(
                attempts,
                failures,
                error_rate = rate,
                "upstream error rate degraded over last summary window"
            );
        }

        let payload = match serde_json::to_value(&summary) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "market summary not serializable");
                return SweepOutcome {
                    attempted: 1,
                    succeeded: 0,
                };
            }
        };

        let summary_key = keys::summary();
        let stored = self
            .resilience
            .call(SNAPSHOT_STORE, "store_summary", || {
                self.store
                    .set_with_ttl(&summary_key, payload.clone(), self.cfg.summary_ttl_secs)
            })
            .await;

        let succeeded = match stored {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "market summary store write failed");
                false
            }
        };

        self.rooms.broadcast_room(
            GLOBAL_ROOM,
            &ServerMessage::MarketSummary {
                summary,
                timestamp: chrono::Utc::now(),
            },
        );

        SweepOutcome {
            attempted: 1,
            succeeded: usize::from(succeeded),
        }
    }
}
