use std::sync::Arc;
use std::sync::atomic::AtomicU64;

/// Minimal counters for operational visibility.
#[derive(Clone, Default)]
pub struct Counters {
    pub sweeps_run: Arc<AtomicU64>,
    pub fetch_ok: Arc<AtomicU64>,
    pub fetch_failed: Arc<AtomicU64>,
    pub fetch_rejected_open: Arc<AtomicU64>,

    pub updates_enqueued: Arc<AtomicU64>,
    pub drains_run: Arc<AtomicU64>,
    pub drains_skipped: Arc<AtomicU64>,

    pub broadcasts_sent: Arc<AtomicU64>,
    pub send_failures: Arc<AtomicU64>,
    pub connections_opened: Arc<AtomicU64>,
    pub connections_evicted: Arc<AtomicU64>,
}
