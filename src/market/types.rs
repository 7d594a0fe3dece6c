use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One normalized quote for one instrument, as fetched from an upstream
/// provider. Immutable once produced; a new snapshot replaces, never
/// mutates, the prior one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentSnapshot {
    pub symbol: String,
    pub price: f64,
    /// Absolute change against the previous close.
    pub change: f64,
    pub change_percent: f64,
    pub volume: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub previous_close: f64,
    pub market_cap: Option<f64>,
    /// Which upstream produced this snapshot.
    pub source: String,
    pub captured_at: DateTime<Utc>,
}

impl InstrumentSnapshot {
    /// Score used when this snapshot is appended to a time series.
    pub fn score(&self) -> u64 {
        self.captured_at.timestamp_millis().max(0) as u64
    }
}

/// Which sweep schedule produced an update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    FullSweep,
    PrioritySweep,
    SummarySweep,
}

impl UpdateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateSource::FullSweep => "full_sweep",
            UpdateSource::PrioritySweep => "priority_sweep",
            UpdateSource::SummarySweep => "summary_sweep",
        }
    }
}

/// Transient work item flowing from the change detector to the batch
/// processor. Consumed exactly once, never persisted.
#[derive(Clone, Debug)]
pub struct UpdateRecord {
    pub snapshot: InstrumentSnapshot,
    pub source: UpdateSource,
    pub change_detected: bool,
}

/// Aggregate view over the latest known snapshot of every instrument.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSummary {
    pub instrument_count: usize,
    pub advancing: usize,
    pub declining: usize,
    pub unchanged: usize,
    pub total_volume: u64,
    pub as_of: Option<DateTime<Utc>>,
}
