//! Snapshot store contract.
//!
//! The store is an external cache with TTL semantics and a
//! score-sorted collection per key. This crate only defines the seam
//! and two interchangeable implementations; every operation is
//! independently idempotent and safe to retry.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value;

pub use memory::MemorySnapshotStore;
pub use sqlite::SqlxSnapshotStore;

/// Service name the store's circuit breaker is keyed by.
pub const SNAPSHOT_STORE: &str = "snapshot-store";

#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Write `value` under `key`, replacing any prior value and
    /// resetting its TTL.
    async fn set_with_ttl(&self, key: &str, value: Value, ttl_secs: u64) -> anyhow::Result<()>;

    /// Read the value under `key`; expired entries read as absent.
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;

    /// Append one entry to the score-sorted series under `key`.
    async fn append_series(&self, key: &str, score: u64, value: Value) -> anyhow::Result<()>;

    /// Drop the lowest-score entries so at most `max_len` remain.
    async fn trim_series(&self, key: &str, max_len: usize) -> anyhow::Result<()>;

    /// All series entries with `from <= score <= to`, ascending.
    async fn range_by_score(&self, key: &str, from: u64, to: u64) -> anyhow::Result<Vec<Value>>;
}

/// Cache key layout shared by writers and readers.
pub mod keys {
    /// Latest snapshot of one instrument.
    pub fn latest(symbol: &str) -> String {
        format!("quote:latest:{symbol}")
    }

    /// Bounded per-instrument time series.
    pub fn series(symbol: &str) -> String {
        format!("quote:series:{symbol}")
    }

    /// Day-bucketed history log of material updates.
    pub fn history(day: chrono::NaiveDate) -> String {
        format!("quote:history:{}", day.format("%Y-%m-%d"))
    }

    /// Market-wide summary.
    pub fn summary() -> String {
        "market:summary".to_string()
    }
}
