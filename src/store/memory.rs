//! In-memory snapshot store.
//!
//! Default store for development and tests. Expiry is lazy: an expired
//! entry stays in the map until the next read or overwrite touches it.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::store::SnapshotStore;
use crate::time::now_ms;

struct TtlEntry {
    value: Value,
    expires_at_ms: u64,
}

#[derive(Default)]
struct Inner {
    kv: HashMap<String, TtlEntry>,
    /// Sorted ascending by score; ties keep insertion order.
    series: HashMap<String, Vec<(u64, Value)>>,
}

#[derive(Default)]
pub struct MemorySnapshotStore {
    inner: RwLock<Inner>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn set_with_ttl(&self, key: &str, value: Value, ttl_secs: u64) -> anyhow::Result<()> {
        let mut g = self.inner.write().await;
        g.kv.insert(
            key.to_string(),
            TtlEntry {
                value,
                expires_at_ms: now_ms() + ttl_secs * 1_000,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        let now = now_ms();

        {
            let g = self.inner.read().await;
            match g.kv.get(key) {
                Some(e) if e.expires_at_ms > now => return Ok(Some(e.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: drop the entry under the write lock.
        let mut g = self.inner.write().await;
        if g.kv.get(key).is_some_and(|e| e.expires_at_ms <= now) {
            g.kv.remove(key);
        }
        Ok(None)
    }

    async fn append_series(&self, key: &str, score: u64, value: Value) -> anyhow::Result<()> {
        let mut g = self.inner.write().await;
        let series = g.series.entry(key.to_string()).or_default();

        let idx = series.partition_point(|(s, _)| *s <= score);
        series.insert(idx, (score, value));
        Ok(())
    }

    async fn trim_series(&self, key: &str, max_len: usize) -> anyhow::Result<()> {
        let mut g = self.inner.write().await;
        if let Some(series) = g.series.get_mut(key) {
            let excess = series.len().saturating_sub(max_len);
            if excess > 0 {
                series.drain(..excess);
            }
        }
        Ok(())
    }

    async fn range_by_score(&self, key: &str, from: u64, to: u64) -> anyhow::Result<Vec<Value>> {
        let g = self.inner.read().await;
        Ok(g.series
            .get(key)
            .map(|series| {
                series
                    .iter()
                    .filter(|(s, _)| *s >= from && *s <= to)
                    .map(|(_, v)| v.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = MemorySnapshotStore::new();
        store
            .set_with_ttl("quote:latest:AAA", json!({"price": 100.0}), 60)
            .await
            .unwrap();

        let v = store.get("quote:latest:AAA").await.unwrap();
        assert_eq!(v, Some(json!({"price": 100.0})));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_absent() {
        let store = MemorySnapshotStore::new();
        store
            .set_with_ttl("quote:latest:AAA", json!(1), 0)
            .await
            .unwrap();

        assert_eq!(store.get("quote:latest:AAA").await.unwrap(), None);
    }

    #[tokio::test]
    async fn overwrite_refreshes_value_and_ttl() {
        let store = MemorySnapshotStore::new();
        store.set_with_ttl("k", json!(1), 0).await.unwrap();
        store.set_with_ttl("k", json!(2), 60).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn series_is_sorted_and_range_filters_inclusively() {
        let store = MemorySnapshotStore::new();
        // Appended out of order on purpose.
        store.append_series("s", 30, json!("c")).await.unwrap();
        store.append_series("s", 10, json!("a")).await.unwrap();
        store.append_series("s", 20, json!("b")).await.unwrap();

        let all = store.range_by_score("s", 0, 100).await.unwrap();
        assert_eq!(all, vec![json!("a"), json!("b"), json!("c")]);

        let mid = store.range_by_score("s", 10, 20).await.unwrap();
        assert_eq!(mid, vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn trim_drops_oldest_entries_first() {
        let store = MemorySnapshotStore::new();
        for i in 0..5u64 {
            store.append_series("s", i, json!(i)).await.unwrap();
        }

        store.trim_series("s", 2).await.unwrap();

        let rest = store.range_by_score("s", 0, 100).await.unwrap();
        assert_eq!(rest, vec![json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn trim_on_short_or_missing_series_is_a_noop() {
        let store = MemorySnapshotStore::new();
        store.trim_series("missing", 3).await.unwrap();

        store.append_series("s", 1, json!(1)).await.unwrap();
        store.trim_series("s", 3).await.unwrap();
        assert_eq!(store.range_by_score("s", 0, 10).await.unwrap().len(), 1);
    }
}
