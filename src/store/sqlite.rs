//! SQLx-backed snapshot store.
//!
//! Responsible only for persistence and row mapping. TTL expiry is
//! enforced at read time against `expires_at_ms`; `purge_expired` exists
//! for housekeeping but nothing depends on it running.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};

use crate::store::SnapshotStore;
use crate::time::now_ms;

pub struct SqlxSnapshotStore {
    pool: AnyPool,
}

impl SqlxSnapshotStore {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = AnyPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS snapshots (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  expires_at_ms BIGINT NOT NULL
);
"#,
        )
        .execute(&self.pool)
        .await
        .context("create snapshots table")?;

        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS series (
  key TEXT NOT NULL,
  score BIGINT NOT NULL,
  value TEXT NOT NULL
);
"#,
        )
        .execute(&self.pool)
        .await
        .context("create series table")?;

        sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_series_key_score ON series (key, score);"#)
            .execute(&self.pool)
            .await
            .context("create series index")?;

        Ok(())
    }

    /// Deletes expired snapshot rows. Reads never return expired rows,
    /// so this only reclaims space.
    pub async fn purge_expired(&self) -> anyhow::Result<u64> {
        let now = u64_to_i64(now_ms())?;
        let res = sqlx::query("DELETE FROM snapshots WHERE expires_at_ms <= ?;")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl SnapshotStore for SqlxSnapshotStore {
    async fn set_with_ttl(&self, key: &str, value: Value, ttl_secs: u64) -> anyhow::Result<()> {
        let expires = u64_to_i64(now_ms() + ttl_secs * 1_000)?;
        let payload = serde_json::to_string(&value)?;

        sqlx::query(
            r#"
INSERT INTO snapshots (key, value, expires_at_ms) VALUES (?, ?, ?)
ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at_ms = excluded.expires_at_ms;
"#,
        )
        .bind(key)
        .bind(payload)
        .bind(expires)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        let now = u64_to_i64(now_ms())?;

        let row = sqlx::query("SELECT value FROM snapshots WHERE key = ? AND expires_at_ms > ?;")
            .bind(key)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let raw: String = r.get("value");
                let v = serde_json::from_str(&raw).context("invalid stored snapshot json")?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }

    async fn append_series(&self, key: &str, score: u64, value: Value) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&value)?;

        sqlx::query("INSERT INTO series (key, score, value) VALUES (?, ?, ?);")
            .bind(key)
            .bind(u64_to_i64(score)?)
            .bind(payload)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn trim_series(&self, key: &str, max_len: usize) -> anyhow::Result<()> {
        sqlx::query(
            r#"
DELETE FROM series
WHERE key = ? AND rowid NOT IN (
  SELECT rowid FROM series WHERE key = ? ORDER BY score DESC, rowid DESC LIMIT ?
);
"#,
        )
        .bind(key)
        .bind(key)
        .bind(max_len as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn range_by_score(&self, key: &str, from: u64, to: u64) -> anyhow::Result<Vec<Value>> {
        let rows = sqlx::query(
            r#"
SELECT value FROM series
WHERE key = ? AND score >= ? AND score <= ?
ORDER BY score ASC, rowid ASC;
"#,
        )
        .bind(key)
        .bind(u64_to_i64(from)?)
        .bind(u64_to_i64(to)?)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let raw: String = r.get("value");
            match serde_json::from_str(&raw) {
                Ok(v) => out.push(v),
                Err(e) => {
                    // poison-row resilience: skip but don't fail the range
                    tracing::warn!(error = %e, key, "skipping malformed series row");
                }
            }
        }

        Ok(out)
    }
}

/* =========================
Numeric safety helpers
========================= */

fn u64_to_i64(v: u64) -> anyhow::Result<i64> {
    if v > i64::MAX as u64 {
        return Err(anyhow!("u64 too large for i64: {v}"));
    }
    Ok(v as i64)
}
