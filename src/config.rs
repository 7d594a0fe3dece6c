use std::time::Duration;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Base URL of the upstream quote API.
    pub quote_api_url: String,

    /// Optional connection string for the sqlite-backed snapshot store.
    /// When unset, the in-memory store is used.
    pub snapshot_database_url: Option<String>,

    /// Address the WebSocket subscriber server binds to.
    pub ws_bind_addr: String,

    // =========================
    // Instrument universe
    // =========================
    /// Full universe of tracked symbols (comma-separated in the env).
    pub universe: Vec<String>,

    /// Subset polled on the high-frequency sweep. Must be symbols that
    /// also appear in `universe`; extras are polled anyway but never
    /// reach the full-sweep cadence.
    pub priority: Vec<String>,

    // =========================
    // Sweep cadence
    // =========================
    /// Full-universe sweep interval.
    pub full_sweep_interval: Duration,

    /// Priority-subset sweep interval.
    pub priority_sweep_interval: Duration,

    /// Market-summary / health sweep interval.
    pub summary_sweep_interval: Duration,

    /// How many instruments are fetched concurrently per sweep batch.
    ///
    /// Bounds the number of in-flight upstream requests so a large
    /// universe cannot saturate the provider.
    pub sweep_batch_size: usize,

    /// Pause between sweep batches.
    pub inter_batch_pause: Duration,

    // =========================
    // Change detection
    // =========================
    /// Price moves within this absolute epsilon are treated as
    /// floating-point noise. Any volume change is material.
    pub price_epsilon: f64,

    // =========================
    // Queue drain
    // =========================
    /// Period of the batch processor's drain tick.
    pub drain_interval: Duration,

    /// Maximum records popped per drain. Bounds downstream fan-out work
    /// per tick; the queue itself is unbounded.
    pub drain_batch_size: usize,

    // =========================
    // Snapshot store
    // =========================
    /// TTL applied to the latest-value write of each snapshot.
    pub snapshot_ttl_secs: u64,

    /// Maximum length of each per-instrument time series.
    pub series_max_len: usize,

    /// Maximum length of each day-bucketed history log.
    pub history_max_len: usize,

    // =========================
    // Subscriber liveness
    // =========================
    /// Heartbeat period: every tick marks all connections unconfirmed
    /// and pings them; still-unconfirmed connections are evicted on the
    /// following tick.
    pub heartbeat_interval: Duration,

    /// A connection silent for longer than this is evicted regardless
    /// of ping/pong bookkeeping.
    pub stale_after: Duration,

    // =========================
    // Resilience
    // =========================
    /// Maximum attempts per wrapped upstream call.
    pub retry_max_attempts: u32,

    /// Base backoff delay for attempt 1.
    pub retry_base: Duration,

    /// Exponential multiplier applied per attempt.
    pub retry_multiplier: f64,

    /// Upper bound on the computed backoff delay, before jitter.
    pub retry_cap: Duration,

    /// Consecutive failures that open a service's circuit.
    pub breaker_failure_threshold: u32,

    /// How long an open circuit rejects calls before going half-open.
    pub breaker_reset_timeout: Duration,

    /// Consecutive half-open successes required to close the circuit.
    pub breaker_required_successes: u32,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let quote_api_url = std::env::var("QUOTE_API_URL")
            .unwrap_or_else(|_| "https://query1.finance.example.com/v8".to_string());

        let snapshot_database_url = std::env::var("SNAPSHOT_DATABASE_URL").ok();

        let ws_bind_addr =
            std::env::var("WS_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8090".to_string());

        Self {
            quote_api_url,
            snapshot_database_url,
            ws_bind_addr,

            universe: env_list(
                "QUOTE_UNIVERSE",
                &["AAPL", "MSFT", "GOOGL", "AMZN", "NVDA", "META", "TSLA", "JPM", "V", "WMT"],
            ),
            priority: env_list("QUOTE_PRIORITY", &["AAPL", "NVDA", "TSLA"]),

            // Sweep defaults: wide and slow for the universe, tight for
            // the priority subset, slowest for the summary.
            full_sweep_interval: Duration::from_millis(env_u64("FULL_SWEEP_MS", 30_000)),
            priority_sweep_interval: Duration::from_millis(env_u64("PRIORITY_SWEEP_MS", 10_000)),
            summary_sweep_interval: Duration::from_millis(env_u64("SUMMARY_SWEEP_MS", 60_000)),
            sweep_batch_size: env_u64("SWEEP_BATCH_SIZE", 10) as usize,
            inter_batch_pause: Duration::from_millis(env_u64("INTER_BATCH_PAUSE_MS", 250)),

            price_epsilon: env_f64("PRICE_EPSILON", 0.001),

            drain_interval: Duration::from_millis(env_u64("DRAIN_INTERVAL_MS", 1_000)),
            drain_batch_size: env_u64("DRAIN_BATCH_SIZE", 50) as usize,

            snapshot_ttl_secs: env_u64("SNAPSHOT_TTL_SECS", 60),
            series_max_len: env_u64("SERIES_MAX_LEN", 100) as usize,
            history_max_len: env_u64("HISTORY_MAX_LEN", 1_000) as usize,

            heartbeat_interval: Duration::from_millis(env_u64("HEARTBEAT_INTERVAL_MS", 30_000)),
            stale_after: Duration::from_millis(env_u64("STALE_AFTER_MS", 90_000)),

            retry_max_attempts: env_u64("RETRY_MAX_ATTEMPTS", 3) as u32,
            retry_base: Duration::from_millis(env_u64("RETRY_BASE_MS", 200)),
            retry_multiplier: env_f64("RETRY_MULTIPLIER", 2.0),
            retry_cap: Duration::from_millis(env_u64("RETRY_CAP_MS", 5_000)),

            breaker_failure_threshold: env_u64("BREAKER_FAILURE_THRESHOLD", 5) as u32,
            breaker_reset_timeout: Duration::from_millis(env_u64("BREAKER_RESET_MS", 30_000)),
            breaker_required_successes: env_u64("BREAKER_REQUIRED_SUCCESSES", 2) as u32,
        }
    }
}
