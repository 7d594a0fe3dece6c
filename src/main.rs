use std::sync::Arc;

use quotewire::{
    config::AppConfig,
    ingest::scheduler::{IngestScheduler, SchedulerConfig, SweepSpec},
    logger::init_tracing,
    market::{detector::ChangeDetector, gateway::HttpQuoteGateway, types::UpdateSource},
    metrics::counters::Counters,
    queue::{
        UpdateQueue,
        batch::{BatchProcessor, DrainConfig},
    },
    resilience::{BreakerConfig, Resilience, RetryPolicy},
    rooms::{
        manager::{ConnectionManager, RoomConfig},
        server,
    },
    store::{MemorySnapshotStore, SnapshotStore, SqlxSnapshotStore},
};
use tokio::sync::watch;

/// Connects the configured snapshot store: sqlite-backed when a
/// database URL is set, in-memory otherwise.
async fn init_store(cfg: &AppConfig) -> anyhow::Result<Arc<dyn SnapshotStore>> {
    match &cfg.snapshot_database_url {
        Some(url) => {
            let store = SqlxSnapshotStore::connect(url).await?;
            store.migrate().await?;
            tracing::info!(url = %url, "snapshot store: sqlite");
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("snapshot store: in-memory");
            Ok(Arc::new(MemorySnapshotStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sqlx::any::install_default_drivers();

    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    init_tracing(is_production);

    tracing::info!("Starting quotewire...");

    let cfg = AppConfig::from_env();
    let counters = Counters::default();

    let store = init_store(&cfg).await?;
    let gateway = Arc::new(HttpQuoteGateway::new(cfg.quote_api_url.clone())?);

    let resilience = Arc::new(Resilience::new(
        RetryPolicy::new(
            cfg.retry_max_attempts,
            cfg.retry_base,
            cfg.retry_multiplier,
            cfg.retry_cap,
        ),
        BreakerConfig {
            failure_threshold: cfg.breaker_failure_threshold,
            reset_timeout: cfg.breaker_reset_timeout,
            required_successes: cfg.breaker_required_successes,
        },
    ));

    let detector = Arc::new(ChangeDetector::new(cfg.price_epsilon));
    let queue = Arc::new(UpdateQueue::new());

    let rooms = Arc::new(ConnectionManager::new(
        Arc::clone(&store),
        RoomConfig {
            heartbeat_interval: cfg.heartbeat_interval,
            stale_after: cfg.stale_after,
        },
        counters.clone(),
    ));

    // One stop signal fans out to the heartbeat loop, the batch
    // processor, and the accept loop; the scheduler has its own
    // lifecycle via start/stop.
    let (stop_tx, _) = watch::channel(false);

    tokio::spawn(Arc::clone(&rooms).run_heartbeat(stop_tx.subscribe()));

    let processor = Arc::new(BatchProcessor::new(
        Arc::clone(&queue),
        Arc::clone(&store),
        Arc::clone(&resilience),
        Arc::clone(&rooms),
        DrainConfig {
            interval: cfg.drain_interval,
            batch_size: cfg.drain_batch_size,
            snapshot_ttl_secs: cfg.snapshot_ttl_secs,
            series_max_len: cfg.series_max_len,
            history_max_len: cfg.history_max_len,
        },
        counters.clone(),
    ));
    tokio::spawn(Arc::clone(&processor).run(stop_tx.subscribe()));

    let scheduler = Arc::new(IngestScheduler::new(
        gateway,
        resilience,
        detector,
        Arc::clone(&queue),
        Arc::clone(&store),
        Arc::clone(&rooms),
        SchedulerConfig {
            sweep_batch_size: cfg.sweep_batch_size,
            inter_batch_pause: cfg.inter_batch_pause,
            // Summaries must outlive one sweep gap.
            summary_ttl_secs: (cfg.summary_sweep_interval.as_secs() * 2).max(120),
        },
        counters.clone(),
    ));

    scheduler.register_group(SweepSpec {
        group: "universe".to_string(),
        symbols: cfg.universe.clone(),
        source: UpdateSource::FullSweep,
        interval: cfg.full_sweep_interval,
    });
    scheduler.register_group(SweepSpec {
        group: "priority".to_string(),
        symbols: cfg.priority.clone(),
        source: UpdateSource::PrioritySweep,
        interval: cfg.priority_sweep_interval,
    });
    scheduler.register_group(SweepSpec {
        group: "summary".to_string(),
        symbols: Vec::new(),
        source: UpdateSource::SummarySweep,
        interval: cfg.summary_sweep_interval,
    });
    scheduler.start();

    let (listener, addr) = server::bind(&cfg.ws_bind_addr).await?;
    tokio::spawn(server::run(listener, Arc::clone(&rooms), stop_tx.subscribe()));

    tracing::info!(%addr, universe = cfg.universe.len(), "quotewire ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    scheduler.stop();
    let _ = stop_tx.send(true);

    Ok(())
}
