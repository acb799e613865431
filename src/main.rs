use std::sync::Arc;

use tracing::{info, warn};

use stockbook::config::EngineConfig;
use stockbook::engine::Engine;
use stockbook::policy::RolePolicy;

/// Replay the WAL, audit every item's ledger against its capacity and cached stock,
/// and optionally compact the log.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = EngineConfig::from_env();
    stockbook::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    info!("stockbook");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  lock_timeout: {:?}", config.lock_timeout);
    info!("  booking_prefix: {}", config.booking_prefix);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let engine = Engine::with_options(config.wal_path(), Arc::new(RolePolicy), config.options())?;

    let items = engine.list_items().await?;
    let mut oversold = 0usize;
    let mut drifted = 0usize;
    for item in &items {
        let audit = engine.audit_item(item.id).await?;
        if audit.oversold() {
            oversold += 1;
            warn!(
                item_id = %audit.item_id,
                total = audit.total_quantity,
                peak = audit.peak_claimed,
                day = ?audit.peak_day,
                "item oversold"
            );
        }
        if audit.cache_drift() {
            drifted += 1;
            warn!(
                item_id = %audit.item_id,
                cached = audit.cached_available,
                expected = audit.expected_available,
                "cached stock drifted from bookings"
            );
        }
        info!(
            item_id = %audit.item_id,
            name = item.name.as_deref().unwrap_or("-"),
            total = audit.total_quantity,
            available = audit.cached_available,
            peak = audit.peak_claimed,
            active_claims = audit.active_claims,
            "item audited"
        );
    }
    info!(items = items.len(), oversold, drifted, "audit complete");

    if config.compact {
        let events = engine.compact_wal().await?;
        info!(events, "WAL rewritten");
    }

    Ok(())
}
