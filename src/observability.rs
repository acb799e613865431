use std::net::SocketAddr;
use std::time::Instant;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations executed. Labels: operation, status.
pub const OPERATIONS_TOTAL: &str = "stockbook_operations_total";

/// Histogram: operation latency in seconds. Labels: operation.
pub const OPERATION_DURATION_SECONDS: &str = "stockbook_operation_duration_seconds";

/// Counter: line items turned away for lack of capacity.
pub const AVAILABILITY_REJECTIONS_TOTAL: &str = "stockbook_availability_rejections_total";

// ── Contention ──────────────────────────────────────────────────

/// Counter: booking or item lock waits that hit the timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "stockbook_lock_timeouts_total";

/// Counter: booking-number draws that collided with an existing number.
pub const BOOKING_NUMBER_RETRIES_TOTAL: &str = "stockbook_booking_number_retries_total";

/// Counter: ledger/cache inconsistencies noticed at runtime. Labels: kind.
pub const CONSISTENCY_WARNINGS_TOTAL: &str = "stockbook_consistency_warnings_total";

// ── WAL ─────────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "stockbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "stockbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Count and time one engine operation.
pub fn record_operation<T>(operation: &'static str, result: &Result<T, EngineError>, started: Instant) {
    let status = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!(OPERATIONS_TOTAL, "operation" => operation, "status" => status).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "operation" => operation)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = result {
        tracing::debug!(operation, error = %e, "operation failed");
    }
}
