use std::net::SocketAddr;

use crate::admission::AdmissionError;

// ── Admission outcomes ──────────────────────────────────────────

/// Counter: requests that reached a final outcome. Labels: outcome.
pub const ADMISSIONS_TOTAL: &str = "admitd_admissions_total";

/// Counter: processing attempts started by workers.
pub const ATTEMPTS_TOTAL: &str = "admitd_attempts_total";

/// Counter: attempts that failed and were rescheduled. Labels: reason.
pub const RETRIES_TOTAL: &str = "admitd_retries_total";

/// Histogram: duration of one attempt (conflict query + create) in seconds.
pub const ATTEMPT_DURATION_SECONDS: &str = "admitd_attempt_duration_seconds";

// ── Utilization ─────────────────────────────────────────────────

/// Gauge: requests waiting in the admission queue.
pub const QUEUE_DEPTH: &str = "admitd_queue_depth";

/// Gauge: requests parked in the delay scheduler.
pub const DELAYED_PENDING: &str = "admitd_delayed_pending";

/// Gauge: worker loops currently alive.
pub const WORKERS_ACTIVE: &str = "admitd_workers_active";

/// Histogram: booking log group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "admitd_wal_flush_duration_seconds";

/// Histogram: booking log group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "admitd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for the final outcome of a request.
pub fn outcome_label(result: &Result<ulid::Ulid, AdmissionError>) -> &'static str {
    match result {
        Ok(_) => "admitted",
        Err(AdmissionError::Exhausted { .. }) => "exhausted",
        Err(AdmissionError::ShuttingDown) => "rejected",
        Err(AdmissionError::Cancelled) => "cancelled",
        Err(AdmissionError::Internal(_)) => "internal",
        Err(AdmissionError::InvalidInput(_)) => "invalid",
        Err(AdmissionError::Conflict { .. }) => "conflict",
        Err(AdmissionError::Store(_)) => "store_error",
    }
}

/// Short label for why an attempt is being retried.
pub fn retry_reason(cause: &AdmissionError) -> &'static str {
    match cause {
        AdmissionError::Conflict { .. } => "conflict",
        AdmissionError::Store(_) => "store",
        _ => "other",
    }
}
