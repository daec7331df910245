use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "chairline_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "chairline_request_duration_seconds";

// ── Scheduling & reconciliation ─────────────────────────────────

/// Counter: assignments rejected because of overlapping bookings.
pub const ASSIGNMENT_CONFLICTS_TOTAL: &str = "chairline_assignment_conflicts_total";

/// Counter: transaction attempts retried after a transient failure. Labels: op.
pub const TX_RETRIES_TOTAL: &str = "chairline_tx_retries_total";

/// Counter: operations that exhausted the retry policy. Labels: op.
pub const TX_EXHAUSTED_TOTAL: &str = "chairline_tx_exhausted_total";

/// Counter: payment events ignored as duplicates. Labels: channel.
pub const PAYMENT_DUPLICATES_TOTAL: &str = "chairline_payment_duplicates_total";

/// Counter: payment events applied. Labels: channel, status.
pub const PAYMENT_TRANSITIONS_TOTAL: &str = "chairline_payment_transitions_total";

/// Counter: payment anomalies recorded. Labels: kind.
pub const PAYMENT_ANOMALIES_TOTAL: &str = "chairline_payment_anomalies_total";

/// Counter: failed outbound notification deliveries. Labels: sink.
pub const NOTIFY_FAILURES_TOTAL: &str = "chairline_notify_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "chairline_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "chairline_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "chairline_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "chairline_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "chairline_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
