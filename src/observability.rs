use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "offhire_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "offhire_query_duration_seconds";

// ── Reservation lifecycle ───────────────────────────────────────

/// Counter: committed transitions. Labels: transition.
pub const TRANSITIONS_TOTAL: &str = "offhire_transitions_total";

/// Counter: confirms/blocks rejected because the range was taken.
pub const CONFLICTS_TOTAL: &str = "offhire_conflicts_total";

/// Counter: requests expired. Labels: path (lazy, sweep).
pub const EXPIRED_TOTAL: &str = "offhire_expired_total";

/// Counter: notification deliveries. Labels: outcome.
pub const NOTIFICATIONS_TOTAL: &str = "offhire_notifications_total";

/// Counter: submissions rejected by the throttle.
pub const THROTTLED_TOTAL: &str = "offhire_throttled_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "offhire_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "offhire_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "offhire_connections_rejected_total";

/// Gauge: listings loaded in the engine.
pub const LISTINGS_ACTIVE: &str = "offhire_listings_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "offhire_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "offhire_wal_flush_batch_size";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SyncListing { .. } => "sync_listing",
        Command::SetListingStatus { .. } => "set_listing_status",
        Command::RemoveListing { .. } => "remove_listing",
        Command::CreateBlock { .. } => "create_block",
        Command::DeleteBlock { .. } => "delete_block",
        Command::Submit { .. } => "submit",
        Command::Confirm { .. } => "confirm",
        Command::Decline { .. } => "decline",
        Command::Cancel { .. } => "cancel",
        Command::SelectBlocks { .. } => "select_blocks",
        Command::SelectRequest { .. } => "select_request",
        Command::SelectListingRequests { .. } => "select_listing_requests",
        Command::SelectOpenRequests { .. } => "select_open_requests",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::ExpireOverdue => "expire_overdue",
    }
}
