use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotline_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotline_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotline_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotline_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotline_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotline_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotline_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotline_wal_flush_batch_size";

/// Counter: resource lock attempts that timed out.
pub const LOCK_CONFLICTS_TOTAL: &str = "slotline_lock_conflicts_total";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: joins. Labels: outcome (joined, waitlisted).
pub const JOINS_TOTAL: &str = "slotline_joins_total";

/// Counter: confirmations from the waitlist. Labels: outcome (confirmed, requeued).
pub const CONFIRMATIONS_TOTAL: &str = "slotline_confirmations_total";

/// Counter: waitlist entries moved to Notified.
pub const PROMOTIONS_TOTAL: &str = "slotline_promotions_total";

/// Counter: notifications that lapsed unconfirmed.
pub const EXPIRATIONS_TOTAL: &str = "slotline_expirations_total";

/// Counter: notifications broadcast. Labels: event.
pub const NOTIFICATIONS_SENT_TOTAL: &str = "slotline_notifications_sent_total";

/// Histogram: one expiry sweep across a tenant, in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "slotline_sweep_duration_seconds";

/// Counter: resources a sweep had to skip. Labels: reason.
pub const SWEEP_FAILURES_TOTAL: &str = "slotline_sweep_failures_total";

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
        Command::InsertResource { .. } => "insert_resource",
        Command::DeactivateResource { .. } => "deactivate_resource",
        Command::Join { .. } => "join",
        Command::Leave { .. } => "leave",
        Command::JoinWaitlist { .. } => "join_waitlist",
        Command::LeaveWaitlist { .. } => "leave_waitlist",
        Command::Confirm { .. } => "confirm",
        Command::SelectResources => "select_resources",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectWaitlist { .. } => "select_waitlist",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
