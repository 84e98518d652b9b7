use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "bookd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "bookd_query_duration_seconds";

/// Counter: reservation operations by outcome. Labels: op, outcome.
pub const RESERVATION_OPS_TOTAL: &str = "bookd_reservation_ops_total";

/// Counter: notices the notifier failed to deliver.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "bookd_notifications_failed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "bookd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "bookd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "bookd_connections_rejected_total";

/// Gauge: organizations with a loaded engine.
pub const TENANTS_ACTIVE: &str = "bookd_tenants_active";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "bookd_wal_compactions_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookd_wal_flush_batch_size";

#[derive(Debug, thiserror::Error)]
#[error("failed to install Prometheus exporter: {0}")]
pub struct MetricsInitError(#[from] metrics_exporter_prometheus::BuildError);

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), MetricsInitError> {
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
        Command::InsertUser { .. } => "insert_user",
        Command::InsertFacility { .. } => "insert_facility",
        Command::UpdateFacility { .. } => "update_facility",
        Command::DeleteFacility { .. } => "delete_facility",
        Command::SelectFacilities { .. } => "select_facilities",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::SetReservationStatus { .. } => "set_reservation_status",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectBusySlots { .. } => "select_busy_slots",
        Command::SelectFreeSlots { .. } => "select_free_slots",
        Command::SelectApprovalLog { .. } => "select_approval_log",
    }
}
