use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "reservas_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "reservas_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "reservas_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "reservas_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "reservas_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "reservas_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reservas_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reservas_wal_flush_batch_size";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: individual bookings committed (one per occurrence).
pub const BOOKINGS_CREATED_TOTAL: &str = "reservas_bookings_created_total";

/// Counter: inserts or edits rejected by the overlap check.
pub const BOOKING_CONFLICTS_TOTAL: &str = "reservas_booking_conflicts_total";

/// Counter: series transactions dropped without commit.
pub const SERIES_ROLLED_BACK_TOTAL: &str = "reservas_series_rolled_back_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertFacility { .. } => "insert_facility",
        Command::UpdateFacility { .. } => "update_facility",
        Command::DeleteFacility { .. } => "delete_facility",
        Command::SelectFacilities => "select_facilities",
        Command::InsertBookings { .. } => "insert_bookings",
        Command::UpdateBooking { .. } => "update_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectAvailability { .. } => "select_availability",
    }
}
