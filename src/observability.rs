use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "parkd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "parkd_query_duration_seconds";

/// Counter: reservation requests rejected for overlapping an active booking.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "parkd_reservation_conflicts_total";

pub const RESERVATIONS_CREATED_TOTAL: &str = "parkd_reservations_created_total";

pub const RESERVATIONS_CANCELLED_TOTAL: &str = "parkd_reservations_cancelled_total";

// ── Dispatcher ──────────────────────────────────────────────────

/// Counter: job firings. Labels: kind, outcome.
pub const JOB_FIRINGS_TOTAL: &str = "parkd_job_firings_total";

/// Histogram: wall time of one job action in seconds. Labels: kind.
pub const JOB_DURATION_SECONDS: &str = "parkd_job_duration_seconds";

/// Histogram: wall time of a whole dispatcher tick in seconds.
pub const TICK_DURATION_SECONDS: &str = "parkd_tick_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "parkd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "parkd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "parkd_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkd_wal_flush_batch_size";

/// Counter: journal compactions. Labels: status.
pub const COMPACTIONS_TOTAL: &str = "parkd_compactions_total";

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
        Command::SelectResources => "select_resources",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::DeleteReservation { .. } => "cancel_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectAvailability { .. } => "select_availability",
        Command::UpsertSchedule { .. } => "upsert_schedule",
        Command::SelectSchedules => "select_schedules",
        Command::SetSetting { .. } => "set_setting",
        Command::SelectSettings => "select_settings",
        Command::DeleteOwner { .. } => "forget_owner",
    }
}
