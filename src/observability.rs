use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotguard_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotguard_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: reservation-guard decisions. Labels: op, kind, outcome.
pub const RESERVATIONS_TOTAL: &str = "slotguard_reservations_total";

/// Counter: payment notices handled. Labels: product, outcome.
pub const PAYMENTS_TOTAL: &str = "slotguard_payments_total";

/// Counter: optimistic transactions re-run after a version change. Labels: op.
pub const TXN_RETRIES_TOTAL: &str = "slotguard_txn_retries_total";

/// Counter: transactions that gave up after the retry budget. Labels: op.
pub const TXN_CONFLICTS_TOTAL: &str = "slotguard_txn_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotguard_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotguard_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotguard_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "slotguard_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotguard_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotguard_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertTutor { .. } => "insert_tutor",
        Command::InsertBooking { .. } => "insert_booking",
        Command::InsertGroupSession { .. } => "insert_group_session",
        Command::InsertTimeOff { .. } => "insert_time_off",
        Command::Reschedule { .. } => "reschedule",
        Command::Cancel { .. } => "cancel",
        Command::SetStatus { .. } => "set_status",
        Command::RegisterParticipant { .. } => "register_participant",
        Command::UnregisterParticipant { .. } => "unregister_participant",
        Command::ApplyPayment { .. } => "apply_payment",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectTutors => "select_tutors",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectGroupSessions { .. } => "select_group_sessions",
        Command::SelectTimeOff { .. } => "select_time_off",
        Command::SelectCredits { .. } => "select_credits",
    }
}
