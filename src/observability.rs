use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "stayflow_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "stayflow_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "stayflow_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "stayflow_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "stayflow_connections_rejected_total";

/// Counter: sessions whose user name is not a usable actor id.
pub const AUTH_FAILURES_TOTAL: &str = "stayflow_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "stayflow_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "stayflow_wal_flush_batch_size";

/// Counter: WAL compactions that rewrote the log.
pub const WAL_COMPACTIONS_TOTAL: &str = "stayflow_wal_compactions_total";

// ── Booking lifecycle ───────────────────────────────────────────

pub const BOOKINGS_CREATED_TOTAL: &str = "stayflow_bookings_created_total";
pub const BOOKINGS_CONFIRMED_TOTAL: &str = "stayflow_bookings_confirmed_total";
pub const BOOKINGS_CANCELLED_TOTAL: &str = "stayflow_bookings_cancelled_total";
pub const BOOKINGS_DELETED_TOTAL: &str = "stayflow_bookings_deleted_total";

/// Counter: pending bookings auto-cancelled by a confirmation.
pub const BOOKINGS_DISPLACED_TOTAL: &str = "stayflow_bookings_displaced_total";

/// Counter: notifications a lagging consumer never saw.
pub const NOTIFICATIONS_DROPPED_TOTAL: &str = "stayflow_notifications_dropped_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged; the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertUser(_) => "upsert_user",
        Command::UpsertListing(_) => "upsert_listing",
        Command::InsertBooking(_) => "create_booking",
        Command::ConfirmBooking { .. } => "confirm_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::DeleteBooking { .. } => "destroy_booking",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectBookings { mine: false, .. } => "select_bookings",
        Command::SelectBookings { mine: true, .. } => "select_my_bookings",
        Command::SelectPayments => "select_payments",
        Command::SelectBookingLogs { .. } => "select_booking_logs",
        Command::SelectHostStats => "select_host_stats",
        Command::SelectRenterStats => "select_renter_stats",
        Command::SelectCommissionStats => "select_commission_stats",
    }
}
