use std::net::SocketAddr;

use crate::protocol::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total commands executed. Labels: command, status.
pub const COMMANDS_TOTAL: &str = "mentorbook_commands_total";

/// Histogram: command latency in seconds. Labels: command.
pub const COMMAND_DURATION_SECONDS: &str = "mentorbook_command_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: bookings created (PENDING).
pub const BOOKINGS_CREATED_TOTAL: &str = "mentorbook_bookings_created_total";

/// Counter: create attempts refused because the slot was held.
pub const SLOT_CONFLICTS_TOTAL: &str = "mentorbook_slot_conflicts_total";

/// Counter: payments settled (each one confirms a booking).
pub const SETTLEMENTS_TOTAL: &str = "mentorbook_settlements_total";

/// Counter: bookings cancelled.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "mentorbook_bookings_cancelled_total";

/// Counter: confirmation notices. Labels: status (ok, failed).
pub const NOTIFICATIONS_TOTAL: &str = "mentorbook_notifications_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "mentorbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "mentorbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "mentorbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "mentorbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "mentorbook_wal_flush_batch_size";

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
        Command::RegisterAccount { .. } => "register_account",
        Command::UpsertMentor { .. } => "upsert_mentor",
        Command::ReplaceAvailability { .. } => "replace_availability",
        Command::Availability { .. } => "availability",
        Command::CreateBooking { .. } => "create_booking",
        Command::ConfirmBooking { .. } => "confirm_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::CompleteBooking { .. } => "complete_booking",
        Command::GetBooking { .. } => "get_booking",
        Command::ListMentorBookings { .. } => "list_mentor_bookings",
        Command::ListMenteeBookings { .. } => "list_mentee_bookings",
        Command::SettlePayment { .. } => "settle_payment",
        Command::GetPayment { .. } => "get_payment",
        Command::Subscribe { .. } => "subscribe",
    }
}
