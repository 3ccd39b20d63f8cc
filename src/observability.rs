use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "medislot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "medislot_query_duration_seconds";

// ── Scheduling outcomes ─────────────────────────────────────────

/// Counter: appointments committed.
pub const BOOKINGS_TOTAL: &str = "medislot_bookings_total";

/// Counter: bookings refused because the slot was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "medislot_booking_conflicts_total";

/// Counter: appointments cancelled.
pub const CANCELLATIONS_TOTAL: &str = "medislot_cancellations_total";

/// Counter: reminders published by the background sweep.
pub const REMINDERS_SENT_TOTAL: &str = "medislot_reminders_sent_total";

/// Counter: WAL compactions performed.
pub const COMPACTIONS_TOTAL: &str = "medislot_compactions_total";

// ── Resource utilization ────────────────────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "medislot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "medislot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "medislot_connections_rejected_total";

/// Gauge: loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "medislot_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "medislot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "medislot_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op without a port; a bind
/// failure is logged and the server keeps running unmetered.
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

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertDoctor { .. } => "insert_doctor",
        Command::SelectDoctors => "select_doctors",
        Command::SetAvailability { .. } => "set_availability",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectRecommendedSlots { .. } => "select_recommended_slots",
        Command::InsertAppointment(_) => "insert_appointment",
        Command::CancelAppointment { .. } => "cancel_appointment",
        Command::SetAppointmentStatus { .. } => "set_appointment_status",
        Command::InsertRating { .. } => "insert_rating",
        Command::SelectAppointments(_) => "select_appointments",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
