use std::net::SocketAddr;

use crate::protocol::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "deskhold_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "deskhold_request_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "deskhold_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "deskhold_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "deskhold_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "deskhold_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "deskhold_wal_flush_batch_size";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: reservation locks granted.
pub const LOCKS_GRANTED_TOTAL: &str = "deskhold_locks_granted_total";

/// Counter: reservation locks refused because of overlapping claims.
pub const LOCKS_REJECTED_TOTAL: &str = "deskhold_locks_rejected_total";

/// Counter: expired holds released by the reaper.
pub const HOLDS_REAPED_TOTAL: &str = "deskhold_holds_reaped_total";

/// Counter: unpaid or unanswered bookings cancelled by the reaper.
pub const BOOKINGS_EXPIRED_TOTAL: &str = "deskhold_bookings_expired_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
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

/// Map a request to a short label for metrics.
pub fn request_label(req: &Request) -> &'static str {
    match req {
        Request::RegisterSpace { .. } => "register_space",
        Request::UpdateSpace { .. } => "update_space",
        Request::RemoveSpace { .. } => "remove_space",
        Request::GetSpace { .. } => "get_space",
        Request::GetAvailability { .. } => "get_availability",
        Request::CheckConflicts { .. } => "check_conflicts",
        Request::AcquireLock(_) => "acquire_lock",
        Request::ReleaseHold { .. } => "release_hold",
        Request::RefreshHold { .. } => "refresh_hold",
        Request::PromoteHold(_) => "promote_hold",
        Request::TransitionBooking { .. } => "transition_booking",
        Request::CancelBooking { .. } => "cancel_booking",
        Request::AlternativeSlots { .. } => "alternative_slots",
        Request::BatchCheck { .. } => "batch_check",
        Request::DaySlots { .. } => "day_slots",
        Request::DayBookings { .. } => "day_bookings",
        Request::Watch { .. } => "watch",
    }
}
