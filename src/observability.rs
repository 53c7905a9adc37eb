use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "salonbook_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "salonbook_request_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: proposals and reschedules. Labels: outcome (error code or "booked").
pub const BOOKINGS_TOTAL: &str = "salonbook_bookings_total";

/// Counter: slot listings computed.
pub const SLOT_QUERIES_TOTAL: &str = "salonbook_slot_queries_total";

/// Counter: ledger entries written.
pub const LEDGER_ENTRIES_TOTAL: &str = "salonbook_ledger_entries_total";

/// Counter: notifications that failed to deliver.
pub const NOTIFY_FAILURES_TOTAL: &str = "salonbook_notify_failures_total";

/// Counter: notices a slow listener missed.
pub const NOTICES_DROPPED_TOTAL: &str = "salonbook_notices_dropped_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "salonbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "salonbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "salonbook_connections_rejected_total";

/// Gauge: tenants with a loaded shard.
pub const TENANTS_ACTIVE: &str = "salonbook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "salonbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "salonbook_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a request, used on the RED metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Ping => "ping",
        Request::Slots { .. } => "slots",
        Request::Propose { .. } => "propose",
        Request::Reschedule { .. } => "reschedule",
        Request::Confirm { .. } => "confirm",
        Request::Complete { .. } => "complete",
        Request::Cancel { .. } => "cancel",
        Request::NoShow { .. } => "no_show",
        Request::Erase { .. } => "erase",
        Request::Get { .. } => "get",
        Request::Day { .. } => "day",
        Request::ManageGet { .. } => "manage_get",
        Request::ManageCancel { .. } => "manage_cancel",
        Request::ManageReschedule { .. } => "manage_reschedule",
        Request::SetConfig { .. } => "set_config",
        Request::PutWindow { .. } => "put_window",
        Request::RemoveWindow { .. } => "remove_window",
        Request::PutService { .. } => "put_service",
        Request::Block { .. } => "block",
        Request::Unblock { .. } => "unblock",
        Request::Ledger { .. } => "ledger",
        Request::Listen { .. } => "listen",
        Request::Unlisten { .. } => "unlisten",
    }
}
