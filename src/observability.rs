use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "quartermaster_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "quartermaster_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: availability checks. Labels: outcome (available, shortage).
pub const AVAILABILITY_CHECKS_TOTAL: &str = "quartermaster_availability_checks_total";

/// Counter: allocation attempts. Labels: outcome (success, partial, or error kind).
pub const ALLOCATIONS_TOTAL: &str = "quartermaster_allocations_total";

/// Counter: units that failed the re-check under lock.
pub const CONFLICTS_TOTAL: &str = "quartermaster_conflicts_total";

/// Counter: committed request transitions. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "quartermaster_transitions_total";

/// Counter: entities marked overdue. Labels: kind (borrow, request).
pub const OVERDUE_MARKED_TOTAL: &str = "quartermaster_overdue_marked_total";

/// Histogram: overdue sweep duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "quartermaster_sweep_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "quartermaster_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "quartermaster_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "quartermaster_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "quartermaster_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "quartermaster_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "quartermaster_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "quartermaster_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
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
        Command::InsertCategory { .. } => "insert_category",
        Command::InsertAsset { .. } => "insert_asset",
        Command::SetAssetStatus { .. } => "set_asset_status",
        Command::InsertRequest(_) => "insert_request",
        Command::UpdateRequestStatus { .. } => "update_request_status",
        Command::AcceptBooking { .. } => "accept_booking",
        Command::CancelRequest { .. } => "cancel_request",
        Command::Allocate { .. } => "allocate",
        Command::MarkReturned { .. } => "mark_returned",
        Command::ReturnRequest { .. } => "return_request",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectCategoryAvailability { .. } => "select_category_availability",
        Command::SelectBorrowedAssets(_) => "select_borrowed_assets",
        Command::SelectCategories => "select_categories",
        Command::SelectAssets { .. } => "select_assets",
        Command::SelectRequests(_) => "select_requests",
        Command::SelectAllocations { .. } => "select_allocations",
    }
}
