use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "reservd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "reservd_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "reservd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "reservd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "reservd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "reservd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reservd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reservd_wal_flush_batch_size";

// ── Scheduler ───────────────────────────────────────────────────

/// Counter: create/update requests rejected for overlapping an existing reservation.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "reservd_reservation_conflicts_total";

/// Counter: reservations placed by the queue scheduler.
pub const QUEUE_PLACEMENTS_TOTAL: &str = "reservd_queue_placements_total";

/// Histogram: seconds between the queue request and the placed start.
pub const QUEUE_WAIT_SECONDS: &str = "reservd_queue_wait_seconds";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
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
        Command::InsertDeviceType { .. } => "insert_device_type",
        Command::DeleteDeviceType { .. } => "delete_device_type",
        Command::SelectDeviceTypes => "select_device_types",
        Command::InsertDevice { .. } => "insert_device",
        Command::UpdateDevice { .. } => "update_device",
        Command::DeleteDevice { .. } => "delete_device",
        Command::SelectDevices { .. } => "select_devices",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::InsertQueuedReservation { .. } => "insert_queued_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectCurrentReservation => "select_current_reservation",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_without_port_is_noop() {
        assert!(init(None).is_ok());
    }

    #[test]
    fn labels_are_snake_case() {
        let cmd = crate::sql::parse_sql("SELECT * FROM current_reservation").unwrap();
        assert_eq!(command_label(&cmd), "select_current_reservation");
    }
}
