//! Prometheus metrics helpers for hubmirror.
//!
//! # Usage
//!
//! ```rust,ignore
//! use hubmirror_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     if let Some(handle) = init_metrics() {
//!         start_metrics_server(9090, handle).await?;
//!     }
//!
//!     metrics::counter!("backfill_messages_total").increment(1);
//!     Ok(())
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: pipeline stage (`backfill_`, `live_`, `gateway_`)
//! - Suffix: `_total` for counters
//! - No labels; account ids and hashes would explode cardinality

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed.
pub fn init_metrics() -> Option<PrometheusHandle> {
    let handle = try_init_metrics()?;
    register_metrics();
    Some(handle)
}

/// Try to install the Prometheus recorder without registering descriptions.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds `0.0.0.0:port` before returning, then serves `/metrics` from a
/// background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

fn register_metrics() {
    // =========================================================================
    // Backfill
    // =========================================================================

    describe_counter!(
        "backfill_accounts_completed_total",
        "Accounts fully backfilled and marked complete"
    );
    describe_counter!(
        "backfill_accounts_failed_total",
        "Accounts whose backfill failed and will be retried on the next run"
    );
    describe_counter!(
        "backfill_messages_total",
        "Messages merged during backfill"
    );
    describe_gauge!(
        "backfill_running",
        "Whether a backfill is currently running (1=yes, 0=no)"
    );

    // =========================================================================
    // Live subscription
    // =========================================================================

    describe_counter!(
        "live_events_received_total",
        "Events received from the hub subscription"
    );
    describe_counter!(
        "live_events_unrecognized_total",
        "Events of a type the mirror doesn't handle"
    );
    describe_counter!(
        "live_batches_applied_total",
        "Batches merged and committed to the cursor store"
    );
    describe_counter!(
        "live_batch_failures_total",
        "Batches that failed to apply"
    );
    describe_gauge!(
        "live_cursor_event_id",
        "Last committed subscription event id"
    );

    // =========================================================================
    // Persistence gateway
    // =========================================================================

    describe_counter!(
        "gateway_ops_applied_total",
        "Store operations applied"
    );
    describe_counter!(
        "gateway_retries_total",
        "Store operations retried after a transient failure"
    );
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Increment a counter.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Set a gauge value.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    // =========================================================================
    // Initialization tests
    // =========================================================================

    #[test]
    fn test_init_metrics_only_once() {
        let first = init_metrics();
        let second = init_metrics();
        assert!(first.is_none() || second.is_none());
    }

    // =========================================================================
    // Helper function tests
    // =========================================================================

    #[test]
    fn test_increment_does_not_panic() {
        ensure_metrics_init();
        increment("test_counter_total", 0);
        increment("test_counter_total", 1);
        increment("test_counter_total", 100);
    }

    #[test]
    fn test_set_gauge_does_not_panic() {
        ensure_metrics_init();
        set_gauge("test_gauge", 0.0);
        set_gauge("test_gauge", 42.5);
        set_gauge("test_gauge", -1.0);
    }

    #[test]
    fn test_register_metrics_is_repeatable() {
        ensure_metrics_init();
        register_metrics();
        register_metrics();
    }
}
