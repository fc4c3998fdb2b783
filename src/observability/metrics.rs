//! Metrics collection and exposition.
//!
//! # Metrics
//! - `tanshell_transactions_total` (counter): logical submissions by outcome
//! - `tanshell_contention_retries_total` (counter): retries by contention kind
//! - `tanshell_chunks_submitted_total` (counter): chunks by stream kind
//! - `tanshell_streams_total` (counter): finished streams by kind and outcome
//! - `tanshell_pending_reassemblies` (gauge): inbound commands still accumulating
//! - `tanshell_commands_total` (counter): commands handled by the server
//!
//! Recording is a no-op until a recorder is installed, so library users and
//! tests pay nothing.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus exporter with an HTTP scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_transaction(outcome: &'static str) {
    counter!("tanshell_transactions_total", "outcome" => outcome).increment(1);
}

pub fn record_contention(kind: &'static str) {
    counter!("tanshell_contention_retries_total", "kind" => kind).increment(1);
}

pub fn record_chunk(kind: &'static str) {
    counter!("tanshell_chunks_submitted_total", "kind" => kind).increment(1);
}

pub fn record_stream(kind: &'static str, outcome: &'static str) {
    counter!("tanshell_streams_total", "kind" => kind, "outcome" => outcome).increment(1);
}

pub fn record_pending_reassemblies(count: usize) {
    gauge!("tanshell_pending_reassemblies").set(count as f64);
}

pub fn record_command(outcome: &'static str) {
    counter!("tanshell_commands_total", "outcome" => outcome).increment(1);
}
