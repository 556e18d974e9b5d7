// src/core/metrics.rs

//! Defines and registers Prometheus metrics for server monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, Gauge, GaugeVec, Histogram, TextEncoder, register_counter, register_gauge,
    register_gauge_vec, register_histogram,
};

lazy_static! {
    // --- Server-wide Gauges ---
    /// The number of clients currently connected to the server.
    pub static ref CONNECTED_CLIENTS: Gauge =
        register_gauge!("spallocd_connected_clients", "Number of currently connected clients.").unwrap();
    /// The number of jobs currently known to the controller, by state.
    pub static ref JOBS_BY_STATE: GaugeVec =
        register_gauge_vec!("spallocd_jobs", "Number of jobs in each lifecycle state.", &["state"]).unwrap();
    /// The number of boards with a queued power command, per machine.
    pub static ref QUEUED_POWER_COMMANDS: GaugeVec =
        register_gauge_vec!("spallocd_queued_power_commands", "Power commands queued in a machine's ABMC.", &["machine"]).unwrap();
    /// The number of boards with a queued link command, per machine.
    pub static ref QUEUED_LINK_COMMANDS: GaugeVec =
        register_gauge_vec!("spallocd_queued_link_commands", "Link commands queued in a machine's ABMC.", &["machine"]).unwrap();

    // --- Server-wide Counters ---
    /// The total number of commands processed by the server since startup.
    pub static ref COMMANDS_PROCESSED_TOTAL: Counter =
        register_counter!("spallocd_commands_processed_total", "Total number of commands processed.").unwrap();
    /// The total number of connections accepted by the server since startup.
    pub static ref CONNECTIONS_RECEIVED_TOTAL: Counter =
        register_counter!("spallocd_connections_received_total", "Total number of connections received.").unwrap();
    /// The total number of jobs destroyed because their keepalive expired.
    pub static ref KEEPALIVE_EXPIRY_TOTAL: Counter =
        register_counter!("spallocd_keepalive_expiry_total", "Total number of jobs destroyed due to keepalive expiry.").unwrap();
    /// The total number of config file reloads applied.
    pub static ref CONFIG_RELOADS_TOTAL: Counter =
        register_counter!("spallocd_config_reloads_total", "Total number of configuration reloads applied.").unwrap();

    // --- Histograms ---
    /// A histogram of command dispatch latencies.
    pub static ref COMMAND_LATENCY_SECONDS: Histogram =
        register_histogram!("spallocd_command_latency_seconds", "Latency of command processing in seconds.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
