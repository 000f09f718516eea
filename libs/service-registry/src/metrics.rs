//! Registry metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!`.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};

lazy_static! {
    /// Count of registration passes where every record was applied
    pub static ref REGISTRY_PASS_SUCCEEDED: IntCounter = register_int_counter!(
        "registry_pass_succeeded",
        "count of registration passes that applied every record"
    ).unwrap();

    /// Count of registration passes where some records failed
    pub static ref REGISTRY_PASS_PARTIAL: IntCounter = register_int_counter!(
        "registry_pass_partial",
        "count of registration passes that applied only a subset of records"
    ).unwrap();

    /// Count of registration passes that could not run at all
    pub static ref REGISTRY_PASS_NOT_RUN: IntCounter = register_int_counter!(
        "registry_pass_not_run",
        "count of registration passes that could not run"
    ).unwrap();

    /// Count of attempts to establish a session
    pub static ref REGISTRY_CONNECT_ATTEMPTS: IntCounter = register_int_counter!(
        "registry_connect_attempts",
        "count of attempts to establish a coordination session"
    ).unwrap();

    /// Count of sessions lost after being established
    pub static ref REGISTRY_SESSION_EXPIRED: IntCounter = register_int_counter!(
        "registry_session_expired",
        "count of coordination sessions lost or expired"
    ).unwrap();

    /// Gauge: 1 while a session is live, 0 otherwise
    pub static ref REGISTRY_CONNECTED: IntGauge = register_int_gauge!(
        "registry_connected",
        "current session state (1=connected, 0=not connected)"
    ).unwrap();
}
