//! Prometheus metrics for the settlement service
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Gauge, GaugeVec, HistogramVec,
};

lazy_static! {
    pub static ref BRIDGES_CREATED: CounterVec = register_counter_vec!(
        "settlement_bridges_created_total",
        "Total number of deposit bridges created",
        &["vault"]
    ).unwrap();

    pub static ref BRIDGE_TRANSITIONS: CounterVec = register_counter_vec!(
        "settlement_bridge_transitions_total",
        "Deposit bridge status transitions",
        &["status"]
    ).unwrap();

    pub static ref REDEMPTIONS_CREATED: Counter = register_counter!(
        "settlement_redemptions_created_total",
        "Total number of redemptions created"
    ).unwrap();

    pub static ref REDEMPTION_TRANSITIONS: CounterVec = register_counter_vec!(
        "settlement_redemption_transitions_total",
        "Redemption status transitions",
        &["status"]
    ).unwrap();

    /// Conditional updates that found the record already moved on
    pub static ref CLAIM_CONFLICTS: CounterVec = register_counter_vec!(
        "settlement_claim_conflicts_total",
        "Claims lost to a concurrent worker",
        &["entity", "step"]
    ).unwrap();

    pub static ref PROOF_REQUESTS: CounterVec = register_counter_vec!(
        "settlement_proof_requests_total",
        "Attestation proof requests",
        &["outcome"]
    ).unwrap();

    pub static ref PROOF_LATENCY: HistogramVec = register_histogram_vec!(
        "settlement_proof_latency_seconds",
        "Time from attestation request to finalized proof",
        &["entity"],
        vec![30.0, 60.0, 90.0, 180.0, 300.0, 600.0, 1200.0]
    ).unwrap();

    pub static ref EXTERNAL_ERRORS: CounterVec = register_counter_vec!(
        "settlement_external_errors_total",
        "Errors returned by external collaborators",
        &["service"]
    ).unwrap();

    pub static ref CANCELLATIONS: CounterVec = register_counter_vec!(
        "settlement_cancellations_total",
        "Cancellation attempts by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref RECOVERABLE_BACKLOG: GaugeVec = register_gauge_vec!(
        "settlement_recoverable_backlog",
        "Records surfaced by the recoverable listing",
        &["entity"]
    ).unwrap();

    pub static ref UP: Gauge = register_gauge!(
        "settlement_up",
        "Whether the settlement service is up and running"
    ).unwrap();
}

pub fn record_bridge_created(vault: &str) {
    BRIDGES_CREATED.with_label_values(&[vault]).inc();
}

pub fn record_bridge_transition(status: &str) {
    BRIDGE_TRANSITIONS.with_label_values(&[status]).inc();
}

pub fn record_redemption_created() {
    REDEMPTIONS_CREATED.inc();
}

pub fn record_redemption_transition(status: &str) {
    REDEMPTION_TRANSITIONS.with_label_values(&[status]).inc();
}

/// Record a lost claim
pub fn record_claim_conflict(entity: &str, step: &str) {
    CLAIM_CONFLICTS.with_label_values(&[entity, step]).inc();
}

pub fn record_proof_request(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    PROOF_REQUESTS.with_label_values(&[outcome]).inc();
}

pub fn record_proof_latency(entity: &str, seconds: f64) {
    PROOF_LATENCY.with_label_values(&[entity]).observe(seconds);
}

pub fn record_external_error(service: &str) {
    EXTERNAL_ERRORS.with_label_values(&[service]).inc();
}

pub fn record_cancellation(outcome: &str) {
    CANCELLATIONS.with_label_values(&[outcome]).inc();
}

pub fn set_recoverable_backlog(entity: &str, count: usize) {
    RECOVERABLE_BACKLOG
        .with_label_values(&[entity])
        .set(count as f64);
}

/// Mark service as up
pub fn set_up(up: bool) {
    UP.set(if up { 1.0 } else { 0.0 });
}
