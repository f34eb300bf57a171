//! Coordinator metrics.
//!
//! Thin wrappers over the `metrics` macros so handler code records by name
//! without repeating label plumbing. Exported via the Prometheus endpoint.

use metrics::{counter, gauge};

pub fn record_event(event_type: &'static str) {
    counter!("lobby_events_total", "event" => event_type).increment(1);
}

pub fn record_error(kind: &'static str) {
    counter!("lobby_errors_total", "kind" => kind).increment(1);
}

pub fn set_active_sessions(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("lobby_sessions_active").set(count as f64);
}

pub fn set_active_connections(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("lobby_connections_active").set(count as f64);
}

pub fn record_patient_approved() {
    counter!("lobby_patients_approved_total").increment(1);
}

pub fn record_patient_rejected() {
    counter!("lobby_patients_rejected_total").increment(1);
}

pub fn record_session_ended(reason: &'static str) {
    counter!("lobby_sessions_ended_total", "reason" => reason).increment(1);
}
