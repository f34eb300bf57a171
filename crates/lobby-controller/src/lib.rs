//! Lobby Controller
//!
//! Stateful signaling server for a telemedicine waiting room. Patients
//! connect over WebSocket and queue in a per-session waiting lobby; a doctor
//! joins the session, approves or rejects waiting patients, and ends the
//! meeting for everyone. A single coordinator actor owns all session state,
//! so every event is applied serially and atomically.

pub mod config;
pub mod coordinator;
pub mod errors;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod server;
