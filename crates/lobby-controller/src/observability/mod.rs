//! Observability: health probes and metrics export.

pub mod health;
