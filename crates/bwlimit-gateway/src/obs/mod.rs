//! In-process metrics rendered by `/metrics` (Prometheus text format).

pub mod metrics;
