//! Observability — call metrics
//!
//! Prometheus-compatible counters for the call path. Logging goes through
//! `tracing` throughout the crate.

pub mod metrics;

pub use metrics::{GateMetrics, MetricsSnapshot};
