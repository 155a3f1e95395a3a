//! In-process metrics rendered as Prometheus text by `/metrics`.

pub mod metrics;

pub use metrics::GatewayMetrics;
