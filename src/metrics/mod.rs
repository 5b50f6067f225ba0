//! Metrics and observability
//!
//! Prometheus-compatible counters, gauges and histograms under the
//! `megaswarm_` prefix: chunk transfers, relaying, integrity failures,
//! healing, evictions, peer count and local storage use.

pub mod exporter;
pub mod recorder;

pub use exporter::{metrics_route, render_metrics, start_metrics_server, MetricsConfig, MetricsError};
pub use recorder::{
    init_metrics, record_chunk_duration, record_chunk_fetched, record_chunk_sent, record_evictions,
    record_heals, record_host_failure, record_integrity_failure, set_peer_count, set_storage_used,
    OperationMetrics,
};
