//! Metrics module for Prometheus-based monitoring.
//!
//! Covers document outcomes, batch dispatch, QA pair decisions and pool
//! occupancy.
//!
//! # Example
//!
//! ```ignore
//! use qa_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.record_document("processed");
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    BATCHES_TOTAL, BATCH_DURATION, BUSY_HANDLES, DEVICE_LOADS_TOTAL, DOCUMENTS_TOTAL,
    LLM_LATENCY, LLM_REQUESTS_TOTAL, QA_PAIRS_TOTAL, QUALITY_SCORE, REGISTRY,
};
