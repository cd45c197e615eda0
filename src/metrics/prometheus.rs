//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by qa-forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all qa-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Documents by final status (processed, failed).
pub static DOCUMENTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Batches by outcome (completed, failed, timeout, cancelled).
pub static BATCHES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Batch generation duration in seconds, labeled by outcome.
pub static BATCH_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// QA pairs by decision (generated, accepted, rejected).
pub static QA_PAIRS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Distribution of quality scores.
pub static QUALITY_SCORE: OnceLock<Histogram> = OnceLock::new();

/// Device load attempts, labeled by device and status.
pub static DEVICE_LOADS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Model handles currently leased to a batch.
pub static BUSY_HANDLES: OnceLock<Gauge> = OnceLock::new();

/// Inference requests to model servers, labeled by model and status.
pub static LLM_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Inference request latency in seconds, labeled by model.
pub static LLM_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let documents_total = CounterVec::new(
        Opts::new("qa_forge_documents_total", "Documents by final status"),
        &["status"],
    )?;

    let batches_total = CounterVec::new(
        Opts::new("qa_forge_batches_total", "Batches by outcome"),
        &["outcome"],
    )?;

    let batch_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "qa_forge_batch_duration_seconds",
            "Batch generation duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        &["outcome"],
    )?;

    let qa_pairs_total = CounterVec::new(
        Opts::new("qa_forge_qa_pairs_total", "QA pairs by decision"),
        &["decision"],
    )?;

    let quality_score = Histogram::with_opts(
        prometheus::HistogramOpts::new("qa_forge_quality_score", "Distribution of quality scores")
            .buckets(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]),
    )?;

    let device_loads_total = CounterVec::new(
        Opts::new("qa_forge_device_loads_total", "Model load attempts per device"),
        &["device", "status"],
    )?;

    let busy_handles = Gauge::new(
        "qa_forge_busy_handles",
        "Model handles currently processing a batch",
    )?;

    let llm_requests_total = CounterVec::new(
        Opts::new("qa_forge_llm_requests_total", "Inference requests to model servers"),
        &["model", "status"],
    )?;

    let llm_latency = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "qa_forge_llm_latency_seconds",
            "Inference request latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 120.0]),
        &["model"],
    )?;

    registry.register(Box::new(documents_total.clone()))?;
    registry.register(Box::new(batches_total.clone()))?;
    registry.register(Box::new(batch_duration.clone()))?;
    registry.register(Box::new(qa_pairs_total.clone()))?;
    registry.register(Box::new(quality_score.clone()))?;
    registry.register(Box::new(device_loads_total.clone()))?;
    registry.register(Box::new(busy_handles.clone()))?;
    registry.register(Box::new(llm_requests_total.clone()))?;
    registry.register(Box::new(llm_latency.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = DOCUMENTS_TOTAL.set(documents_total);
    let _ = BATCHES_TOTAL.set(batches_total);
    let _ = BATCH_DURATION.set(batch_duration);
    let _ = QA_PAIRS_TOTAL.set(qa_pairs_total);
    let _ = QUALITY_SCORE.set(quality_score);
    let _ = DEVICE_LOADS_TOTAL.set(device_loads_total);
    let _ = BUSY_HANDLES.set(busy_handles);
    let _ = LLM_REQUESTS_TOTAL.set(llm_requests_total);
    let _ = LLM_LATENCY.set(llm_latency);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
