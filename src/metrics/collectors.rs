//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! and tests can record freely.

use super::prometheus::{
    BATCHES_TOTAL, BATCH_DURATION, BUSY_HANDLES, DEVICE_LOADS_TOTAL, DOCUMENTS_TOTAL,
    LLM_LATENCY, LLM_REQUESTS_TOTAL, QA_PAIRS_TOTAL, QUALITY_SCORE,
};

/// Metrics collector for recording qa-forge operational metrics.
///
/// # Example
///
/// ```ignore
/// use qa_forge::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_batch("completed", 12.5);
/// collector.record_quality(0.82, true);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a document reaching its final status.
    pub fn record_document(&self, status: &str) {
        if let Some(documents) = DOCUMENTS_TOTAL.get() {
            documents.with_label_values(&[status]).inc();
        }
    }

    /// Record a finished batch.
    ///
    /// * `outcome` - "completed", "failed" or "timeout"
    /// * `duration_secs` - wall time from dispatch to settlement
    pub fn record_batch(&self, outcome: &str, duration_secs: f64) {
        if let Some(batches) = BATCHES_TOTAL.get() {
            batches.with_label_values(&[outcome]).inc();
        }

        if let Some(duration) = BATCH_DURATION.get() {
            duration.with_label_values(&[outcome]).observe(duration_secs);
        }

        tracing::trace!(
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded batch metric"
        );
    }

    /// Record a batch that was never dispatched. It has no duration.
    pub fn record_cancelled_batch(&self) {
        if let Some(batches) = BATCHES_TOTAL.get() {
            batches.with_label_values(&["cancelled"]).inc();
        }
    }

    /// Record one scored QA pair.
    pub fn record_quality(&self, score: f64, accepted: bool) {
        if let Some(histogram) = QUALITY_SCORE.get() {
            histogram.observe(score);
        }

        if let Some(pairs) = QA_PAIRS_TOTAL.get() {
            pairs.with_label_values(&["generated"]).inc();
            pairs
                .with_label_values(&[if accepted { "accepted" } else { "rejected" }])
                .inc();
        }
    }

    pub fn record_device_load(&self, device: &str, success: bool) {
        let status = if success { "ready" } else { "error" };
        if let Some(loads) = DEVICE_LOADS_TOTAL.get() {
            loads.with_label_values(&[device, status]).inc();
        }
    }

    pub fn set_busy_handles(&self, count: usize) {
        if let Some(gauge) = BUSY_HANDLES.get() {
            gauge.set(count as f64);
        }
    }

    /// Record one inference request to a model server.
    pub fn record_llm_request(&self, model: &str, success: bool, latency_secs: f64) {
        let status = if success { "success" } else { "failure" };

        if let Some(requests) = LLM_REQUESTS_TOTAL.get() {
            requests.with_label_values(&[model, status]).inc();
        }

        if let Some(latency) = LLM_LATENCY.get() {
            latency.with_label_values(&[model]).observe(latency_secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_recording_before_init_is_noop() {
        // Must not panic whether or not another test initialized first.
        let collector = MetricsCollector::new();
        collector.record_document("processed");
        collector.set_busy_handles(0);
    }

    #[test]
    fn test_record_batch_and_quality() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_batch("completed", 3.5);
        collector.record_batch("timeout", 600.0);
        collector.record_cancelled_batch();
        collector.record_quality(0.9, true);
        collector.record_quality(0.5, false);

        let text = export_metrics();
        assert!(text.contains("qa_forge_batches_total"));
        assert!(text.contains("qa_forge_quality_score"));
        assert!(text.contains("decision=\"accepted\""));
        assert!(text.contains("outcome=\"cancelled\""));
    }

    #[test]
    fn test_device_and_busy_metrics() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_device_load("0", true);
        collector.record_device_load("1", false);
        collector.set_busy_handles(2);
        collector.record_llm_request("Qwen/QwQ-32B", true, 1.2);

        let text = export_metrics();
        assert!(text.contains("qa_forge_device_loads_total"));
        assert!(text.contains("qa_forge_busy_handles"));
    }
}
