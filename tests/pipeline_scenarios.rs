//! End-to-end pipeline runs against in-process fake model servers.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use qa_forge::export::{load_results, FAILURES_FILE, RESULTS_FILE, SUMMARY_FILE};
use qa_forge::pipeline::{
    AppConfig, DocumentStatus, FailureKind, GpuDevices, PipelineOrchestrator, QaPair, RunRequest,
};
use qa_forge::pool::{GeneratedPair, ModelLoader, QaGenerator};
use qa_forge::quality::QualityScorer;
use qa_forge::scheduler::{Batch, CancelToken};
use qa_forge::text::NoiseFilter;
use qa_forge::{ConfigError, DeviceLoadError, GenerationError, PipelineError, ScoringError};

/// Shared script and counters for every generator a [`FakeLoader`] hands out.
#[derive(Default)]
struct Script {
    delay: Duration,
    slow_documents: Vec<usize>,
    slow_delay: Duration,
    /// Number of generate calls that fail before calls start succeeding.
    fail_first: AtomicUsize,
    cancel_on_first_call: Option<CancelToken>,
    /// The generator panics on any batch holding this document.
    panic_on_document: Option<usize>,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

struct FakeGenerator {
    script: Arc<Script>,
}

#[async_trait]
impl QaGenerator for FakeGenerator {
    async fn generate(&self, batch: &Batch) -> Result<Vec<GeneratedPair>, GenerationError> {
        let script = &self.script;
        let call = script.calls.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            if let Some(token) = &script.cancel_on_first_call {
                token.cancel();
            }
        }

        if let Some(index) = script.panic_on_document {
            if batch.documents().iter().any(|d| d.index == index) {
                panic!("model server crashed on document {}", index);
            }
        }

        let active = script.active.fetch_add(1, Ordering::SeqCst) + 1;
        script.peak_active.fetch_max(active, Ordering::SeqCst);

        let slow = batch
            .documents()
            .iter()
            .any(|d| script.slow_documents.contains(&d.index));
        tokio::time::sleep(if slow { script.slow_delay } else { script.delay }).await;
        script.active.fetch_sub(1, Ordering::SeqCst);

        let should_fail = script
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(GenerationError::RequestFailed("503 service unavailable".to_string()));
        }

        Ok(batch
            .documents()
            .iter()
            .flat_map(|doc| {
                (0..doc.segments.len()).map(move |s| GeneratedPair {
                    document_index: doc.index,
                    segment_index: s,
                    question: format!("What does document {} describe in part {}?", doc.index, s),
                    answer: "How the backplane drives each subpixel.".to_string(),
                })
            })
            .collect())
    }
}

struct FakeLoader {
    script: Arc<Script>,
    failing_devices: Vec<&'static str>,
}

impl FakeLoader {
    fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            failing_devices: Vec::new(),
        }
    }

    fn failing(mut self, devices: &[&'static str]) -> Self {
        self.failing_devices = devices.to_vec();
        self
    }
}

#[async_trait]
impl ModelLoader for FakeLoader {
    async fn load(
        &self,
        _model_name: &str,
        device: &str,
        _position: usize,
    ) -> Result<Arc<dyn QaGenerator>, DeviceLoadError> {
        if self.failing_devices.contains(&device) {
            return Err(DeviceLoadError::Unreachable {
                device: device.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(Arc::new(FakeGenerator {
            script: Arc::clone(&self.script),
        }))
    }
}

/// Scores every pair of document `i` with `scores[i]`; `None` is unscorable.
struct FixedScorer {
    scores: Vec<Option<f64>>,
}

impl QualityScorer for FixedScorer {
    fn score(&self, pair: &QaPair, _source_segment: &str) -> Result<f64, ScoringError> {
        match self.scores.get(pair.source.document_index) {
            Some(Some(score)) => Ok(*score),
            Some(None) => Err(ScoringError::EmptyAnswer),
            None => Ok(0.9),
        }
    }
}

fn paragraph(i: usize) -> String {
    format!(
        "Document {} explains how the thin film transistor backplane drives each OLED subpixel \
         with a stable current while frame {} is emitted on the display panel.",
        i, i
    )
}

fn write_inputs(dir: &Path, count: usize) {
    for i in 0..count {
        std::fs::write(dir.join(format!("doc_{:02}.txt", i)), paragraph(i)).unwrap();
    }
}

fn orchestrator(loader: FakeLoader, scores: Vec<Option<f64>>) -> PipelineOrchestrator {
    PipelineOrchestrator::new(
        Arc::new(NoiseFilter::with_defaults()),
        Arc::new(FixedScorer { scores }),
        Arc::new(loader),
    )
}

fn request(config: AppConfig, input: &Path, output: &Path, devices: &str, batch_size: usize) -> RunRequest {
    RunRequest::from_config(config)
        .unwrap()
        .with_input_dir(input)
        .with_output_dir(output)
        .with_gpu_devices(GpuDevices::parse(devices).unwrap())
        .with_batch_size(batch_size)
        .with_quality_threshold(0.7)
}

#[tokio::test]
async fn test_sequential_batches_on_single_device() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_inputs(input.path(), 5);

    let loader = FakeLoader::new(Script::default());
    let script = Arc::clone(&loader.script);
    let result = orchestrator(loader, vec![])
        .run(
            request(AppConfig::default(), input.path(), output.path(), "0", 2),
            &CancelToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.stats.batches_dispatched, 3);
    assert_eq!(script.calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.stats.peak_busy_handles, 1);
    assert_eq!(result.stats.documents_processed, 5);
    assert!(result.is_complete());
    assert!(result
        .documents
        .iter()
        .all(|d| d.status == DocumentStatus::Processed));

    let indices: Vec<usize> = result.accepted.iter().map(|p| p.source.document_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_empty_document_is_isolated() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    std::fs::write(input.path().join("a.txt"), paragraph(0)).unwrap();
    std::fs::write(input.path().join("b.txt"), "   \n\n  ").unwrap();
    std::fs::write(input.path().join("c.txt"), paragraph(2)).unwrap();

    let result = orchestrator(FakeLoader::new(Script::default()), vec![])
        .run(
            request(AppConfig::default(), input.path(), output.path(), "0", 2),
            &CancelToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.stats.documents_processed, 2);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].kind, FailureKind::Filter);
    assert!(result.failures[0].document.ends_with("b.txt"));
    assert_eq!(result.documents[1].status, DocumentStatus::Failed);
    assert!(output.path().join(FAILURES_FILE).exists());
}

#[tokio::test]
async fn test_threshold_decides_acceptance() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_inputs(input.path(), 3);

    let result = orchestrator(
        FakeLoader::new(Script::default()),
        vec![Some(0.9), Some(0.5), Some(0.71)],
    )
    .run(
        request(AppConfig::default(), input.path(), output.path(), "0", 3),
        &CancelToken::new(),
    )
    .await
    .unwrap();

    let scores: Vec<f64> = result.accepted.iter().filter_map(|p| p.score()).collect();
    assert_eq!(scores, vec![0.9, 0.71]);
    assert_eq!(result.rejected.len(), 1);
    assert_eq!(result.stats.pairs_generated, 3);
    assert!(result.accepted.iter().all(|p| p.score().unwrap() >= 0.7));

    let written = load_results(output.path().join(RESULTS_FILE)).await.unwrap();
    assert_eq!(written.count, 2);
    assert_eq!(written.pairs[1].document_index, 2);
}

#[tokio::test]
async fn test_unscorable_pair_is_rejected() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_inputs(input.path(), 2);

    let result = orchestrator(FakeLoader::new(Script::default()), vec![None, Some(0.8)])
        .run(
            request(AppConfig::default(), input.path(), output.path(), "0", 2),
            &CancelToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.stats.scoring_errors, 1);
    assert_eq!(result.accepted.len(), 1);
    assert_eq!(result.rejected[0].score(), Some(0.0));
    assert!(result.failures.is_empty());
}

#[tokio::test]
async fn test_all_devices_failing_is_fatal() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_inputs(input.path(), 2);
    let output_dir = output.path().join("results");

    let loader = FakeLoader::new(Script::default()).failing(&["0", "1"]);
    let err = orchestrator(loader, vec![])
        .run(
            request(AppConfig::default(), input.path(), &output_dir, "0,1", 2),
            &CancelToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::AllDevicesFailed(ref errors) if errors.len() == 2));
    assert!(err.is_resource_failure());
    assert!(!output_dir.exists());
}

#[tokio::test]
async fn test_partial_device_failure_continues() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_inputs(input.path(), 4);

    let loader = FakeLoader::new(Script::default()).failing(&["1"]);
    let result = orchestrator(loader, vec![])
        .run(
            request(AppConfig::default(), input.path(), output.path(), "0,1", 1),
            &CancelToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.stats.devices_ready, 1);
    assert_eq!(result.stats.devices_failed, 1);
    assert_eq!(result.accepted.len(), 4);
    assert_eq!(result.stats.peak_busy_handles, 1);
}

#[tokio::test]
async fn test_busy_handles_never_exceed_devices() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_inputs(input.path(), 8);

    let loader = FakeLoader::new(Script {
        delay: Duration::from_millis(50),
        ..Default::default()
    });
    let script = Arc::clone(&loader.script);
    let result = orchestrator(loader, vec![])
        .run(
            request(AppConfig::default(), input.path(), output.path(), "0,1,2", 1),
            &CancelToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.stats.batches_dispatched, 8);
    assert!(result.stats.peak_busy_handles <= 3);
    assert!(script.peak_active.load(Ordering::SeqCst) <= 3);
    assert_eq!(result.accepted.len(), 8);
}

#[tokio::test]
async fn test_batch_timeout_fails_only_that_batch() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_inputs(input.path(), 3);

    let loader = FakeLoader::new(Script {
        slow_documents: vec![1],
        slow_delay: Duration::from_secs(5),
        ..Default::default()
    });
    let config = AppConfig::default().with_batch_timeout(Duration::from_secs(1));
    let result = orchestrator(loader, vec![])
        .run(
            request(config, input.path(), output.path(), "0", 1),
            &CancelToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].kind, FailureKind::Timeout);
    assert_eq!(result.failures[0].document_index, 1);
    assert_eq!(result.failures[0].batch_id, Some(1));
    assert_eq!(result.stats.documents_processed, 2);
}

#[tokio::test]
async fn test_cancellation_finishes_in_flight_batch() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_inputs(input.path(), 5);

    let cancel = CancelToken::new();
    let loader = FakeLoader::new(Script {
        delay: Duration::from_millis(50),
        cancel_on_first_call: Some(cancel.clone()),
        ..Default::default()
    });
    let result = orchestrator(loader, vec![])
        .run(
            request(AppConfig::default(), input.path(), output.path(), "0", 2),
            &cancel,
        )
        .await
        .unwrap();

    assert!(result.cancelled);
    assert!(!result.is_complete());
    assert_eq!(result.accepted.len(), 2);
    let cancelled: Vec<usize> = result
        .failures
        .iter()
        .filter(|f| f.kind == FailureKind::Cancelled)
        .map(|f| f.document_index)
        .collect();
    assert_eq!(cancelled, vec![2, 3, 4]);
    assert!(result.documents.iter().all(|d| d.status.is_terminal()));
    assert!(output.path().join(SUMMARY_FILE).exists());
}

#[tokio::test]
async fn test_cancel_before_start_dispatches_nothing() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_inputs(input.path(), 3);

    let loader = FakeLoader::new(Script::default());
    let script = Arc::clone(&loader.script);
    let cancel = CancelToken::new();
    cancel.cancel();

    let result = orchestrator(loader, vec![])
        .run(
            request(AppConfig::default(), input.path(), output.path(), "0", 1),
            &cancel,
        )
        .await
        .unwrap();

    assert!(result.cancelled);
    assert_eq!(script.calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.failures.len(), 3);
    assert!(result.accepted.is_empty());
}

#[tokio::test]
async fn test_failed_batch_is_retried() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_inputs(input.path(), 2);

    let loader = FakeLoader::new(Script {
        fail_first: AtomicUsize::new(1),
        ..Default::default()
    });
    let config = AppConfig::default().with_max_batch_retries(1);
    let result = orchestrator(loader, vec![])
        .run(
            request(config, input.path(), output.path(), "0", 2),
            &CancelToken::new(),
        )
        .await
        .unwrap();

    assert!(result.failures.is_empty());
    assert_eq!(result.stats.batches_failed, 1);
    assert_eq!(result.stats.batches_retried, 1);
    assert_eq!(result.stats.batches_dispatched, 2);
    assert_eq!(result.accepted.len(), 2);
}

#[tokio::test]
async fn test_failed_batch_without_retries_records_failures() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_inputs(input.path(), 3);

    let loader = FakeLoader::new(Script {
        fail_first: AtomicUsize::new(1),
        ..Default::default()
    });
    let result = orchestrator(loader, vec![])
        .run(
            request(AppConfig::default(), input.path(), output.path(), "0", 2),
            &CancelToken::new(),
        )
        .await
        .unwrap();

    let failed: Vec<usize> = result.failures.iter().map(|f| f.document_index).collect();
    assert_eq!(failed, vec![0, 1]);
    assert!(result.failures.iter().all(|f| f.kind == FailureKind::Generation));
    assert_eq!(result.accepted.len(), 1);
    assert_eq!(result.accepted[0].source.document_index, 2);
}

#[tokio::test]
async fn test_panicking_worker_fails_only_its_batch() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_inputs(input.path(), 3);

    let loader = FakeLoader::new(Script {
        panic_on_document: Some(1),
        ..Default::default()
    });
    let script = Arc::clone(&loader.script);
    let result = orchestrator(loader, vec![])
        .run(
            request(AppConfig::default(), input.path(), output.path(), "0", 1),
            &CancelToken::new(),
        )
        .await
        .unwrap();

    // The single device came back after the crash, so the last batch still ran.
    assert_eq!(script.calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.stats.batches_failed, 1);
    let accepted: Vec<usize> = result.accepted.iter().map(|p| p.source.document_index).collect();
    assert_eq!(accepted, vec![0, 2]);
    let failed: Vec<(usize, FailureKind)> = result
        .failures
        .iter()
        .map(|f| (f.document_index, f.kind.clone()))
        .collect();
    assert_eq!(failed, vec![(1, FailureKind::Generation)]);
    assert_eq!(result.documents[1].status, DocumentStatus::Failed);
}

#[tokio::test]
async fn test_reruns_are_deterministic() {
    let input = TempDir::new().unwrap();
    write_inputs(input.path(), 6);

    let mut runs = Vec::new();
    for _ in 0..2 {
        let output = TempDir::new().unwrap();
        let loader = FakeLoader::new(Script {
            delay: Duration::from_millis(10),
            ..Default::default()
        });
        let result = orchestrator(loader, vec![Some(0.9), Some(0.2), Some(0.8)])
            .run(
                request(AppConfig::default(), input.path(), output.path(), "0,1", 2),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        let accepted: Vec<(String, usize)> = result
            .accepted
            .iter()
            .map(|p| (p.question.clone(), p.source.document_index))
            .collect();
        runs.push(accepted);
    }

    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[0].len(), 5);
}

#[tokio::test]
async fn test_missing_input_dir_is_config_error() {
    let dir = TempDir::new().unwrap();
    let err = orchestrator(FakeLoader::new(Script::default()), vec![])
        .run(
            request(
                AppConfig::default(),
                &dir.path().join("missing"),
                &dir.path().join("out"),
                "0",
                2,
            ),
            &CancelToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Config(ConfigError::MissingInputDir(_))
    ));
    assert!(!err.is_resource_failure());
    assert!(!dir.path().join("out").exists());
}
