//! Pipeline orchestrator.
//!
//! Drives one run end to end: discover, read and filter documents, load the
//! model pool, dispatch batches, score every generated pair, persist the
//! artifacts and hand back the aggregate result.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, PipelineError};
use crate::export::ResultWriter;
use crate::llm::LocalServerLoader;
use crate::metrics::MetricsCollector;
use crate::pool::{ModelLoader, ModelPool};
use crate::quality::{HeuristicScorer, QualityScorer};
use crate::scheduler::{schedule, Batch, BatchOutcome, BatchScheduler, CancelToken};
use crate::text::{FilterConfig, NoiseFilter, TextFilter};

use super::config::{validate_threshold, AppConfig, GpuDevices};
use super::discovery::{discover_documents, read_document};
use super::types::{
    Document, DocumentReport, DocumentStatus, FailureKind, FailureRecord, PipelineResult, QaPair,
    RunStats,
};

/// Parameters of one pipeline run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub config: AppConfig,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub model_name: String,
    pub batch_size: usize,
    pub gpu_devices: GpuDevices,
    pub quality_threshold: f64,
}

impl RunRequest {
    /// Takes every run parameter from the configuration.
    pub fn from_config(config: AppConfig) -> Result<Self, ConfigError> {
        let gpu_devices = GpuDevices::parse(&config.processing.gpu_devices)?;
        Ok(Self {
            input_dir: config.paths.input_dir.clone(),
            output_dir: config.paths.output_dir.clone(),
            model_name: config.models.default_model.clone(),
            batch_size: config.processing.batch_size,
            quality_threshold: config.processing.quality_threshold,
            gpu_devices,
            config,
        })
    }

    pub fn with_input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.input_dir = dir.into();
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_model(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_gpu_devices(mut self, devices: GpuDevices) -> Self {
        self.gpu_devices = devices;
        self
    }

    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = threshold;
        self
    }

    /// Checks run parameters before any work starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "batch_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        validate_threshold(self.quality_threshold)?;
        if self.model_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "model_name".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if !self.input_dir.is_dir() {
            return Err(ConfigError::MissingInputDir(
                self.input_dir.display().to_string(),
            ));
        }
        Ok(())
    }
}

/// Mutable bookkeeping for one run.
struct RunState {
    /// Every discovered document, indexed by discovery position.
    ledger: Vec<Document>,
    accepted: Vec<QaPair>,
    rejected: Vec<QaPair>,
    failures: Vec<FailureRecord>,
    stats: RunStats,
    cancelled: bool,
}

impl RunState {
    fn fail(&mut self, record: FailureRecord) -> Result<(), PipelineError> {
        let index = record.document_index;
        let doc = self.document_mut(index)?;
        doc.advance(DocumentStatus::Failed)
            .map_err(|e| PipelineError::Internal(e.to_string()))?;
        debug!(
            document = %doc.name(),
            kind = %record.kind,
            message = %record.message,
            "Document failed"
        );
        self.failures.push(record);
        Ok(())
    }

    fn processed(&mut self, index: usize) -> Result<(), PipelineError> {
        let doc = self.document_mut(index)?;
        if doc.status() < DocumentStatus::Batched {
            doc.advance(DocumentStatus::Batched)
                .map_err(|e| PipelineError::Internal(e.to_string()))?;
        }
        doc.advance(DocumentStatus::Processed)
            .map_err(|e| PipelineError::Internal(e.to_string()))
    }

    fn document_mut(&mut self, index: usize) -> Result<&mut Document, PipelineError> {
        self.ledger
            .get_mut(index)
            .ok_or_else(|| PipelineError::Internal(format!("no document at index {}", index)))
    }
}

/// Coordinates filter, pool, scheduler and scorer for a run.
pub struct PipelineOrchestrator {
    filter: Arc<dyn TextFilter>,
    scorer: Arc<dyn QualityScorer>,
    loader: Arc<dyn ModelLoader>,
    metrics: MetricsCollector,
}

impl PipelineOrchestrator {
    /// Creates an orchestrator from its capability implementations.
    pub fn new(
        filter: Arc<dyn TextFilter>,
        scorer: Arc<dyn QualityScorer>,
        loader: Arc<dyn ModelLoader>,
    ) -> Self {
        Self {
            filter,
            scorer,
            loader,
            metrics: MetricsCollector::new(),
        }
    }

    /// Builds the default stack: noise filter, heuristic scorer and local
    /// model servers, all configured from `config`.
    pub fn from_config(config: &AppConfig) -> Self {
        let filter = NoiseFilter::new(FilterConfig::new(
            config.processing.max_segment_chars,
            config.processing.min_segment_chars,
        ));
        let scorer = HeuristicScorer::new(config.processing.scoring.clone());
        let loader = LocalServerLoader::from_config(config);
        Self::new(Arc::new(filter), Arc::new(scorer), Arc::new(loader))
    }

    /// Runs the pipeline.
    ///
    /// Per-document problems end up as failure records in the result. Only
    /// configuration errors, a pool with no loadable device and persistence
    /// failures abort the run; the first two leave no artifacts behind.
    pub async fn run(
        &self,
        request: RunRequest,
        cancel: &CancelToken,
    ) -> Result<PipelineResult, PipelineError> {
        let started = Instant::now();
        request.validate()?;

        let mut result = PipelineResult::empty(&request.model_name, request.quality_threshold);
        info!(
            run_id = %result.run_id,
            input_dir = %request.input_dir.display(),
            model = %request.model_name,
            batch_size = request.batch_size,
            devices = %request.gpu_devices,
            threshold = request.quality_threshold,
            "Starting pipeline run"
        );

        let paths = discover_documents(&request.input_dir, &request.config.processing.file_extensions)?;
        let mut state = RunState {
            ledger: Vec::with_capacity(paths.len()),
            accepted: Vec::new(),
            rejected: Vec::new(),
            failures: Vec::new(),
            stats: RunStats {
                documents_discovered: paths.len(),
                ..Default::default()
            },
            cancelled: false,
        };

        self.read_and_filter(&paths, &mut state).await?;

        let filtered: Vec<Document> = state
            .ledger
            .iter()
            .filter(|d| d.status() == DocumentStatus::Filtered)
            .cloned()
            .collect();

        if filtered.is_empty() {
            info!("No documents to generate from");
        } else {
            self.generate(&request, filtered, cancel, &mut state).await?;
        }

        self.finish(&mut state);
        state.stats.duration = started.elapsed();

        result.accepted = std::mem::take(&mut state.accepted);
        result.rejected = std::mem::take(&mut state.rejected);
        result.failures = std::mem::take(&mut state.failures);
        result.cancelled = state.cancelled;
        result.documents = state
            .ledger
            .iter()
            .map(|doc| DocumentReport {
                document: doc.id.clone(),
                index: doc.index,
                content_sha256: doc.content_sha256.clone(),
                status: doc.status(),
                segments: doc.segments.len(),
                accepted_pairs: result
                    .accepted
                    .iter()
                    .filter(|p| p.source.document_index == doc.index)
                    .count(),
            })
            .collect();
        result.stats = state.stats;
        result.finished_at = Utc::now();

        ResultWriter::new(&request.output_dir)
            .with_rejected_log(request.config.processing.keep_rejected)
            .write(&result)
            .await?;

        let stats = &result.stats;
        info!(
            run_id = %result.run_id,
            documents = stats.documents_discovered,
            processed = stats.documents_processed,
            failed = stats.documents_failed,
            batches = stats.batches_dispatched,
            generated = stats.pairs_generated,
            accepted = stats.pairs_accepted,
            acceptance_rate = format!("{:.1}%", stats.acceptance_rate() * 100.0),
            cancelled = result.cancelled,
            duration_secs = stats.duration.as_secs_f64(),
            "Pipeline run finished"
        );
        Ok(result)
    }

    async fn read_and_filter(&self, paths: &[PathBuf], state: &mut RunState) -> Result<(), PipelineError> {
        for (index, path) in paths.iter().enumerate() {
            let mut doc = match read_document(path, index).await {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(document = %path.display(), error = %e, "Failed to read document");
                    let placeholder = Document::new(path, index, "");
                    let record = FailureRecord::new(&placeholder, FailureKind::Read, e.to_string());
                    state.ledger.push(placeholder);
                    state.fail(record)?;
                    continue;
                }
            };

            match self.filter.filter(&doc) {
                Ok(segments) => {
                    debug!(document = %doc.name(), segments = segments.len(), "Document filtered");
                    doc.set_segments(segments)
                        .map_err(|e| PipelineError::Internal(e.to_string()))?;
                    state.ledger.push(doc);
                }
                Err(e) => {
                    warn!(document = %doc.name(), error = %e, "Document rejected by filter");
                    let record = FailureRecord::new(&doc, FailureKind::Filter, e.to_string());
                    state.ledger.push(doc);
                    state.fail(record)?;
                }
            }
        }
        Ok(())
    }

    async fn generate(
        &self,
        request: &RunRequest,
        filtered: Vec<Document>,
        cancel: &CancelToken,
        state: &mut RunState,
    ) -> Result<(), PipelineError> {
        let mut pool = ModelPool::new(Arc::clone(&self.loader));
        let report = pool.load_all(&request.model_name, &request.gpu_devices).await?;
        state.stats.devices_ready = report.ready.len();
        state.stats.devices_failed = report.failed.len();
        let pool = Arc::new(pool);

        let outcome = self.dispatch_rounds(request, filtered, &pool, cancel, state).await;

        pool.unload_all().await;
        state.stats.peak_busy_handles = pool.peak_busy();
        outcome
    }

    async fn dispatch_rounds(
        &self,
        request: &RunRequest,
        mut pending: Vec<Document>,
        pool: &Arc<ModelPool>,
        cancel: &CancelToken,
        state: &mut RunState,
    ) -> Result<(), PipelineError> {
        let scheduler = BatchScheduler::new(Arc::clone(pool), request.config.batch_timeout());
        let max_retries = request.config.processing.max_batch_retries;
        let mut next_batch_id = 0;
        let mut round = 0u32;

        while !pending.is_empty() {
            let batches = schedule(pending, request.batch_size).with_first_id(next_batch_id);
            next_batch_id += batches.len();

            let report = scheduler.dispatch(batches, cancel).await?;
            state.cancelled |= report.cancelled;

            let mut retry = Vec::new();
            for outcome in report.outcomes {
                match outcome {
                    BatchOutcome::Completed { batch, pairs, .. } => {
                        self.accept_batch(&batch, pairs, request.quality_threshold, state)?;
                    }
                    BatchOutcome::Failed { batch, failures, .. } => {
                        state.stats.batches_failed += 1;
                        if round < max_retries && !cancel.is_cancelled() {
                            state.stats.batches_retried += 1;
                            info!(
                                batch_id = batch.id(),
                                round = round + 1,
                                "Re-batching documents of failed batch"
                            );
                            retry.extend(batch.into_documents());
                        } else {
                            for record in failures {
                                state.fail(record)?;
                            }
                        }
                    }
                    BatchOutcome::Cancelled { failures, .. } => {
                        for record in failures {
                            state.fail(record)?;
                        }
                    }
                }
            }

            if !retry.is_empty() && cancel.is_cancelled() {
                state.cancelled = true;
                for doc in &retry {
                    state.fail(FailureRecord::new(
                        doc,
                        FailureKind::Cancelled,
                        "run cancelled before retry",
                    ))?;
                }
                retry.clear();
            }

            pending = retry;
            round += 1;
        }

        state.stats.batches_dispatched = scheduler.stats().dispatched as usize;
        Ok(())
    }

    /// Scores the pairs of a completed batch and marks its documents processed.
    fn accept_batch(
        &self,
        batch: &Batch,
        pairs: Vec<QaPair>,
        threshold: f64,
        state: &mut RunState,
    ) -> Result<(), PipelineError> {
        for mut pair in pairs {
            state.stats.pairs_generated += 1;
            let segment = batch
                .segment(pair.source.document_index, pair.source.segment_index)
                .unwrap_or_default();

            match self.scorer.score(&pair, segment) {
                Ok(score) => {
                    let accepted = pair.apply_score(score, threshold);
                    self.metrics.record_quality(score, accepted);
                }
                Err(e) => {
                    debug!(
                        document = %pair.source.document.display(),
                        error = %e,
                        "Pair could not be scored, rejecting"
                    );
                    state.stats.scoring_errors += 1;
                    pair.reject_unscorable();
                    self.metrics.record_quality(0.0, false);
                }
            }

            if pair.is_accepted() {
                state.stats.pairs_accepted += 1;
                state.accepted.push(pair);
            } else {
                state.stats.pairs_rejected += 1;
                state.rejected.push(pair);
            }
        }

        for doc in batch.documents() {
            state.processed(doc.index)?;
        }
        Ok(())
    }

    /// Orders results and closes out any document still open.
    fn finish(&self, state: &mut RunState) {
        let open: Vec<FailureRecord> = state
            .ledger
            .iter()
            .filter(|d| !d.status().is_terminal())
            .map(|d| FailureRecord::new(d, FailureKind::Generation, "document was never completed"))
            .collect();
        for record in open {
            warn!(document = %record.document.display(), "Closing out unfinished document");
            if let Err(e) = state.fail(record) {
                warn!(error = %e, "Failed to close out document");
            }
        }

        state.accepted.sort_by_key(|p| p.source.sort_key());
        state.rejected.sort_by_key(|p| p.source.sort_key());
        state.failures.sort_by_key(|f| f.document_index);

        let mut by_status: HashMap<DocumentStatus, usize> = HashMap::new();
        for doc in &state.ledger {
            *by_status.entry(doc.status()).or_default() += 1;
            self.metrics.record_document(&doc.status().to_string());
        }
        state.stats.documents_processed = by_status.get(&DocumentStatus::Processed).copied().unwrap_or(0);
        state.stats.documents_failed = by_status.get(&DocumentStatus::Failed).copied().unwrap_or(0);
    }
}

/// Runs the pipeline with the default stack and returns the accepted pairs
/// in document discovery order.
///
/// `gpu_devices` is a comma-separated list such as `"0,1"`.
pub async fn run_pipeline(
    config: AppConfig,
    input_dir: impl Into<PathBuf>,
    output_dir: impl Into<PathBuf>,
    model_name: &str,
    batch_size: usize,
    gpu_devices: &str,
    quality_threshold: f64,
) -> Result<Vec<QaPair>, PipelineError> {
    let orchestrator = PipelineOrchestrator::from_config(&config);
    let request = RunRequest::from_config(config)?
        .with_input_dir(input_dir)
        .with_output_dir(output_dir)
        .with_model(model_name)
        .with_batch_size(batch_size)
        .with_gpu_devices(GpuDevices::parse(gpu_devices)?)
        .with_quality_threshold(quality_threshold);

    let result = orchestrator.run(request, &CancelToken::new()).await?;
    Ok(result.accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(dir: &TempDir) -> RunRequest {
        RunRequest::from_config(AppConfig::default())
            .unwrap()
            .with_input_dir(dir.path())
            .with_output_dir(dir.path().join("out"))
    }

    #[test]
    fn test_request_defaults_from_config() {
        let config = AppConfig::default().with_batch_size(4).with_gpu_devices("0,1");
        let request = RunRequest::from_config(config).unwrap();
        assert_eq!(request.batch_size, 4);
        assert_eq!(request.gpu_devices.len(), 2);
        assert_eq!(request.model_name, "qwq_32");
    }

    #[test]
    fn test_request_validation() {
        let dir = TempDir::new().unwrap();
        assert!(request(&dir).validate().is_ok());

        let err = request(&dir).with_batch_size(0).validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "batch_size"));

        let err = request(&dir).with_quality_threshold(1.5).validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = request(&dir)
            .with_input_dir(dir.path().join("missing"))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingInputDir(_)));
    }

    #[tokio::test]
    async fn test_empty_input_yields_empty_result() {
        let dir = TempDir::new().unwrap();
        let orchestrator = PipelineOrchestrator::from_config(&AppConfig::default());

        // No documents means no device is ever contacted.
        let result = orchestrator
            .run(request(&dir), &CancelToken::new())
            .await
            .unwrap();
        assert!(result.accepted.is_empty());
        assert!(result.failures.is_empty());
        assert!(result.is_complete());
        assert!(dir.path().join("out").join("qa_results.json").exists());
    }
}
