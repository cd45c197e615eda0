//! Dispatch of batches onto leased model handles.
//!
//! Each batch waits for a free handle, then runs as its own task holding the
//! lease until generation finishes or times out. Failures stay with the
//! batch that caused them; the dispatcher never retries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{GenerationError, PipelineError};
use crate::metrics::MetricsCollector;
use crate::pipeline::types::{FailureKind, FailureRecord, QaPair};
use crate::pool::ModelPool;

use super::batch::Batch;
use super::cancel::CancelToken;

/// What happened to one batch.
#[derive(Debug)]
pub enum BatchOutcome {
    Completed {
        batch: Batch,
        pairs: Vec<QaPair>,
        duration: Duration,
    },
    Failed {
        batch: Batch,
        error: GenerationError,
        failures: Vec<FailureRecord>,
        duration: Duration,
    },
    /// Never dispatched because the run was cancelled.
    Cancelled {
        batch: Batch,
        failures: Vec<FailureRecord>,
    },
}

impl BatchOutcome {
    pub fn batch(&self) -> &Batch {
        match self {
            BatchOutcome::Completed { batch, .. }
            | BatchOutcome::Failed { batch, .. }
            | BatchOutcome::Cancelled { batch, .. } => batch,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, BatchOutcome::Completed { .. })
    }

    fn failed(batch: Batch, error: GenerationError, duration: Duration) -> Self {
        let kind = match error {
            GenerationError::Timeout(_) => FailureKind::Timeout,
            _ => FailureKind::Generation,
        };
        let failures = failure_records(&batch, kind, &error.to_string());
        BatchOutcome::Failed {
            batch,
            error,
            failures,
            duration,
        }
    }

    fn cancelled(batch: Batch) -> Self {
        let failures = failure_records(&batch, FailureKind::Cancelled, "run cancelled before dispatch");
        BatchOutcome::Cancelled { batch, failures }
    }
}

fn failure_records(batch: &Batch, kind: FailureKind, message: &str) -> Vec<FailureRecord> {
    batch
        .documents()
        .iter()
        .map(|doc| FailureRecord::new(doc, kind.clone(), message).in_batch(batch.id(), batch.device()))
        .collect()
}

/// Result of dispatching a sequence of batches.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// One outcome per batch, ordered by batch id.
    pub outcomes: Vec<BatchOutcome>,
    pub cancelled: bool,
}

impl DispatchReport {
    pub fn failed_batches(&self) -> impl Iterator<Item = &BatchOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, BatchOutcome::Failed { .. }))
    }
}

/// Dispatch counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub average_batch_duration: Duration,
}

struct SharedDispatchStats {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedDispatchStats {
    fn new() -> Self {
        Self {
            dispatched: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
        }
    }

    fn record_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
    }

    fn record_completion(&self, duration: Duration) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration, timed_out: bool) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        if timed_out {
            self.timed_out.fetch_add(1, Ordering::SeqCst);
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }

    fn to_stats(&self) -> DispatchStats {
        let completed = self.completed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let total_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let finished = completed + failed;

        DispatchStats {
            dispatched: self.dispatched.load(Ordering::SeqCst),
            completed,
            failed,
            timed_out: self.timed_out.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            average_batch_duration: if finished > 0 {
                Duration::from_millis(total_ms / finished)
            } else {
                Duration::ZERO
            },
        }
    }
}

/// Runs batches on the pool, at most one per ready handle at a time.
pub struct BatchScheduler {
    pool: Arc<ModelPool>,
    batch_timeout: Duration,
    stats: Arc<SharedDispatchStats>,
    metrics: MetricsCollector,
}

impl BatchScheduler {
    pub fn new(pool: Arc<ModelPool>, batch_timeout: Duration) -> Self {
        Self {
            pool,
            batch_timeout,
            stats: Arc::new(SharedDispatchStats::new()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats.to_stats()
    }

    /// Dispatches every batch and waits for all of them to finish.
    ///
    /// On cancellation no further batch is dispatched. Batches already
    /// running finish (bounded by the batch timeout) and the remaining ones
    /// come back as [`BatchOutcome::Cancelled`].
    pub async fn dispatch<I>(&self, batches: I, cancel: &CancelToken) -> Result<DispatchReport, PipelineError>
    where
        I: IntoIterator<Item = Batch>,
    {
        let mut batches = batches.into_iter();
        let mut in_flight: JoinSet<Result<Vec<QaPair>, GenerationError>> = JoinSet::new();
        let mut manifests: HashMap<tokio::task::Id, (Batch, Instant)> = HashMap::new();
        let mut report = DispatchReport::default();

        while let Some(mut batch) = batches.next() {
            let lease = if cancel.is_cancelled() {
                None
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    lease = self.pool.acquire() => Some(
                        lease.map_err(|e| PipelineError::Internal(format!("failed to lease handle: {}", e)))?,
                    ),
                }
            };

            let Some(lease) = lease else {
                report.cancelled = true;
                let remaining: Vec<Batch> = std::iter::once(batch).chain(batches.by_ref()).collect();
                info!(
                    undispatched = remaining.len(),
                    in_flight = in_flight.len(),
                    "Cancellation requested, dispatch stopped"
                );
                for batch in remaining {
                    self.stats.record_cancelled();
                    self.metrics.record_cancelled_batch();
                    report.outcomes.push(BatchOutcome::cancelled(batch));
                }
                break;
            };

            batch.assign_device(lease.device());
            info!(
                batch_id = batch.id(),
                device = %lease.device(),
                documents = batch.len(),
                segments = batch.segment_count(),
                "Dispatching batch"
            );
            self.stats.record_dispatch();

            let task_batch = batch.clone();
            let timeout = self.batch_timeout;
            let abort = in_flight.spawn(async move {
                let result =
                    match tokio::time::timeout(timeout, lease.handle().generate(&task_batch)).await {
                        Ok(result) => result,
                        Err(_) => Err(GenerationError::Timeout(timeout)),
                    };
                drop(lease);
                result
            });
            manifests.insert(abort.id(), (batch, Instant::now()));
        }

        while let Some(joined) = in_flight.join_next_with_id().await {
            let (id, result) = match joined {
                Ok((id, result)) => (id, result),
                Err(e) => {
                    error!(error = %e, "Batch worker aborted");
                    (e.id(), Err(GenerationError::WorkerAborted(e.to_string())))
                }
            };
            let Some((batch, started)) = manifests.remove(&id) else {
                warn!("Finished task has no batch manifest");
                continue;
            };
            report.outcomes.push(self.settle(batch, result, started.elapsed()));
        }

        report.outcomes.sort_by_key(|o| o.batch().id());
        Ok(report)
    }

    fn settle(
        &self,
        mut batch: Batch,
        result: Result<Vec<QaPair>, GenerationError>,
        duration: Duration,
    ) -> BatchOutcome {
        let device = batch.device().unwrap_or("-").to_string();
        match result {
            Ok(pairs) => {
                batch.mark_completed();
                self.stats.record_completion(duration);
                self.metrics.record_batch("completed", duration.as_secs_f64());
                debug!(
                    batch_id = batch.id(),
                    device = %device,
                    pairs = pairs.len(),
                    duration_ms = duration.as_millis() as u64,
                    "Batch completed"
                );
                BatchOutcome::Completed {
                    batch,
                    pairs,
                    duration,
                }
            }
            Err(e) => {
                let timed_out = matches!(e, GenerationError::Timeout(_));
                self.stats.record_failure(duration, timed_out);
                self.metrics.record_batch(
                    if timed_out { "timeout" } else { "failed" },
                    duration.as_secs_f64(),
                );
                warn!(
                    batch_id = batch.id(),
                    device = %device,
                    error = %e,
                    "Batch failed"
                );
                BatchOutcome::failed(batch, e, duration)
            }
        }
    }
}
