//! Core data model of a pipeline run.
//!
//! - `Document`: a discovered input file moving through the stages
//! - `QaPair`: a generated question/answer unit with its score
//! - `FailureRecord`: why a document did not produce results
//! - `PipelineResult`: what a run hands back to its caller

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Stage of a document within a run.
///
/// Variants are ordered; a document only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Filtered,
    Batched,
    Processed,
    Failed,
}

impl DocumentStatus {
    /// Terminal statuses end a document's life in the run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Processed | DocumentStatus::Failed)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentStatus::Pending => write!(f, "pending"),
            DocumentStatus::Filtered => write!(f, "filtered"),
            DocumentStatus::Batched => write!(f, "batched"),
            DocumentStatus::Processed => write!(f, "processed"),
            DocumentStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Rejected status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub document: String,
    pub from: DocumentStatus,
    pub to: DocumentStatus,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "document '{}' cannot move from {} to {}",
            self.document, self.from, self.to
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// A text document discovered in the input directory.
#[derive(Debug, Clone)]
pub struct Document {
    /// Source file path; the document's identity.
    pub id: PathBuf,
    /// Position in discovery order.
    pub index: usize,
    pub raw_text: String,
    /// Hex SHA-256 of the raw text.
    pub content_sha256: String,
    /// Generation-ready segments, set once filtered.
    pub segments: Vec<String>,
    status: DocumentStatus,
}

impl Document {
    /// Creates a pending document.
    pub fn new(id: impl Into<PathBuf>, index: usize, raw_text: impl Into<String>) -> Self {
        let raw_text = raw_text.into();
        let content_sha256 = hex::encode(Sha256::digest(raw_text.as_bytes()));
        Self {
            id: id.into(),
            index,
            raw_text,
            content_sha256,
            segments: Vec::new(),
            status: DocumentStatus::Pending,
        }
    }

    pub fn status(&self) -> DocumentStatus {
        self.status
    }

    /// Display form of the document id.
    pub fn name(&self) -> String {
        self.id.display().to_string()
    }

    /// Moves the document forward to `to`.
    ///
    /// `Failed` is reachable from any non-terminal status; every other move
    /// must go to a strictly later stage.
    pub fn advance(&mut self, to: DocumentStatus) -> Result<(), InvalidTransition> {
        let allowed = !self.status.is_terminal()
            && (to == DocumentStatus::Failed || to > self.status);
        if !allowed {
            return Err(InvalidTransition {
                document: self.name(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Stores the filter output and marks the document filtered.
    pub fn set_segments(&mut self, segments: Vec<String>) -> Result<(), InvalidTransition> {
        self.advance(DocumentStatus::Filtered)?;
        self.segments = segments;
        Ok(())
    }
}

/// Where a QA pair came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub document: PathBuf,
    pub document_index: usize,
    pub segment_index: usize,
    /// Position of the pair among those generated for the segment.
    pub pair_index: usize,
}

impl SourceRef {
    /// Total order of pairs by discovery position.
    pub fn sort_key(&self) -> (usize, usize, usize) {
        (self.document_index, self.segment_index, self.pair_index)
    }
}

/// How a pair was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMeta {
    pub model: String,
    pub device: String,
    pub generated_at: DateTime<Utc>,
}

/// A generated question/answer unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
    pub source: SourceRef,
    pub metadata: GenerationMeta,
    score: Option<f64>,
    accepted: bool,
}

impl QaPair {
    /// Creates an unscored pair.
    pub fn new(
        question: impl Into<String>,
        answer: impl Into<String>,
        source: SourceRef,
        metadata: GenerationMeta,
    ) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            source,
            metadata,
            score: None,
            accepted: false,
        }
    }

    pub fn score(&self) -> Option<f64> {
        self.score
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    /// True once a score or a rejection has been recorded.
    pub fn is_decided(&self) -> bool {
        self.score.is_some()
    }

    /// Records the score and the acceptance decision.
    ///
    /// The pair is accepted iff `score >= threshold`. Only the first decision
    /// is kept; later calls return the existing flag unchanged.
    pub fn apply_score(&mut self, score: f64, threshold: f64) -> bool {
        if self.is_decided() {
            return self.accepted;
        }
        let score = score.clamp(0.0, 1.0);
        self.score = Some(score);
        self.accepted = score >= threshold;
        self.accepted
    }

    /// Records a scoring failure: the pair gets score 0 and is rejected.
    pub fn reject_unscorable(&mut self) {
        if !self.is_decided() {
            self.score = Some(0.0);
            self.accepted = false;
        }
    }
}

/// Why a document failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Read,
    Filter,
    Generation,
    Timeout,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Read => write!(f, "read"),
            FailureKind::Filter => write!(f, "filter"),
            FailureKind::Generation => write!(f, "generation"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A per-document failure attached to the run result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub document: PathBuf,
    pub document_index: usize,
    pub kind: FailureKind,
    pub message: String,
    /// Batch the document was in, if it got that far.
    pub batch_id: Option<usize>,
    pub device: Option<String>,
}

impl FailureRecord {
    pub fn new(document: &Document, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            document: document.id.clone(),
            document_index: document.index,
            kind,
            message: message.into(),
            batch_id: None,
            device: None,
        }
    }

    /// Attaches the batch and device the failure happened on.
    pub fn in_batch(mut self, batch_id: usize, device: Option<&str>) -> Self {
        self.batch_id = Some(batch_id);
        self.device = device.map(str::to_string);
        self
    }
}

/// Final state of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentReport {
    pub document: PathBuf,
    pub index: usize,
    pub content_sha256: String,
    pub status: DocumentStatus,
    pub segments: usize,
    pub accepted_pairs: usize,
}

/// Counters gathered over a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub documents_discovered: usize,
    pub documents_processed: usize,
    pub documents_failed: usize,
    pub batches_dispatched: usize,
    pub batches_failed: usize,
    pub batches_retried: usize,
    pub pairs_generated: usize,
    pub pairs_accepted: usize,
    pub pairs_rejected: usize,
    pub scoring_errors: usize,
    pub devices_ready: usize,
    pub devices_failed: usize,
    pub peak_busy_handles: usize,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

impl RunStats {
    /// Share of generated pairs that were accepted, in [0, 1].
    pub fn acceptance_rate(&self) -> f64 {
        if self.pairs_generated == 0 {
            return 0.0;
        }
        self.pairs_accepted as f64 / self.pairs_generated as f64
    }
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub model: String,
    pub quality_threshold: f64,
    /// Accepted pairs in document discovery order.
    pub accepted: Vec<QaPair>,
    /// Scored but rejected pairs, in discovery order.
    #[serde(skip)]
    pub rejected: Vec<QaPair>,
    pub failures: Vec<FailureRecord>,
    pub documents: Vec<DocumentReport>,
    pub stats: RunStats,
    pub cancelled: bool,
    pub finished_at: DateTime<Utc>,
}

impl PipelineResult {
    /// An empty result for a run with no input documents.
    pub fn empty(model: impl Into<String>, quality_threshold: f64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            model: model.into(),
            quality_threshold,
            accepted: Vec::new(),
            rejected: Vec::new(),
            failures: Vec::new(),
            documents: Vec::new(),
            stats: RunStats::default(),
            cancelled: false,
            finished_at: Utc::now(),
        }
    }

    /// True when every document finished processed.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failures.is_empty()
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
