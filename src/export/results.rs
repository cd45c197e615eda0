//! Run artifacts written to the output directory.
//!
//! - `qa_results.json`: accepted pairs in discovery order
//! - `failures.json`: per-document failure records
//! - `rejected_qa.jsonl`: scored-but-rejected pairs, one per line (optional)
//! - `run_summary.json`: statistics and per-document status

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::PersistError;
use crate::pipeline::types::{
    DocumentReport, FailureRecord, GenerationMeta, PipelineResult, QaPair, RunStats,
};

pub const RESULTS_FILE: &str = "qa_results.json";
pub const FAILURES_FILE: &str = "failures.json";
pub const REJECTED_FILE: &str = "rejected_qa.jsonl";
pub const SUMMARY_FILE: &str = "run_summary.json";

/// Flat, persisted view of a QA pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaRecord {
    pub question: String,
    pub answer: String,
    /// Source document path.
    pub source: PathBuf,
    pub document_index: usize,
    pub segment_index: usize,
    pub pair_index: usize,
    pub score: Option<f64>,
    pub accepted: bool,
    pub metadata: GenerationMeta,
}

impl From<&QaPair> for QaRecord {
    fn from(pair: &QaPair) -> Self {
        Self {
            question: pair.question.clone(),
            answer: pair.answer.clone(),
            source: pair.source.document.clone(),
            document_index: pair.source.document_index,
            segment_index: pair.source.segment_index,
            pair_index: pair.source.pair_index,
            score: pair.score(),
            accepted: pair.is_accepted(),
            metadata: pair.metadata.clone(),
        }
    }
}

/// Contents of `qa_results.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsFile {
    pub run_id: Uuid,
    pub model: String,
    pub quality_threshold: f64,
    pub cancelled: bool,
    pub finished_at: DateTime<Utc>,
    pub count: usize,
    pub pairs: Vec<QaRecord>,
}

/// Contents of `failures.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailuresFile {
    pub run_id: Uuid,
    pub count: usize,
    pub failures: Vec<FailureRecord>,
}

/// Contents of `run_summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub model: String,
    pub quality_threshold: f64,
    pub cancelled: bool,
    pub finished_at: DateTime<Utc>,
    pub acceptance_rate: f64,
    pub stats: RunStats,
    pub documents: Vec<DocumentReport>,
}

/// Paths of the artifacts a write produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WrittenArtifacts {
    pub results: PathBuf,
    pub failures: PathBuf,
    pub summary: PathBuf,
    pub rejected: Option<PathBuf>,
}

/// Writes run artifacts into one output directory.
#[derive(Debug, Clone)]
pub struct ResultWriter {
    output_dir: PathBuf,
    keep_rejected: bool,
}

impl ResultWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            keep_rejected: false,
        }
    }

    /// Also writes the rejection log.
    pub fn with_rejected_log(mut self, keep: bool) -> Self {
        self.keep_rejected = keep;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    async fn ensure_directory(&self) -> Result<(), PersistError> {
        fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| PersistError::CreateDir {
                path: self.output_dir.display().to_string(),
                source,
            })
    }

    /// Writes every artifact for `result`.
    pub async fn write(&self, result: &PipelineResult) -> Result<WrittenArtifacts, PersistError> {
        self.ensure_directory().await?;

        let results = ResultsFile {
            run_id: result.run_id,
            model: result.model.clone(),
            quality_threshold: result.quality_threshold,
            cancelled: result.cancelled,
            finished_at: result.finished_at,
            count: result.accepted.len(),
            pairs: result.accepted.iter().map(QaRecord::from).collect(),
        };
        let failures = FailuresFile {
            run_id: result.run_id,
            count: result.failures.len(),
            failures: result.failures.clone(),
        };
        let summary = RunSummary {
            run_id: result.run_id,
            model: result.model.clone(),
            quality_threshold: result.quality_threshold,
            cancelled: result.cancelled,
            finished_at: result.finished_at,
            acceptance_rate: result.stats.acceptance_rate(),
            stats: result.stats.clone(),
            documents: result.documents.clone(),
        };

        let mut written = WrittenArtifacts {
            results: self.write_json(RESULTS_FILE, &results).await?,
            failures: self.write_json(FAILURES_FILE, &failures).await?,
            summary: self.write_json(SUMMARY_FILE, &summary).await?,
            rejected: None,
        };

        if self.keep_rejected {
            let mut lines = String::new();
            for pair in &result.rejected {
                lines.push_str(&serde_json::to_string(&QaRecord::from(pair))?);
                lines.push('\n');
            }
            written.rejected = Some(self.write_bytes(REJECTED_FILE, lines.as_bytes()).await?);
        } else {
            // A log left by an earlier run would not match this run's results.
            match fs::remove_file(self.output_dir.join(REJECTED_FILE)).await {
                Ok(()) => tracing::debug!("Removed stale rejection log"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        tracing::info!(
            output_dir = %self.output_dir.display(),
            accepted = results.count,
            failures = failures.count,
            "Results written"
        );
        Ok(written)
    }

    async fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf, PersistError> {
        let json = serde_json::to_string_pretty(value)?;
        self.write_bytes(name, json.as_bytes()).await
    }

    async fn write_bytes(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, PersistError> {
        let path = self.output_dir.join(name);
        let mut file = fs::File::create(&path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(path)
    }
}

/// Reads a `qa_results.json` back.
pub async fn load_results(path: impl AsRef<Path>) -> Result<ResultsFile, PersistError> {
    let contents = fs::read_to_string(path.as_ref()).await?;
    Ok(serde_json::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Document, FailureKind, SourceRef};
    use tempfile::TempDir;

    fn pair(doc: usize, score: f64, threshold: f64) -> QaPair {
        let mut pair = QaPair::new(
            format!("Question {}?", doc),
            "Answer.",
            SourceRef {
                document: PathBuf::from(format!("doc_{}.txt", doc)),
                document_index: doc,
                segment_index: 0,
                pair_index: 0,
            },
            GenerationMeta {
                model: "qwq_32".to_string(),
                device: "0".to_string(),
                generated_at: Utc::now(),
            },
        );
        pair.apply_score(score, threshold);
        pair
    }

    fn result() -> PipelineResult {
        let mut result = PipelineResult::empty("qwq_32", 0.7);
        result.accepted = vec![pair(0, 0.9, 0.7), pair(2, 0.71, 0.7)];
        result.rejected = vec![pair(1, 0.5, 0.7)];
        let doc = Document::new("empty.txt", 3, "");
        result.failures = vec![FailureRecord::new(&doc, FailureKind::Filter, "empty")];
        result.stats.pairs_generated = 3;
        result.stats.pairs_accepted = 2;
        result
    }

    #[tokio::test]
    async fn test_write_all_artifacts() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("nested").join("out");
        let writer = ResultWriter::new(&out).with_rejected_log(true);

        let written = writer.write(&result()).await.unwrap();
        assert!(written.results.exists());
        assert!(written.failures.exists());
        assert!(written.summary.exists());

        let loaded = load_results(&written.results).await.unwrap();
        assert_eq!(loaded.count, 2);
        assert_eq!(loaded.pairs[0].source, PathBuf::from("doc_0.txt"));
        assert_eq!(loaded.pairs[1].score, Some(0.71));
        assert!(loaded.pairs.iter().all(|p| p.accepted));

        let rejected = std::fs::read_to_string(written.rejected.unwrap()).unwrap();
        assert_eq!(rejected.lines().count(), 1);
        let record: QaRecord = serde_json::from_str(rejected.lines().next().unwrap()).unwrap();
        assert!(!record.accepted);

        let summary: RunSummary =
            serde_json::from_str(&std::fs::read_to_string(&written.summary).unwrap()).unwrap();
        assert!((summary.acceptance_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rejected_log_is_optional() {
        let dir = TempDir::new().unwrap();
        let writer = ResultWriter::new(dir.path());

        let written = writer.write(&result()).await.unwrap();
        assert!(written.rejected.is_none());
        assert!(!dir.path().join(REJECTED_FILE).exists());
    }

    #[tokio::test]
    async fn test_rewrite_without_log_removes_previous_log() {
        let dir = TempDir::new().unwrap();

        ResultWriter::new(dir.path())
            .with_rejected_log(true)
            .write(&result())
            .await
            .unwrap();
        assert!(dir.path().join(REJECTED_FILE).exists());

        let mut second = PipelineResult::empty("qwq_32", 0.7);
        second.accepted = vec![pair(0, 0.9, 0.7)];
        let written = ResultWriter::new(dir.path()).write(&second).await.unwrap();

        assert!(written.rejected.is_none());
        assert!(!dir.path().join(REJECTED_FILE).exists());
        let loaded = load_results(&written.results).await.unwrap();
        assert_eq!(loaded.run_id, second.run_id);
    }

    #[tokio::test]
    async fn test_unwritable_output_dir() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "not a directory").unwrap();

        let writer = ResultWriter::new(blocker.join("out"));
        let err = writer.write(&result()).await.unwrap_err();
        assert!(matches!(err, PersistError::CreateDir { .. }));
    }
}
