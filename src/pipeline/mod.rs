//! End-to-end QA generation pipeline.
//!
//! # Pipeline Flow
//!
//! 1. **Discovery**: input files are listed in a stable, sorted order
//! 2. **Filtering**: each document is cleaned and cut into segments
//! 3. **Pool loading**: one model handle per configured GPU device
//! 4. **Dispatch**: documents are grouped into batches and run on free handles
//! 5. **Scoring**: every generated pair is scored against its source segment
//! 6. **Persistence**: accepted pairs, failures and a run summary are written
//!
//! A failing document or batch never aborts the run; it shows up as a
//! [`FailureRecord`] in the [`PipelineResult`].
//!
//! # Example
//!
//! ```rust,ignore
//! use qa_forge::pipeline::{run_pipeline, AppConfig};
//!
//! let config = AppConfig::from_file("config.json")?;
//! let accepted = run_pipeline(config, "data/texts", "data/output", "qwq_32", 2, "0,1", 0.7).await?;
//! println!("{} pairs accepted", accepted.len());
//! ```

pub mod config;
pub mod discovery;
pub mod orchestrator;
pub mod types;

pub use config::{AppConfig, ApiConfig, GpuDevices, ModelsConfig, PathsConfig, ProcessingConfig};
pub use discovery::{discover_documents, read_document};
pub use orchestrator::{run_pipeline, PipelineOrchestrator, RunRequest};
pub use types::{
    Document, DocumentReport, DocumentStatus, FailureKind, FailureRecord, GenerationMeta,
    PipelineResult, QaPair, RunStats, SourceRef,
};
