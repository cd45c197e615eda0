//! Persistence of run results as JSON documents.

pub mod results;

pub use results::{
    load_results, FailuresFile, QaRecord, ResultWriter, ResultsFile, RunSummary,
    WrittenArtifacts, FAILURES_FILE, REJECTED_FILE, RESULTS_FILE, SUMMARY_FILE,
};
