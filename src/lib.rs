//! qa-forge: question/answer pair generation for semiconductor display text.
//!
//! This library cleans and segments domain documents, generates QA pairs on
//! a pool of per-GPU model servers, scores them and persists the accepted set.

// Core modules
pub mod cli;
pub mod error;
pub mod export;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod quality;
pub mod scheduler;
pub mod text;
pub mod utils;

// Re-export commonly used error types
pub use error::{
    ConfigError, DeviceLoadError, FilterError, GenerationError, LlmError, PersistError,
    PipelineError, ScoringError,
};
