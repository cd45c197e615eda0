//! Error types for qa-forge operations.
//!
//! Per-unit errors (`FilterError`, `GenerationError`, `ScoringError`) are
//! captured and attached to the run result as failure records. Only
//! `PipelineError` is ever surfaced to the caller of a run:
//! - Configuration problems (`ConfigError`)
//! - Resource problems (every GPU device failed to load)
//! - Result persistence failures

use std::time::Duration;

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {message}")]
    Parse { path: String, message: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Input directory does not exist: {0}")]
    MissingInputDir(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// A GPU device / model combination failed to initialize.
#[derive(Debug, Clone, Error)]
pub enum DeviceLoadError {
    #[error("Device {device}: model server unreachable: {reason}")]
    Unreachable { device: String, reason: String },

    #[error("Device {device}: model '{model}' is not served (available: {available})")]
    ModelNotServed {
        device: String,
        model: String,
        available: String,
    },

    #[error("Device {device}: load failed: {reason}")]
    LoadFailed { device: String, reason: String },
}

impl DeviceLoadError {
    /// Returns the device identifier this error belongs to.
    pub fn device(&self) -> &str {
        match self {
            DeviceLoadError::Unreachable { device, .. }
            | DeviceLoadError::ModelNotServed { device, .. }
            | DeviceLoadError::LoadFailed { device, .. } => device,
        }
    }
}

/// A document could not be cleaned or segmented.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("Document is empty after cleaning")]
    Empty,

    #[error("Document is unreadable: {0}")]
    Unreadable(String),
}

/// A batch inference call failed.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Inference request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse model output: {0}")]
    ParseError(String),

    #[error("Model handle on device {0} is not ready")]
    HandleNotReady(String),

    #[error("Worker aborted: {0}")]
    WorkerAborted(String),
}

/// Errors talking to an OpenAI-compatible model server.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Response contained no choices")]
    EmptyResponse,
}

impl From<LlmError> for GenerationError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::ParseError(msg) => GenerationError::ParseError(msg),
            other => GenerationError::RequestFailed(other.to_string()),
        }
    }
}

/// The scorer could not evaluate a pair. Always an automatic rejection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScoringError {
    #[error("Question is empty")]
    EmptyQuestion,

    #[error("Answer is empty")]
    EmptyAnswer,

    #[error("Scoring criteria weights sum to zero")]
    ZeroWeights,
}

/// Errors while writing run artifacts to the output directory.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Failed to create output directory '{path}': {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fatal errors that terminate a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("No GPU devices configured")]
    NoDevices,

    #[error("All {} configured devices failed to load", .0.len())]
    AllDevicesFailed(Vec<DeviceLoadError>),

    #[error("Failed to persist results: {0}")]
    Persist(#[from] PersistError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// True for failures caused by compute resources rather than configuration.
    pub fn is_resource_failure(&self) -> bool {
        matches!(
            self,
            PipelineError::NoDevices | PipelineError::AllDevicesFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_error_classification() {
        let err = PipelineError::AllDevicesFailed(vec![DeviceLoadError::LoadFailed {
            device: "0".to_string(),
            reason: "oom".to_string(),
        }]);
        assert!(err.is_resource_failure());
        assert!(err.to_string().contains("All 1 configured devices"));

        let err = PipelineError::Config(ConfigError::MissingInputDir("data/texts".to_string()));
        assert!(!err.is_resource_failure());
        assert!(err.to_string().contains("data/texts"));
    }

    #[test]
    fn test_device_load_error_device() {
        let err = DeviceLoadError::Unreachable {
            device: "1".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(err.device(), "1");
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_generation_timeout_display() {
        let err = GenerationError::Timeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30s"));
    }
}
