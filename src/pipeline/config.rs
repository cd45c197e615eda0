//! Pipeline configuration.
//!
//! Configuration is a structured document (`config.json`, or YAML) with four
//! sections: `api`, `models`, `paths` and `processing`. A missing section is
//! reported and replaced by defaults; a malformed document is fatal.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::quality::ScoringCriteria;

/// Sections every configuration document is expected to carry.
pub const REQUIRED_SECTIONS: [&str; 4] = ["api", "models", "paths", "processing"];

/// Settings for the local inference servers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    /// Host of the OpenAI-compatible servers, without port.
    pub base_url: String,
    /// Port of the server bound to the first device; device `i` uses `base_port + i`.
    pub base_port: u16,
    /// Optional bearer token sent to the servers.
    pub api_key: Option<String>,
    /// HTTP timeout for a single request.
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1".to_string(),
            base_port: 8000,
            api_key: None,
            request_timeout_secs: 300,
        }
    }
}

impl ApiConfig {
    /// Endpoint of the server bound to the device at `position`.
    pub fn endpoint_for(&self, position: usize) -> String {
        let port = u32::from(self.base_port) + position as u32;
        format!("{}:{}/v1", self.base_url.trim_end_matches('/'), port)
    }
}

/// Model selection and sampling settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelsConfig {
    /// Short model name used when none is given on the command line.
    pub default_model: String,
    /// Maps short model names to the ids the servers expose.
    pub registry: BTreeMap<String, String>,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Number of QA pairs requested per text segment.
    pub pairs_per_segment: usize,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        let mut registry = BTreeMap::new();
        registry.insert("qwq_32".to_string(), "Qwen/QwQ-32B".to_string());
        registry.insert("qwen2_7b".to_string(), "Qwen/Qwen2-7B-Instruct".to_string());

        Self {
            default_model: "qwq_32".to_string(),
            registry,
            temperature: 0.7,
            max_tokens: 2048,
            pairs_per_segment: 3,
        }
    }
}

impl ModelsConfig {
    /// Resolves a short model name to the served model id.
    ///
    /// Unknown names are passed through unchanged.
    pub fn resolve(&self, model_name: &str) -> String {
        self.registry
            .get(model_name)
            .cloned()
            .unwrap_or_else(|| model_name.to_string())
    }
}

/// Input and output locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("data/texts"),
            output_dir: PathBuf::from("data/qa_results"),
        }
    }
}

/// Batching, scheduling and acceptance settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessingConfig {
    pub batch_size: usize,
    /// Comma-separated GPU device identifiers, e.g. `"0,1"`.
    pub gpu_devices: String,
    pub quality_threshold: f64,
    /// Upper bound for one batch's generation call.
    pub batch_timeout_secs: u64,
    pub max_segment_chars: usize,
    pub min_segment_chars: usize,
    /// Extra rounds a failed batch's documents get before they are marked failed.
    pub max_batch_retries: u32,
    /// Write rejected pairs to `rejected_qa.jsonl`.
    pub keep_rejected: bool,
    /// File extensions picked up from the input directory.
    pub file_extensions: Vec<String>,
    pub scoring: ScoringCriteria,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: 2,
            gpu_devices: "0".to_string(),
            quality_threshold: 0.7,
            batch_timeout_secs: 600,
            max_segment_chars: 2000,
            min_segment_chars: 80,
            max_batch_retries: 0,
            keep_rejected: true,
            file_extensions: vec!["txt".to_string(), "md".to_string()],
            scoring: ScoringCriteria::default(),
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub models: ModelsConfig,
    pub paths: PathsConfig,
    pub processing: ProcessingConfig,
    /// Sections absent from the source document, filled with defaults.
    #[serde(skip)]
    pub missing_sections: Vec<String>,
}

impl AppConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a JSON or YAML file.
    ///
    /// The format is chosen by extension (`.yaml`/`.yml` for YAML, JSON
    /// otherwise). Missing sections are logged and defaulted.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, or if the
    /// resulting values fail validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        let value: serde_json::Value = if is_yaml {
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?
        } else {
            serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?
        };

        let config = Self::from_value(value).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration from an already parsed document.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        if !value.is_object() {
            return Err(ConfigError::Parse {
                path: "<inline>".to_string(),
                message: "top-level value must be an object".to_string(),
            });
        }

        let missing_sections: Vec<String> = REQUIRED_SECTIONS
            .iter()
            .filter(|section| value.get(**section).is_none())
            .map(|section| section.to_string())
            .collect();

        let mut config: AppConfig =
            serde_json::from_value(value).map_err(|e| ConfigError::Parse {
                path: "<inline>".to_string(),
                message: e.to_string(),
            })?;

        for section in &missing_sections {
            tracing::warn!(section = %section, "Config section missing, using defaults");
        }
        config.missing_sections = missing_sections;

        Ok(config)
    }

    /// Applies `QAFORGE_*` environment variable overrides.
    ///
    /// # Environment Variables
    ///
    /// - `QAFORGE_API_BASE_URL`: inference server host
    /// - `QAFORGE_API_KEY`: bearer token for the servers
    /// - `QAFORGE_MODEL`: default model name
    /// - `QAFORGE_BATCH_SIZE`: documents per batch
    /// - `QAFORGE_GPU_DEVICES`: comma-separated device ids
    /// - `QAFORGE_QUALITY_THRESHOLD`: acceptance threshold in [0, 1]
    /// - `QAFORGE_BATCH_TIMEOUT_SECS`: per-batch generation timeout
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(val) = std::env::var("QAFORGE_API_BASE_URL") {
            self.api.base_url = val;
        }

        if let Ok(val) = std::env::var("QAFORGE_API_KEY") {
            self.api.api_key = Some(val);
        }

        if let Ok(val) = std::env::var("QAFORGE_MODEL") {
            self.models.default_model = val;
        }

        if let Ok(val) = std::env::var("QAFORGE_BATCH_SIZE") {
            self.processing.batch_size = parse_env_value(&val, "QAFORGE_BATCH_SIZE")?;
        }

        if let Ok(val) = std::env::var("QAFORGE_GPU_DEVICES") {
            self.processing.gpu_devices = val;
        }

        if let Ok(val) = std::env::var("QAFORGE_QUALITY_THRESHOLD") {
            self.processing.quality_threshold =
                parse_env_value(&val, "QAFORGE_QUALITY_THRESHOLD")?;
        }

        if let Ok(val) = std::env::var("QAFORGE_BATCH_TIMEOUT_SECS") {
            self.processing.batch_timeout_secs =
                parse_env_value(&val, "QAFORGE_BATCH_TIMEOUT_SECS")?;
        }

        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processing.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be at least 1".to_string(),
            ));
        }

        validate_threshold(self.processing.quality_threshold)?;
        GpuDevices::parse(&self.processing.gpu_devices)?;

        if self.processing.batch_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.processing.max_segment_chars == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_segment_chars must be greater than 0".to_string(),
            ));
        }

        if self.processing.min_segment_chars > self.processing.max_segment_chars {
            return Err(ConfigError::ValidationFailed(format!(
                "min_segment_chars ({}) must not exceed max_segment_chars ({})",
                self.processing.min_segment_chars, self.processing.max_segment_chars
            )));
        }

        if self.models.pairs_per_segment == 0 {
            return Err(ConfigError::ValidationFailed(
                "pairs_per_segment must be at least 1".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.models.temperature) {
            return Err(ConfigError::ValidationFailed(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        Ok(())
    }

    /// Per-batch generation timeout.
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.processing.batch_timeout_secs)
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.processing.batch_size = batch_size;
        self
    }

    /// Sets the GPU device list.
    pub fn with_gpu_devices(mut self, devices: impl Into<String>) -> Self {
        self.processing.gpu_devices = devices.into();
        self
    }

    /// Sets the quality threshold.
    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.processing.quality_threshold = threshold;
        self
    }

    /// Sets the per-batch timeout.
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.processing.batch_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Sets the number of retry rounds for failed batches.
    pub fn with_max_batch_retries(mut self, retries: u32) -> Self {
        self.processing.max_batch_retries = retries;
        self
    }
}

/// Checks that a quality threshold lies in [0, 1].
pub fn validate_threshold(threshold: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(ConfigError::InvalidValue {
            key: "quality_threshold".to_string(),
            message: format!("{} is outside [0, 1]", threshold),
        });
    }
    Ok(())
}

/// An ordered, duplicate-free, non-empty list of GPU device identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDevices(Vec<String>);

impl GpuDevices {
    /// Parses a comma-separated device list such as `"0,1"`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for an empty list or duplicate ids.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let devices: Vec<String> = spec
            .split(',')
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .map(|d| d.to_string())
            .collect();

        Self::from_ids(devices)
    }

    /// Builds a device list from individual ids.
    pub fn from_ids<I, S>(ids: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let devices: Vec<String> = ids.into_iter().map(Into::into).collect();

        if devices.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "gpu_devices".to_string(),
                message: "at least one device is required".to_string(),
            });
        }

        for (i, device) in devices.iter().enumerate() {
            if devices[..i].contains(device) {
                return Err(ConfigError::InvalidValue {
                    key: "gpu_devices".to_string(),
                    message: format!("device '{}' listed more than once", device),
                });
            }
        }

        Ok(Self(devices))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for GpuDevices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(","))
    }
}

/// Parses an environment variable value into the specified type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}
