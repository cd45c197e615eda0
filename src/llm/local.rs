//! Model backend served by one local inference server per GPU device.
//!
//! Device at position `i` in the configured list is reached at
//! `api.base_url:(api.base_port + i)/v1`. Loading a device means confirming
//! its server is up and serves the requested model.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{DeviceLoadError, GenerationError};
use crate::metrics::MetricsCollector;
use crate::pipeline::config::{ApiConfig, AppConfig, ModelsConfig};
use crate::pool::{GeneratedPair, ModelLoader, QaGenerator};
use crate::scheduler::Batch;
use crate::utils::json_extraction::{extract_json_array, JsonExtractionError};

use super::client::{ChatClient, GenerationRequest, LlmProvider, Message};

/// System prompt for QA generation over display-technology text.
pub const QA_SYSTEM_PROMPT: &str = r#"You are an expert in semiconductor display technology (OLED, LCD, TFT backplanes, micro-LED, quantum dots, driver ICs, panel manufacturing).
You write question-answer pairs for training and evaluating domain assistants.

Rules:
1. Every answer must be fully supported by the given passage. Do not add outside facts.
2. Questions must be self-contained and specific; never refer to "the passage" or "the text".
3. Prefer questions about mechanisms, parameters, causes and comparisons over trivia.
4. Answer in the language of the passage.
5. Output only a JSON array of objects with the keys "question" and "answer"."#;

/// Builds the user prompt asking for `pairs` QA pairs about `segment`.
pub fn build_user_prompt(segment: &str, pairs: usize) -> String {
    format!(
        "Write {} question-answer pairs about the following passage.\n\nPassage:\n\"\"\"\n{}\n\"\"\"\n\nReturn a JSON array like [{{\"question\": \"...\", \"answer\": \"...\"}}].",
        pairs.max(1),
        segment
    )
}

/// Parses `(question, answer)` pairs out of a model reply.
///
/// Items missing either field, or with blank text, are skipped.
pub fn parse_qa_reply(content: &str) -> Result<Vec<(String, String)>, JsonExtractionError> {
    let items = extract_json_array(content)?;
    let pairs = items
        .iter()
        .filter_map(|item| {
            let question = field(item, &["question", "q", "问题"])?;
            let answer = field(item, &["answer", "a", "答案"])?;
            Some((question, answer))
        })
        .collect();
    Ok(pairs)
}

fn field(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| item.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Generation settings shared by every device.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingSettings {
    pub temperature: f64,
    pub max_tokens: u32,
    pub pairs_per_segment: usize,
}

impl From<&ModelsConfig> for SamplingSettings {
    fn from(models: &ModelsConfig) -> Self {
        Self {
            temperature: models.temperature,
            max_tokens: models.max_tokens,
            pairs_per_segment: models.pairs_per_segment,
        }
    }
}

/// [`QaGenerator`] that asks a chat model for pairs, one segment at a time.
pub struct LocalServerGenerator {
    provider: Arc<dyn LlmProvider>,
    served_model: String,
    device: String,
    sampling: SamplingSettings,
    metrics: MetricsCollector,
}

impl LocalServerGenerator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        served_model: impl Into<String>,
        device: impl Into<String>,
        sampling: SamplingSettings,
    ) -> Self {
        Self {
            provider,
            served_model: served_model.into(),
            device: device.into(),
            sampling,
            metrics: MetricsCollector::new(),
        }
    }

    fn request_for(&self, segment: &str) -> GenerationRequest {
        GenerationRequest::new(
            self.served_model.clone(),
            vec![
                Message::system(QA_SYSTEM_PROMPT),
                Message::user(build_user_prompt(segment, self.sampling.pairs_per_segment)),
            ],
        )
        .with_temperature(self.sampling.temperature)
        .with_max_tokens(self.sampling.max_tokens)
    }
}

#[async_trait]
impl QaGenerator for LocalServerGenerator {
    async fn generate(&self, batch: &Batch) -> Result<Vec<GeneratedPair>, GenerationError> {
        let mut pairs = Vec::new();
        let mut unparsable = 0usize;

        for document in batch.documents() {
            for (segment_index, segment) in document.segments.iter().enumerate() {
                let started = Instant::now();
                let result = self.provider.generate(self.request_for(segment)).await;
                self.metrics.record_llm_request(
                    &self.served_model,
                    result.is_ok(),
                    started.elapsed().as_secs_f64(),
                );
                let response = result?;

                let content = response.first_content().unwrap_or_default();
                match parse_qa_reply(content) {
                    Ok(parsed) if !parsed.is_empty() => {
                        pairs.extend(parsed.into_iter().map(|(question, answer)| GeneratedPair {
                            document_index: document.index,
                            segment_index,
                            question,
                            answer,
                        }));
                    }
                    Ok(_) => {
                        unparsable += 1;
                        warn!(
                            device = %self.device,
                            document = %document.name(),
                            segment_index = segment_index,
                            "Reply held no usable QA pairs"
                        );
                    }
                    Err(e) => {
                        unparsable += 1;
                        warn!(
                            device = %self.device,
                            document = %document.name(),
                            segment_index = segment_index,
                            error = %e,
                            "Failed to parse QA reply"
                        );
                    }
                }
            }
        }

        if pairs.is_empty() && unparsable > 0 {
            return Err(GenerationError::ParseError(format!(
                "no usable QA pairs in {} segment replies",
                unparsable
            )));
        }

        debug!(
            device = %self.device,
            batch_id = batch.id(),
            pairs = pairs.len(),
            "Generated QA pairs"
        );
        Ok(pairs)
    }
}

/// [`ModelLoader`] for per-device local servers.
#[derive(Debug, Clone)]
pub struct LocalServerLoader {
    api: ApiConfig,
    models: ModelsConfig,
}

impl LocalServerLoader {
    pub fn new(api: ApiConfig, models: ModelsConfig) -> Self {
        Self { api, models }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.api.clone(), config.models.clone())
    }

    fn client_for(&self, device: &str, position: usize) -> Result<ChatClient, DeviceLoadError> {
        ChatClient::new(
            self.api.endpoint_for(position),
            self.api.api_key.clone(),
            Duration::from_secs(self.api.request_timeout_secs),
        )
        .map_err(|e| DeviceLoadError::LoadFailed {
            device: device.to_string(),
            reason: e.to_string(),
        })
    }
}

/// True if the server lists `served` under its own id or a path suffix.
pub(crate) fn is_served(available: &[String], served: &str) -> bool {
    available
        .iter()
        .any(|m| m == served || m.ends_with(&format!("/{}", served)) || served.ends_with(&format!("/{}", m)))
}

#[async_trait]
impl ModelLoader for LocalServerLoader {
    async fn load(
        &self,
        model_name: &str,
        device: &str,
        position: usize,
    ) -> Result<Arc<dyn QaGenerator>, DeviceLoadError> {
        let client = self.client_for(device, position)?;
        let served = self.models.resolve(model_name);

        let available = client
            .list_models()
            .await
            .map_err(|e| DeviceLoadError::Unreachable {
                device: device.to_string(),
                reason: format!("{} ({})", e, client.api_base()),
            })?;

        if !is_served(&available, &served) {
            return Err(DeviceLoadError::ModelNotServed {
                device: device.to_string(),
                model: served,
                available: available.join(", "),
            });
        }

        info!(
            device = %device,
            endpoint = %client.api_base(),
            model = %served,
            "Model server ready"
        );

        Ok(Arc::new(LocalServerGenerator::new(
            Arc::new(client),
            served,
            device,
            SamplingSettings::from(&self.models),
        )))
    }
}
