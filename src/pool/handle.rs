//! A loaded model bound to one GPU device.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{DeviceLoadError, GenerationError};
use crate::pipeline::types::{GenerationMeta, QaPair, SourceRef};
use crate::scheduler::Batch;

/// A raw question/answer produced by a backend, before scoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedPair {
    /// Discovery index of the source document.
    pub document_index: usize,
    pub segment_index: usize,
    pub question: String,
    pub answer: String,
}

/// Inference backend behind a handle.
///
/// `generate` must be a pure function of the model state and the batch text;
/// it yields one or more pairs per input segment.
#[async_trait]
pub trait QaGenerator: Send + Sync {
    async fn generate(&self, batch: &Batch) -> Result<Vec<GeneratedPair>, GenerationError>;
}

/// Creates one backend instance per device.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Loads `model_name` on the device at `position` in the configured list.
    async fn load(
        &self,
        model_name: &str,
        device: &str,
        position: usize,
    ) -> Result<Arc<dyn QaGenerator>, DeviceLoadError>;

    /// Releases whatever `load` acquired for the device.
    async fn unload(&self, _device: &str) {}
}

/// Load state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
    Error,
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadState::Unloaded => write!(f, "unloaded"),
            LoadState::Loading => write!(f, "loading"),
            LoadState::Ready => write!(f, "ready"),
            LoadState::Error => write!(f, "error"),
        }
    }
}

struct HandleInner {
    state: LoadState,
    generator: Option<Arc<dyn QaGenerator>>,
    last_error: Option<DeviceLoadError>,
}

/// One model instance bound to one device.
///
/// Owned by the pool; workers only reach it through a lease.
pub struct ModelHandle {
    device: String,
    position: usize,
    model_name: String,
    inner: Mutex<HandleInner>,
    busy: AtomicBool,
}

impl ModelHandle {
    pub(crate) fn new(device: impl Into<String>, position: usize, model_name: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            position,
            model_name: model_name.into(),
            inner: Mutex::new(HandleInner {
                state: LoadState::Unloaded,
                generator: None,
                last_error: None,
            }),
            busy: AtomicBool::new(false),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn state(&self) -> LoadState {
        self.lock().state
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<DeviceLoadError> {
        self.lock().last_error.clone()
    }

    /// Generates QA pairs for every segment of the batch.
    ///
    /// Pairs referring to documents outside the batch, or to segments a
    /// document does not have, are dropped.
    pub async fn generate(&self, batch: &Batch) -> Result<Vec<QaPair>, GenerationError> {
        let generator = {
            let inner = self.lock();
            match (&inner.state, &inner.generator) {
                (LoadState::Ready, Some(generator)) => Arc::clone(generator),
                _ => return Err(GenerationError::HandleNotReady(self.device.clone())),
            }
        };

        let raw = generator.generate(batch).await?;
        let generated_at = Utc::now();

        let mut next_pair_index: HashMap<(usize, usize), usize> = HashMap::new();
        let mut pairs = Vec::with_capacity(raw.len());
        for item in raw {
            let Some(document) = batch
                .documents()
                .iter()
                .find(|d| d.index == item.document_index)
            else {
                tracing::warn!(
                    device = %self.device,
                    batch_id = batch.id(),
                    document_index = item.document_index,
                    "Dropping pair for a document outside the batch"
                );
                continue;
            };
            if item.segment_index >= document.segments.len() {
                tracing::warn!(
                    device = %self.device,
                    document = %document.name(),
                    segment_index = item.segment_index,
                    "Dropping pair for an unknown segment"
                );
                continue;
            }

            let slot = next_pair_index
                .entry((item.document_index, item.segment_index))
                .or_insert(0);
            let pair_index = *slot;
            *slot += 1;

            pairs.push(QaPair::new(
                item.question,
                item.answer,
                SourceRef {
                    document: document.id.clone(),
                    document_index: document.index,
                    segment_index: item.segment_index,
                    pair_index,
                },
                GenerationMeta {
                    model: self.model_name.clone(),
                    device: self.device.clone(),
                    generated_at,
                },
            ));
        }

        Ok(pairs)
    }

    pub(crate) fn mark_loading(&self) {
        self.lock().state = LoadState::Loading;
    }

    pub(crate) fn mark_ready(&self, generator: Arc<dyn QaGenerator>) {
        let mut inner = self.lock();
        inner.state = LoadState::Ready;
        inner.generator = Some(generator);
        inner.last_error = None;
    }

    pub(crate) fn mark_error(&self, error: DeviceLoadError) {
        let mut inner = self.lock();
        inner.state = LoadState::Error;
        inner.generator = None;
        inner.last_error = Some(error);
    }

    pub(crate) fn mark_unloaded(&self) {
        let mut inner = self.lock();
        inner.state = LoadState::Unloaded;
        inner.generator = None;
    }

    /// Sets the busy flag; false if it was already set.
    pub(crate) fn try_mark_busy(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn clear_busy(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HandleInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("device", &self.device)
            .field("position", &self.position)
            .field("model_name", &self.model_name)
            .field("state", &self.state())
            .field("busy", &self.is_busy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Document;

    struct EchoGenerator;

    #[async_trait]
    impl QaGenerator for EchoGenerator {
        async fn generate(&self, batch: &Batch) -> Result<Vec<GeneratedPair>, GenerationError> {
            let mut out = Vec::new();
            for doc in batch.documents() {
                for (i, segment) in doc.segments.iter().enumerate() {
                    for _ in 0..2 {
                        out.push(GeneratedPair {
                            document_index: doc.index,
                            segment_index: i,
                            question: format!("What does '{}' say?", segment),
                            answer: segment.clone(),
                        });
                    }
                }
            }
            // Out-of-batch and out-of-range pairs are dropped by the handle
            out.push(GeneratedPair {
                document_index: 99,
                segment_index: 0,
                question: "q".to_string(),
                answer: "a".to_string(),
            });
            out.push(GeneratedPair {
                document_index: 0,
                segment_index: 42,
                question: "q".to_string(),
                answer: "a".to_string(),
            });
            Ok(out)
        }
    }

    fn batch() -> Batch {
        let mut doc = Document::new("a.txt", 0, "one two");
        doc.set_segments(vec!["one".to_string(), "two".to_string()])
            .expect("filter");
        Batch::new(0, vec![doc])
    }

    #[tokio::test]
    async fn test_generate_requires_ready_state() {
        let handle = ModelHandle::new("0", 0, "qwq_32");
        assert_eq!(handle.state(), LoadState::Unloaded);

        let result = handle.generate(&batch()).await;
        assert!(matches!(result, Err(GenerationError::HandleNotReady(d)) if d == "0"));
    }

    #[tokio::test]
    async fn test_generate_wraps_pairs_with_metadata() {
        let handle = ModelHandle::new("1", 1, "qwq_32");
        handle.mark_ready(Arc::new(EchoGenerator));

        let pairs = handle.generate(&batch()).await.expect("generated");
        assert_eq!(pairs.len(), 4);

        assert_eq!(pairs[0].source.sort_key(), (0, 0, 0));
        assert_eq!(pairs[1].source.sort_key(), (0, 0, 1));
        assert_eq!(pairs[2].source.sort_key(), (0, 1, 0));
        assert!(pairs.iter().all(|p| p.metadata.device == "1"));
        assert!(pairs.iter().all(|p| p.metadata.model == "qwq_32"));
        assert!(pairs.iter().all(|p| p.score().is_none()));
    }

    #[test]
    fn test_busy_flag_is_exclusive() {
        let handle = ModelHandle::new("0", 0, "m");
        assert!(handle.try_mark_busy());
        assert!(!handle.try_mark_busy());
        handle.clear_busy();
        assert!(!handle.is_busy());
    }

    #[test]
    fn test_state_transitions() {
        let handle = ModelHandle::new("0", 0, "m");
        handle.mark_loading();
        assert_eq!(handle.state(), LoadState::Loading);

        handle.mark_error(DeviceLoadError::LoadFailed {
            device: "0".to_string(),
            reason: "oom".to_string(),
        });
        assert_eq!(handle.state(), LoadState::Error);
        assert!(handle.last_error().is_some());

        handle.mark_unloaded();
        assert_eq!(handle.state(), LoadState::Unloaded);
        assert_eq!(LoadState::Ready.to_string(), "ready");
    }
}
