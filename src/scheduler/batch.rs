//! Partitioning of filtered documents into batches.

use crate::pipeline::types::{Document, DocumentStatus};

/// An ordered group of documents sent to one handle in one call.
#[derive(Debug, Clone)]
pub struct Batch {
    id: usize,
    documents: Vec<Document>,
    device: Option<String>,
    completed: bool,
}

impl Batch {
    pub fn new(id: usize, documents: Vec<Document>) -> Self {
        Self {
            id,
            documents,
            device: None,
            completed: false,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Device the batch was dispatched to, if any.
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Total segment count across the batch.
    pub fn segment_count(&self) -> usize {
        self.documents.iter().map(|d| d.segments.len()).sum()
    }

    /// Looks up the text of a segment by document discovery index.
    pub fn segment(&self, document_index: usize, segment_index: usize) -> Option<&str> {
        self.documents
            .iter()
            .find(|d| d.index == document_index)
            .and_then(|d| d.segments.get(segment_index))
            .map(String::as_str)
    }

    pub fn into_documents(self) -> Vec<Document> {
        self.documents
    }

    pub(crate) fn assign_device(&mut self, device: impl Into<String>) {
        self.device = Some(device.into());
    }

    pub(crate) fn mark_completed(&mut self) {
        self.completed = true;
    }
}

/// Splits `documents` into batches of at most `batch_size`, in order.
///
/// Documents still `filtered` are moved to `batched` as their batch is
/// formed. A `batch_size` of zero is treated as one.
pub fn schedule(documents: Vec<Document>, batch_size: usize) -> Batches {
    Batches {
        documents: documents.into_iter(),
        batch_size: batch_size.max(1),
        next_id: 0,
    }
}

/// Lazy, finite and non-restartable sequence of batches.
#[derive(Debug)]
pub struct Batches {
    documents: std::vec::IntoIter<Document>,
    batch_size: usize,
    next_id: usize,
}

impl Batches {
    /// Numbers batches from `first_id` instead of zero.
    pub fn with_first_id(mut self, first_id: usize) -> Self {
        self.next_id = first_id;
        self
    }

    /// Id the next produced batch will get.
    pub fn next_id(&self) -> usize {
        self.next_id
    }
}

impl Iterator for Batches {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let mut documents: Vec<Document> = self.documents.by_ref().take(self.batch_size).collect();
        if documents.is_empty() {
            return None;
        }
        for doc in &mut documents {
            if doc.status() < DocumentStatus::Batched {
                if let Err(e) = doc.advance(DocumentStatus::Batched) {
                    tracing::warn!(error = %e, "Skipping status update for batched document");
                }
            }
        }

        let batch = Batch::new(self.next_id, documents);
        self.next_id += 1;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.documents.len().div_ceil(self.batch_size);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Batches {}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(n: usize) -> Vec<Document> {
        (0..n)
            .map(|i| {
                let mut doc = Document::new(format!("doc_{}.txt", i), i, "text");
                doc.set_segments(vec![format!("segment {}", i)]).expect("filter");
                doc
            })
            .collect()
    }

    #[test]
    fn test_batch_count_is_ceiling() {
        for (n, size, expected) in [(5, 2, 3), (4, 2, 2), (1, 8, 1), (0, 3, 0), (7, 1, 7)] {
            let batches: Vec<Batch> = schedule(docs(n), size).collect();
            assert_eq!(batches.len(), expected, "n={} size={}", n, size);
            assert!(batches.iter().all(|b| b.len() <= size));
        }
    }

    #[test]
    fn test_preserves_discovery_order() {
        let batches: Vec<Batch> = schedule(docs(5), 2).collect();
        let order: Vec<usize> = batches
            .iter()
            .flat_map(|b| b.documents().iter().map(|d| d.index))
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(batches.iter().map(Batch::id).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_documents_are_marked_batched() {
        let batch = schedule(docs(2), 2).next().expect("batch");
        assert!(batch
            .documents()
            .iter()
            .all(|d| d.status() == DocumentStatus::Batched));
        assert!(batch.device().is_none());
        assert!(!batch.is_completed());
    }

    #[test]
    fn test_size_hint_and_first_id() {
        let batches = schedule(docs(5), 2).with_first_id(10);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches.next_id(), 10);
        let ids: Vec<usize> = batches.map(|b| b.id()).collect();
        assert_eq!(ids, vec![10, 11, 12]);
    }

    #[test]
    fn test_zero_batch_size_is_one() {
        assert_eq!(schedule(docs(3), 0).count(), 3);
    }

    #[test]
    fn test_segment_lookup() {
        let batch = schedule(docs(3), 3).next().expect("batch");
        assert_eq!(batch.segment(2, 0), Some("segment 2"));
        assert_eq!(batch.segment(2, 1), None);
        assert_eq!(batch.segment(9, 0), None);
        assert_eq!(batch.segment_count(), 3);
    }
}
