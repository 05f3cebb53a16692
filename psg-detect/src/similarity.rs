//! Similarity detector and the embedding / vector-index seams.
//!
//! The prompt is embedded through the configured back-end and queried against
//! the tenant's blocked-prompt collection; every neighbour at or above the
//! cosine threshold becomes a finding. The index and the embedding model are
//! owned externally; this module only speaks their contracts, so tests inject
//! fakes. `add_blocked_prompt` maintains the block set and is wired to an
//! admin endpoint, never the decision hot path.

use crate::{Detector, DetectorError, ScanContext};
use async_trait::async_trait;
use psg_common::digest::input_digest;
use psg_common::types::{Action, DetectorKind, Finding, Severity};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// One neighbour returned by the vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neighbour {
    pub id: String,
    /// Cosine similarity in [0, 1].
    pub score: f64,
    pub category: String,
    pub severity: Severity,
}

/// A point upserted into the blocked-prompt collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedPromptPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub category: String,
    pub severity: Severity,
}

/// Embedding back-end contract.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, DetectorError>;
}

/// Vector index contract.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<Neighbour>, DetectorError>;

    async fn upsert(
        &self,
        collection: &str,
        points: Vec<BlockedPromptPoint>,
    ) -> Result<(), DetectorError>;
}

/// Embed-then-search plumbing shared by the similarity detector and the
/// injection detector's similarity sub-check.
pub struct SimilaritySearcher {
    embedding: Arc<dyn EmbeddingBackend>,
    index: Arc<dyn VectorIndex>,
}

impl SimilaritySearcher {
    pub fn new(embedding: Arc<dyn EmbeddingBackend>, index: Arc<dyn VectorIndex>) -> Self {
        Self { embedding, index }
    }

    /// Tenant-scoped collection name.
    pub fn collection_for(tenant: &str) -> String {
        format!("blocked_prompts_{}", tenant)
    }

    /// Nearest neighbours at or above `threshold`.
    pub async fn nearest(
        &self,
        tenant: &str,
        text: &str,
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<Neighbour>, DetectorError> {
        let vector = self.embedding.embed(text).await?;
        self.index
            .search(&Self::collection_for(tenant), &vector, limit, threshold)
            .await
    }

    /// Highest similarity against the block set, 0.0 when the set is empty.
    pub async fn top_score(&self, tenant: &str, text: &str) -> Result<f64, DetectorError> {
        let neighbours = self.nearest(tenant, text, 1, 0.0).await?;
        Ok(neighbours.first().map(|n| n.score).unwrap_or(0.0))
    }

    /// Add a prompt to the tenant's block set. Returns the point id.
    pub async fn add_blocked_prompt(
        &self,
        tenant: &str,
        text: &str,
        category: &str,
        severity: Severity,
    ) -> Result<String, DetectorError> {
        let vector = self.embedding.embed(text).await?;
        let id = input_digest(text);
        self.index
            .upsert(
                &Self::collection_for(tenant),
                vec![BlockedPromptPoint {
                    id: id.clone(),
                    vector,
                    text: text.to_string(),
                    category: category.to_string(),
                    severity,
                }],
            )
            .await?;
        Ok(id)
    }
}

/// The similarity detector proper.
pub struct SimilarityDetector {
    searcher: Arc<SimilaritySearcher>,
    default_threshold: f64,
    max_results: usize,
}

impl SimilarityDetector {
    pub fn new(searcher: Arc<SimilaritySearcher>, default_threshold: f64) -> Self {
        Self {
            searcher,
            default_threshold,
            max_results: 10,
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }
}

#[async_trait]
impl Detector for SimilarityDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Similarity
    }

    async fn scan(&self, input: &str, ctx: &ScanContext) -> Result<Vec<Finding>, DetectorError> {
        let threshold = ctx.snapshot.similarity_threshold(self.default_threshold);
        let neighbours = self
            .searcher
            .nearest(&ctx.tenant, input, self.max_results, threshold)
            .await?;

        let findings = neighbours
            .into_iter()
            .filter(|n| n.score >= threshold)
            .map(|n| {
                let mut action = match n.severity {
                    Severity::High | Severity::Critical => Action::Block,
                    _ => Action::RequireApproval,
                };
                // Bundle similarity rules sharpen the action once their own
                // threshold is crossed.
                for rule in &ctx.snapshot.similarity_rules {
                    if n.score >= rule.threshold {
                        action = action.max(rule.action);
                    }
                }
                Finding::new(
                    DetectorKind::Similarity,
                    n.category.clone(),
                    n.score,
                    n.severity,
                    action,
                )
                .with_metadata(json!({ "neighbour_id": n.id, "score": n.score }))
            })
            .collect();
        Ok(findings)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fake back-ends shared by unit tests across detector modules.

    use super::*;
    use std::sync::Mutex;

    /// Deterministic embedding: one-hot on the text length.
    pub struct FakeEmbedding;

    #[async_trait]
    impl EmbeddingBackend for FakeEmbedding {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, DetectorError> {
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    /// In-memory index returning canned neighbours per collection.
    #[derive(Default)]
    pub struct FakeIndex {
        pub canned: Mutex<Vec<Neighbour>>,
        pub upserted: Mutex<Vec<(String, BlockedPromptPoint)>>,
    }

    #[async_trait]
    impl VectorIndex for FakeIndex {
        async fn search(
            &self,
            _collection: &str,
            _vector: &[f32],
            limit: usize,
            threshold: f64,
        ) -> Result<Vec<Neighbour>, DetectorError> {
            let mut out: Vec<Neighbour> = self
                .canned
                .lock()
                .unwrap()
                .iter()
                .filter(|n| n.score >= threshold)
                .cloned()
                .collect();
            out.sort_by(|a, b| b.score.total_cmp(&a.score));
            out.truncate(limit);
            Ok(out)
        }

        async fn upsert(
            &self,
            collection: &str,
            points: Vec<BlockedPromptPoint>,
        ) -> Result<(), DetectorError> {
            let mut guard = self.upserted.lock().unwrap();
            for p in points {
                guard.push((collection.to_string(), p));
            }
            Ok(())
        }
    }
}
