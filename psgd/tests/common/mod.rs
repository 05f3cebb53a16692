//! Shared fixtures for gateway end-to-end tests: fake external back-ends
//! injected through the same `Backends` seam the daemon uses.

#![allow(dead_code)] // Not every test binary uses every fixture.

use async_trait::async_trait;
use psg_common::types::Severity;
use psg_common::{GatewayConfig, GatewayError};
use psg_detect::DetectorError;
use psg_detect::similarity::{BlockedPromptPoint, EmbeddingBackend, Neighbour, VectorIndex};
use psgd::audit::LogIndex;
use psgd::engine::{Backends, Engine};
use psgd::evaluator::{EvaluatorResult, RemoteEvalRequest, RemoteEvaluator};
use psg_store::RuleStore;
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Deterministic embedding back-end.
pub struct FakeEmbedding;

#[async_trait]
impl EmbeddingBackend for FakeEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, DetectorError> {
        Ok(vec![text.len() as f32, 1.0])
    }
}

/// In-memory vector index with canned neighbours.
#[derive(Default)]
pub struct FakeIndex {
    pub canned: Mutex<Vec<Neighbour>>,
    pub upserted: Mutex<Vec<BlockedPromptPoint>>,
}

impl FakeIndex {
    pub fn seeded_with_injection() -> Self {
        let index = Self::default();
        *index.canned.lock().unwrap() = vec![Neighbour {
            id: "seed-1".into(),
            score: 0.92,
            category: "known_injection".into(),
            severity: Severity::High,
        }];
        index
    }
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
        _collection: &str,
        points: Vec<BlockedPromptPoint>,
    ) -> Result<(), DetectorError> {
        self.upserted.lock().unwrap().extend(points);
        Ok(())
    }
}

/// Remote evaluator that always times out.
pub struct HangingEvaluator;

#[async_trait]
impl RemoteEvaluator for HangingEvaluator {
    async fn evaluate(
        &self,
        _request: RemoteEvalRequest<'_>,
    ) -> Result<EvaluatorResult, GatewayError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(EvaluatorResult::allow())
    }

    async fn healthy(&self) -> bool {
        false
    }
}

/// Log index capturing shipped documents.
#[derive(Default)]
pub struct CapturingLogIndex {
    pub docs: Mutex<Vec<JsonValue>>,
}

#[async_trait]
impl LogIndex for CapturingLogIndex {
    async fn append(&self, document: JsonValue) -> Result<(), GatewayError> {
        self.docs.lock().unwrap().push(document);
        Ok(())
    }
}

/// Engine over an in-memory store with no external back-ends.
pub fn local_engine() -> (Arc<Engine>, RuleStore) {
    let store = RuleStore::open_in_memory().unwrap();
    let engine = Engine::new(GatewayConfig::default(), store.clone(), Backends::none());
    (engine, store)
}

/// Engine with a seeded similarity stack enabled.
pub fn similarity_engine() -> (Arc<Engine>, RuleStore) {
    let store = RuleStore::open_in_memory().unwrap();
    let config = GatewayConfig {
        enable_similarity: true,
        ..GatewayConfig::default()
    };
    let backends = Backends {
        embedding: Some(Arc::new(FakeEmbedding)),
        vector_index: Some(Arc::new(FakeIndex::seeded_with_injection())),
        ..Backends::none()
    };
    let engine = Engine::new(config, store.clone(), backends);
    (engine, store)
}
