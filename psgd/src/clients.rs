//! HTTP implementations of the external collaborator contracts.
//!
//! Remote policy evaluator, embedding back-end, vector index, injection
//! model, ML score model, and the log index are all replaceable back-ends;
//! the core depends only on the traits these types implement. Every client
//! carries its own request timeout and shares reqwest's pooled connections.

use crate::audit::LogIndex;
use crate::evaluator::{EvaluatorResult, RemoteEvalRequest, RemoteEvaluator};
use async_trait::async_trait;
use psg_common::GatewayError;
use psg_detect::DetectorError;
use psg_detect::injection::{InjectionModel, ModelVerdict};
use psg_detect::ml::ScoreModel;
use psg_detect::similarity::{BlockedPromptPoint, EmbeddingBackend, Neighbour, VectorIndex};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::time::Duration;

fn client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(8)
        .build()
        .expect("reqwest client must build")
}

// =========================================================================
// Remote policy evaluator
// =========================================================================

/// `POST {base}/evaluate` with the serialized request context and findings;
/// the evaluator returns the shared [`EvaluatorResult`] shape.
pub struct HttpEvaluator {
    base: String,
    client: reqwest::Client,
}

impl HttpEvaluator {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base: base.into(),
            client: client(timeout),
        }
    }
}

#[async_trait]
impl RemoteEvaluator for HttpEvaluator {
    async fn evaluate(
        &self,
        request: RemoteEvalRequest<'_>,
    ) -> Result<EvaluatorResult, GatewayError> {
        let response = self
            .client
            .post(format!("{}/evaluate", self.base))
            .json(&request)
            .send()
            .await
            .map_err(|e| GatewayError::dependency("evaluator", e))?;
        if !response.status().is_success() {
            return Err(GatewayError::dependency(
                "evaluator",
                format!("status {}", response.status()),
            ));
        }
        response
            .json::<EvaluatorResult>()
            .await
            .map_err(|e| GatewayError::dependency("evaluator", e))
    }

    async fn healthy(&self) -> bool {
        let probe = client(Duration::from_secs(2));
        match probe.get(format!("{}/health", self.base)).send().await {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }
}

// =========================================================================
// Embedding back-end
// =========================================================================

/// `POST {base}/embed` → `{"vector": [..]}`.
pub struct HttpEmbedding {
    base: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct EmbedResponse {
    vector: Vec<f32>,
}

impl HttpEmbedding {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base: base.into(),
            client: client(timeout),
        }
    }
}

#[async_trait]
impl EmbeddingBackend for HttpEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, DetectorError> {
        let response = self
            .client
            .post(format!("{}/embed", self.base))
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| DetectorError::Backend(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DetectorError::Backend(format!(
                "embedding status {}",
                response.status()
            )));
        }
        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| DetectorError::Backend(e.to_string()))?;
        Ok(body.vector)
    }
}

// =========================================================================
// Vector index
// =========================================================================

/// Vector index speaking `search`/`upsert` over collections.
pub struct HttpVectorIndex {
    base: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    neighbours: Vec<Neighbour>,
}

impl HttpVectorIndex {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base: base.into(),
            client: client(timeout),
        }
    }
}

#[async_trait]
impl VectorIndex for HttpVectorIndex {
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<Neighbour>, DetectorError> {
        let response = self
            .client
            .post(format!("{}/collections/{}/search", self.base, collection))
            .json(&json!({
                "vector": vector,
                "limit": limit,
                "score_threshold": threshold,
            }))
            .send()
            .await
            .map_err(|e| DetectorError::Backend(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DetectorError::Backend(format!(
                "vector index status {}",
                response.status()
            )));
        }
        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| DetectorError::Backend(e.to_string()))?;
        Ok(body.neighbours)
    }

    async fn upsert(
        &self,
        collection: &str,
        points: Vec<BlockedPromptPoint>,
    ) -> Result<(), DetectorError> {
        let response = self
            .client
            .put(format!("{}/collections/{}/points", self.base, collection))
            .json(&json!({ "points": points }))
            .send()
            .await
            .map_err(|e| DetectorError::Backend(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DetectorError::Backend(format!(
                "vector index status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// =========================================================================
// Injection model and ML score model
// =========================================================================

/// `POST {base}/classify` → `{"injection": bool, "score": f64, "tactic"?}`.
pub struct HttpInjectionModel {
    base: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    #[serde(default)]
    injection: bool,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    tactic: Option<String>,
}

impl HttpInjectionModel {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base: base.into(),
            client: client(timeout),
        }
    }
}

#[async_trait]
impl InjectionModel for HttpInjectionModel {
    async fn classify(&self, text: &str) -> Result<ModelVerdict, DetectorError> {
        let response = self
            .client
            .post(format!("{}/classify", self.base))
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| DetectorError::Backend(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DetectorError::Backend(format!(
                "model status {}",
                response.status()
            )));
        }
        let body: ClassifyResponse = response
            .json()
            .await
            .map_err(|e| DetectorError::Backend(e.to_string()))?;
        Ok(ModelVerdict {
            injection: body.injection,
            score: body.score,
            tactic: body.tactic,
        })
    }
}

#[async_trait]
impl ScoreModel for HttpInjectionModel {
    async fn score(&self, text: &str) -> Result<f64, DetectorError> {
        Ok(self.classify(text).await?.score)
    }
}

// =========================================================================
// Log index
// =========================================================================

/// Append-only log index shipping. One retry gives at-least-once within the
/// shipper's own retry; the index deduplicates if it cares.
pub struct HttpLogIndex {
    base: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpLogIndex {
    pub fn new(base: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            base: base.into(),
            api_key,
            client: client(timeout),
        }
    }
}

#[async_trait]
impl LogIndex for HttpLogIndex {
    async fn append(&self, document: JsonValue) -> Result<(), GatewayError> {
        let mut request = self
            .client
            .post(format!("{}/decisions/_doc", self.base))
            .json(&document);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("ApiKey {}", key));
        }
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::dependency("log_index", e))?;
        if !response.status().is_success() {
            return Err(GatewayError::dependency(
                "log_index",
                format!("status {}", response.status()),
            ));
        }
        Ok(())
    }
}
