//! ML risk classifier.
//!
//! Maps a prompt to a risk category, a set of threat types, a score, and a
//! confidence. The ensemble combines an optional remote transformer model
//! with a hand-crafted risk-indicator score and a feature-vector score; the
//! member weights and the category thresholds are configuration, not code.
//! The extracted feature vector is non-PII by construction (lengths, counts,
//! ratios, pattern-hit counts) and is safe to log.

use crate::{Detector, DetectorError, ScanContext};
use async_trait::async_trait;
use psg_common::types::{Action, DetectorKind, Finding, Severity};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Remote scoring model contract (transformer classifier or equivalent).
#[async_trait]
pub trait ScoreModel: Send + Sync {
    async fn score(&self, text: &str) -> Result<f64, DetectorError>;
}

/// Risk category bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskCategory {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskCategory::Safe => "safe",
            RiskCategory::Low => "low",
            RiskCategory::Medium => "medium",
            RiskCategory::High => "high",
            RiskCategory::Critical => "critical",
        }
    }

    fn severity(&self) -> Severity {
        match self {
            RiskCategory::Safe | RiskCategory::Low => Severity::Low,
            RiskCategory::Medium => Severity::Medium,
            RiskCategory::High => Severity::High,
            RiskCategory::Critical => Severity::Critical,
        }
    }
}

/// Ensemble member weights; renormalized over the members actually present.
#[derive(Debug, Clone)]
pub struct EnsembleWeights {
    pub remote: f64,
    pub heuristic: f64,
    pub features: f64,
}

impl Default for EnsembleWeights {
    fn default() -> Self {
        Self {
            remote: 0.6,
            heuristic: 0.25,
            features: 0.15,
        }
    }
}

/// Score cut-offs between risk categories.
#[derive(Debug, Clone)]
pub struct CategoryThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for CategoryThresholds {
    fn default() -> Self {
        Self {
            low: 0.4,
            medium: 0.6,
            high: 0.8,
            critical: 0.9,
        }
    }
}

/// Classifier configuration.
#[derive(Debug, Clone)]
pub struct MlConfig {
    pub weights: EnsembleWeights,
    pub categories: CategoryThresholds,
    /// Scores at or above this suggest BLOCK.
    pub block_score: f64,
    /// Scores at or above this (but below block) suggest REQUIRE_APPROVAL.
    pub approval_score: f64,
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            weights: EnsembleWeights::default(),
            categories: CategoryThresholds::default(),
            block_score: 0.8,
            approval_score: 0.6,
        }
    }
}

/// Loggable, non-PII feature vector.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureVector {
    pub length: usize,
    pub word_count: usize,
    pub sentence_count: usize,
    pub avg_word_length: f64,
    pub has_numbers: bool,
    pub has_special_chars: bool,
    pub has_korean: bool,
    pub has_english: bool,
    pub uppercase_ratio: f64,
    /// Hits per risk-indicator pattern.
    pub pattern_hits: BTreeMap<String, u32>,
}

/// Full classification result, also exposed for status/debug endpoints.
#[derive(Debug, Clone)]
pub struct MlClassification {
    pub risk_category: RiskCategory,
    pub score: f64,
    pub confidence: f64,
    pub threat_types: Vec<String>,
    pub features: FeatureVector,
    pub model_used: &'static str,
}

/// Risk-indicator patterns and their weights, plus the threat type each one
/// signals.
const RISK_INDICATORS: &[(&str, &str, f64, &str)] = &[
    ("ignore_instructions", r"ignore.*instructions?", 0.3, "prompt_injection"),
    ("forget_everything", r"forget.*everything", 0.3, "prompt_injection"),
    ("system_prompt", r"system.*prompt", 0.2, "data_extraction"),
    ("role_play", r"role.*play|pretend.*to.*be", 0.2, "role_manipulation"),
    ("jailbreak", r"jailbreak|bypass.*security", 0.4, "system_bypass"),
    ("admin_access", r"\b(?:admin|root|sudo)\b", 0.3, "system_bypass"),
    ("code_execution", r"execute|run.*code|\beval\b", 0.4, "malicious_code"),
    ("data_extraction", r"show.*all|list.*all|dump.*data", 0.3, "data_extraction"),
    ("override_system", r"override.*system", 0.3, "system_bypass"),
];

const REMOTE_CONFIDENCE: f64 = 0.8;
const HEURISTIC_CONFIDENCE: f64 = 0.75;
const FEATURES_CONFIDENCE: f64 = 0.7;

struct CompiledIndicator {
    name: &'static str,
    regex: Regex,
    weight: f64,
    threat: &'static str,
}

/// ML classifier with immutable compiled state.
pub struct MlClassifier {
    config: MlConfig,
    indicators: Vec<CompiledIndicator>,
    remote: Option<Arc<dyn ScoreModel>>,
}

impl MlClassifier {
    pub fn new(config: MlConfig) -> Self {
        let indicators = RISK_INDICATORS
            .iter()
            .map(|(name, pattern, weight, threat)| CompiledIndicator {
                name,
                regex: RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .expect("risk indicator pattern must compile"),
                weight: *weight,
                threat,
            })
            .collect();
        Self {
            config,
            indicators,
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn ScoreModel>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn extract_features(&self, text: &str) -> FeatureVector {
        let words: Vec<&str> = text.split_whitespace().collect();
        let letters = text.chars().filter(|c| c.is_alphabetic()).count();
        let uppers = text.chars().filter(|c| c.is_ascii_uppercase()).count();

        let mut pattern_hits = BTreeMap::new();
        for indicator in &self.indicators {
            let hits = indicator.regex.find_iter(text).count() as u32;
            if hits > 0 {
                pattern_hits.insert(indicator.name.to_string(), hits);
            }
        }

        FeatureVector {
            length: text.len(),
            word_count: words.len(),
            sentence_count: text.split(['.', '!', '?']).filter(|s| !s.trim().is_empty()).count(),
            avg_word_length: if words.is_empty() {
                0.0
            } else {
                words.iter().map(|w| w.len()).sum::<usize>() as f64 / words.len() as f64
            },
            has_numbers: text.chars().any(|c| c.is_ascii_digit()),
            has_special_chars: text.chars().any(|c| "!@#$%^&*(){}|<>".contains(c)),
            has_korean: text.chars().any(|c| ('\u{ac00}'..='\u{d7af}').contains(&c)),
            has_english: text.chars().any(|c| c.is_ascii_alphabetic()),
            uppercase_ratio: if letters == 0 {
                0.0
            } else {
                uppers as f64 / letters as f64
            },
            pattern_hits,
        }
    }

    fn heuristic_score(&self, text: &str) -> f64 {
        let mut score = 0.0;
        for indicator in &self.indicators {
            score += indicator.regex.find_iter(text).count() as f64 * indicator.weight;
        }
        score.min(1.0)
    }

    fn feature_score(&self, features: &FeatureVector) -> f64 {
        let mut score = 0.0;
        for indicator in &self.indicators {
            if let Some(hits) = features.pattern_hits.get(indicator.name) {
                score += *hits as f64 * indicator.weight;
            }
        }
        score.min(1.0)
    }

    fn threat_types(&self, features: &FeatureVector, score: f64) -> Vec<String> {
        let mut threats: Vec<String> = Vec::new();
        for indicator in &self.indicators {
            if features.pattern_hits.contains_key(indicator.name)
                && !threats.iter().any(|t| t == indicator.threat)
            {
                threats.push(indicator.threat.to_string());
            }
        }
        if threats.is_empty() && score >= self.config.categories.low {
            threats.push("social_engineering".to_string());
        }
        threats
    }

    fn category(&self, score: f64) -> RiskCategory {
        let t = &self.config.categories;
        if score >= t.critical {
            RiskCategory::Critical
        } else if score >= t.high {
            RiskCategory::High
        } else if score >= t.medium {
            RiskCategory::Medium
        } else if score >= t.low {
            RiskCategory::Low
        } else {
            RiskCategory::Safe
        }
    }

    /// Run the full ensemble.
    pub async fn classify(&self, text: &str) -> MlClassification {
        let features = self.extract_features(text);
        let heuristic = self.heuristic_score(text);
        let feature = self.feature_score(&features);

        let mut members: Vec<(f64, f64, f64)> = vec![
            (heuristic, HEURISTIC_CONFIDENCE, self.config.weights.heuristic),
            (feature, FEATURES_CONFIDENCE, self.config.weights.features),
        ];
        let mut model_used = "ensemble";

        if let Some(remote) = &self.remote {
            match remote.score(text).await {
                Ok(score) => {
                    members.push((score, REMOTE_CONFIDENCE, self.config.weights.remote));
                    model_used = "ensemble+remote";
                }
                Err(e) => warn!(error = %e, "remote score model degraded, local ensemble only"),
            }
        }

        let total_weight: f64 = members.iter().map(|(_, _, w)| w).sum();
        let (score, confidence) = if total_weight > 0.0 {
            (
                members.iter().map(|(s, _, w)| s * w).sum::<f64>() / total_weight,
                members.iter().map(|(_, c, w)| c * w).sum::<f64>() / total_weight,
            )
        } else {
            (0.0, 0.0)
        };

        let threat_types = self.threat_types(&features, score);
        MlClassification {
            risk_category: self.category(score),
            score,
            confidence,
            threat_types,
            features,
            model_used,
        }
    }
}

impl Default for MlClassifier {
    fn default() -> Self {
        Self::new(MlConfig::default())
    }
}

#[async_trait]
impl Detector for MlClassifier {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Ml
    }

    async fn scan(&self, input: &str, ctx: &ScanContext) -> Result<Vec<Finding>, DetectorError> {
        let result = self.classify(input).await;
        if result.risk_category == RiskCategory::Safe {
            return Ok(Vec::new());
        }

        let mut action = if result.score >= self.config.block_score {
            Action::Block
        } else if result.score >= self.config.approval_score {
            Action::RequireApproval
        } else {
            Action::LogOnly
        };
        for rule in &ctx.snapshot.ml_rules {
            if result.score >= rule.threshold {
                action = action.max(rule.action);
            }
        }

        Ok(vec![
            Finding::new(
                DetectorKind::Ml,
                result.risk_category.as_str(),
                result.confidence,
                result.risk_category.severity(),
                action,
            )
            .with_metadata(json!({
                "score": result.score,
                "threat_types": result.threat_types,
                "model_used": result.model_used,
                "features": result.features,
            })),
        ])
    }
}
