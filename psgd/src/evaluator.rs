//! Policy evaluator.
//!
//! Applies per-tenant rules to detector findings and produces a tentative
//! decision: allow/block list checks first, then per-kind aggregation of
//! finding actions under lattice precedence, then the tenant guards
//! (`prompt_too_long`, `language_not_allowed`). When a remote evaluator is
//! configured and reachable, the aggregation and guard steps are delegated to
//! it; on timeout or transport failure the local algorithm runs instead —
//! unless the evaluator is configured fail-closed, in which case
//! unavailability itself blocks.

use async_trait::async_trait;
use psg_common::GatewayError;
use psg_common::lang::detect_language;
use psg_common::types::{Action, DetectorKind, Finding, RequestContext};
use psg_detect::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

/// Result shape shared by the local algorithm and the remote evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorResult {
    pub action: Action,
    pub reasons: Vec<String>,
    pub violations: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub metadata: JsonValue,
}

impl EvaluatorResult {
    pub fn allow() -> Self {
        Self {
            action: Action::Allow,
            reasons: Vec::new(),
            violations: Vec::new(),
            confidence: 1.0,
            metadata: JsonValue::Null,
        }
    }
}

/// What the remote evaluator receives: the serialized request context plus
/// the findings. The evaluator owns the policy document; we ship the inputs.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteEvalRequest<'a> {
    pub tenant: &'a str,
    pub channel: &'a str,
    pub prompt: &'a str,
    pub prompt_length: usize,
    pub language: &'static str,
    pub user_id: Option<&'a str>,
    pub user_roles: &'a [String],
    pub user_permissions: &'a [String],
    pub findings: &'a [Finding],
}

/// Remote policy evaluator contract.
#[async_trait]
pub trait RemoteEvaluator: Send + Sync {
    async fn evaluate(&self, request: RemoteEvalRequest<'_>)
    -> Result<EvaluatorResult, GatewayError>;

    async fn healthy(&self) -> bool;
}

/// The evaluator with its delegation policy.
pub struct Evaluator {
    remote: Option<Arc<dyn RemoteEvaluator>>,
    timeout: Duration,
    fail_closed: bool,
    default_max_prompt_length: usize,
    default_allowed_languages: Vec<String>,
    /// Whether the most recent delegation attempt reached the remote.
    remote_in_use: AtomicBool,
}

impl Evaluator {
    pub fn new(
        remote: Option<Arc<dyn RemoteEvaluator>>,
        timeout: Duration,
        fail_closed: bool,
        default_max_prompt_length: usize,
        default_allowed_languages: Vec<String>,
    ) -> Self {
        Self {
            remote,
            timeout,
            fail_closed,
            default_max_prompt_length,
            default_allowed_languages,
            remote_in_use: AtomicBool::new(false),
        }
    }

    /// `remote` or `local`, per the most recent evaluation.
    pub fn mode(&self) -> &'static str {
        if self.remote_in_use.load(Ordering::Relaxed) {
            "remote"
        } else {
            "local"
        }
    }

    /// Is the remote evaluator reachable right now?
    pub async fn remote_reachable(&self) -> bool {
        match &self.remote {
            Some(remote) => remote.healthy().await,
            None => false,
        }
    }

    /// Full evaluation: list short-circuits, then delegation or the local
    /// algorithm over findings and guards.
    pub async fn evaluate(
        &self,
        ctx: &RequestContext,
        snapshot: &Snapshot,
        prompt: &str,
        findings: &[Finding],
    ) -> EvaluatorResult {
        let now = chrono::Utc::now();
        if snapshot.allowlist_match(prompt, now).is_some() {
            return EvaluatorResult {
                action: Action::Allow,
                reasons: vec!["allowlist".to_string()],
                violations: Vec::new(),
                confidence: 1.0,
                metadata: JsonValue::Null,
            };
        }
        if let Some(entry) = snapshot.blocklist_match(prompt, now) {
            return EvaluatorResult {
                action: Action::Block,
                reasons: vec![format!("blocklist: {}", entry.value)],
                violations: vec!["blocklist".to_string()],
                confidence: 1.0,
                metadata: JsonValue::Null,
            };
        }

        if let Some(remote) = &self.remote {
            let request = RemoteEvalRequest {
                tenant: &ctx.tenant,
                channel: ctx.channel.as_str(),
                prompt,
                prompt_length: prompt.len(),
                language: detect_language(prompt),
                user_id: ctx.user_id.as_deref(),
                user_roles: &ctx.user_roles,
                user_permissions: &ctx.user_permissions,
                findings,
            };
            match tokio::time::timeout(self.timeout, remote.evaluate(request)).await {
                Ok(Ok(result)) => {
                    self.remote_in_use.store(true, Ordering::Relaxed);
                    return result;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "remote evaluator failed");
                }
                Err(_) => {
                    warn!("remote evaluator timed out after {:?}", self.timeout);
                }
            }
            self.remote_in_use.store(false, Ordering::Relaxed);
            if self.fail_closed {
                return EvaluatorResult {
                    action: Action::Block,
                    reasons: vec!["evaluator_unavailable".to_string()],
                    violations: vec!["evaluator_unavailable".to_string()],
                    confidence: 1.0,
                    metadata: JsonValue::Null,
                };
            }
        }

        self.evaluate_local(snapshot, prompt, findings)
    }

    /// Steps 4–5 of the algorithm: per-kind aggregation and tenant guards.
    fn evaluate_local(
        &self,
        snapshot: &Snapshot,
        prompt: &str,
        findings: &[Finding],
    ) -> EvaluatorResult {
        let mut action = Action::Allow;
        let mut reasons: Vec<String> = Vec::new();
        let mut violations: Vec<String> = Vec::new();
        let mut confidence: f64 = 0.0;

        // Aggregate findings into violation kinds; the strongest suggested
        // action of each kind competes on the lattice.
        let mut by_kind: BTreeMap<DetectorKind, Action> = BTreeMap::new();
        for finding in findings {
            let entry = by_kind.entry(finding.detector).or_insert(Action::Allow);
            *entry = (*entry).max(finding.suggested_action);
            if !reasons.contains(&finding.reason) {
                reasons.push(finding.reason.clone());
            }
            confidence = confidence.max(finding.confidence);
        }
        for (kind, kind_action) in &by_kind {
            if *kind_action > Action::Allow {
                violations.push(kind.as_str().to_string());
            }
            action = action.max(*kind_action);
        }

        // Tenant guards.
        let max_len = snapshot
            .guards
            .max_prompt_length
            .unwrap_or(self.default_max_prompt_length);
        if prompt.len() > max_len {
            action = Action::Block;
            reasons.push("prompt_too_long".to_string());
            violations.push("prompt_too_long".to_string());
            confidence = confidence.max(1.0);
        }

        let allowed = if snapshot.guards.allowed_languages.is_empty() {
            &self.default_allowed_languages
        } else {
            &snapshot.guards.allowed_languages
        };
        if !allowed.is_empty() {
            let language = detect_language(prompt);
            // The heuristic only knows ko/en; an inconclusive reading is not
            // grounds to block.
            if language != "unknown" && !allowed.iter().any(|l| l == language) {
                action = Action::Block;
                reasons.push("language_not_allowed".to_string());
                violations.push("language_not_allowed".to_string());
                confidence = confidence.max(1.0);
            }
        }

        if findings.is_empty() && violations.is_empty() {
            return EvaluatorResult::allow();
        }
        EvaluatorResult {
            action,
            reasons,
            violations,
            confidence: if confidence > 0.0 { confidence } else { 1.0 },
            metadata: serde_json::json!({ "evaluation_method": "local" }),
        }
    }
}
