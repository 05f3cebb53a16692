//! Decision fuser.
//!
//! Combines the short-circuit outcome, the evaluator result, and the raw
//! findings into the final decision on the action lattice
//! `ALLOW ≺ LOG_ONLY ≺ REQUIRE_APPROVAL ≺ REDACT ≺ BLOCK`:
//! the final action is the lattice max across contributors, a BLOCK from any
//! layer is absolute (masking is not attempted), REDACT hands the matched
//! spans to the masking engine, reasons are a deduplicated union, and the
//! risk score is the maximum confidence across contributing findings.
//! Equal-action ties prefer the more specific reason — bundle-scoped beats
//! built-in.

use crate::evaluator::EvaluatorResult;
use psg_common::masking::MaskSpan;
use psg_common::types::{Action, DetectionMethod, Finding};
use std::collections::BTreeSet;

/// Outcome of the allow/block short-circuit stage.
#[derive(Debug, Clone)]
pub enum ShortCircuit {
    Allowlisted,
    Blocklisted { value: String },
}

/// Fused decision handed to masking and the audit logger.
#[derive(Debug, Clone)]
pub struct FusedDecision {
    pub action: Action,
    pub reason: String,
    pub reasons: Vec<String>,
    pub risk_score: f64,
    pub detection_method: DetectionMethod,
    /// Spans to redact when `action` is `Redact`; empty otherwise.
    pub redact_spans: Vec<MaskSpan>,
}

/// Fuse the pipeline's inputs into the final decision. The findings are an
/// unordered set; nothing here depends on detector completion order.
pub fn fuse(
    short_circuit: Option<ShortCircuit>,
    evaluator: &EvaluatorResult,
    findings: &[Finding],
) -> FusedDecision {
    match short_circuit {
        Some(ShortCircuit::Allowlisted) => {
            return FusedDecision {
                action: Action::Allow,
                reason: "allowlist".to_string(),
                reasons: vec!["allowlist".to_string()],
                risk_score: 0.0,
                detection_method: DetectionMethod::Allowlist,
                redact_spans: Vec::new(),
            };
        }
        Some(ShortCircuit::Blocklisted { value }) => {
            let reason = format!("blocklist: {}", value);
            return FusedDecision {
                action: Action::Block,
                reason: reason.clone(),
                reasons: vec![reason],
                risk_score: 1.0,
                detection_method: DetectionMethod::Blocklist,
                redact_spans: Vec::new(),
            };
        }
        None => {}
    }

    let mut action = evaluator.action;
    for finding in findings {
        action = action.max(finding.suggested_action);
    }

    // Reasons: union of evaluator reasons and finding reasons, deduplicated
    // by string identity, findings first so detector evidence leads.
    let mut reasons: Vec<String> = Vec::new();
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for finding in findings {
        if seen.insert(finding.reason.as_str()) {
            reasons.push(finding.reason.clone());
        }
    }
    for reason in &evaluator.reasons {
        if seen.insert(reason.as_str()) {
            reasons.push(reason.clone());
        }
    }

    let risk_score = findings
        .iter()
        .map(|f| f.confidence)
        .fold(0.0f64, f64::max)
        .max(if evaluator.action > Action::Allow {
            evaluator.confidence
        } else {
            0.0
        });

    // Primary reason: among contributors of the final action, a
    // bundle-scoped finding beats a built-in one beats the evaluator.
    let deciding: Vec<&Finding> = findings
        .iter()
        .filter(|f| f.suggested_action == action)
        .collect();
    let reason = deciding
        .iter()
        .find(|f| f.is_bundle_scoped())
        .or_else(|| deciding.first())
        .map(|f| f.reason.clone())
        .or_else(|| {
            if evaluator.action == action {
                evaluator.reasons.first().cloned()
            } else {
                None
            }
        })
        .unwrap_or_else(|| {
            reasons
                .first()
                .cloned()
                .unwrap_or_else(|| action.as_str().to_string())
        });

    let detection_method = method_for(action, evaluator, findings);

    let redact_spans = if action == Action::Redact {
        findings
            .iter()
            .filter(|f| f.suggested_action == Action::Redact)
            .filter_map(|f| {
                f.span
                    .map(|span| MaskSpan::new(span.start, span.end, f.sub_type.clone()))
            })
            .collect()
    } else {
        Vec::new()
    };

    FusedDecision {
        action,
        reason,
        reasons,
        risk_score,
        detection_method,
        redact_spans,
    }
}

/// How was the final action reached: a single detector kind, a composite of
/// several, pure policy (guards/remote), or nothing at all.
fn method_for(
    action: Action,
    evaluator: &EvaluatorResult,
    findings: &[Finding],
) -> DetectionMethod {
    if action == Action::Allow {
        return DetectionMethod::Policy;
    }
    let kinds: BTreeSet<_> = findings
        .iter()
        .filter(|f| f.suggested_action == action)
        .map(|f| f.detector)
        .collect();
    match kinds.len() {
        0 => {
            if evaluator.action == action {
                DetectionMethod::Policy
            } else {
                // Action forced purely by sub-maximal contributors cannot
                // happen on a lattice max; defensive default.
                DetectionMethod::Composite
            }
        }
        1 => DetectionMethod::from_detector(*kinds.iter().next().expect("one kind")),
        _ => DetectionMethod::Composite,
    }
}
