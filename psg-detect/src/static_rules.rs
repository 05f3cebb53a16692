//! Static pattern detector.
//!
//! Evaluates the snapshot's enabled `static` rules against the normalized
//! prompt. Regexes are compiled once per snapshot (case-insensitive,
//! multiline); a match yields a high-severity finding whose suggested action
//! comes from the rule.

use crate::{Detector, DetectorError, ScanContext};
use async_trait::async_trait;
use psg_common::types::{DetectorKind, Finding, Severity};
use serde_json::json;

/// Confidence assigned to a plain static-pattern match.
const STATIC_CONFIDENCE: f64 = 0.8;

#[derive(Default)]
pub struct StaticPatternDetector;

impl StaticPatternDetector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Detector for StaticPatternDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Static
    }

    async fn scan(&self, input: &str, ctx: &ScanContext) -> Result<Vec<Finding>, DetectorError> {
        let mut findings = Vec::new();
        for rule in &ctx.snapshot.static_rules {
            for m in rule.regex.find_iter(input) {
                findings.push(
                    Finding::new(
                        DetectorKind::Static,
                        rule.sub_type.clone(),
                        STATIC_CONFIDENCE,
                        Severity::High,
                        rule.action,
                    )
                    .with_span(m.start(), m.end())
                    .with_metadata(json!({ "rule_id": rule.id })),
                );
            }
        }
        Ok(findings)
    }
}
