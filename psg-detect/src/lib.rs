//! Detector suite for the Prompt Screening Gateway.
//!
//! Each detector is stateless per request, holds only immutable pattern or
//! model state, and never mutates the input. Detectors report typed findings;
//! whether a finding blocks, redacts, or merely logs is decided downstream by
//! the policy evaluator and the decision fuser. A detector failure is a typed
//! error, not a decision — the orchestrator records it and moves on.

pub mod injection;
pub mod ml;
pub mod pii;
pub mod pii_context;
pub mod secrets;
pub mod similarity;
pub mod snapshot;
pub mod static_rules;

use async_trait::async_trait;
use psg_common::types::{DetectorKind, Finding};
use snapshot::Snapshot;
use std::sync::Arc;
use thiserror::Error;

/// Errors a detector can surface. These degrade the single detector to
/// "no findings" at the orchestrator; they never fail the request.
#[derive(Debug, Error)]
pub enum DetectorError {
    /// A remote back-end (embedding, vector index, model) failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// The detector was cancelled cooperatively (deadline or shutdown).
    #[error("cancelled")]
    Cancelled,

    /// The detector is not wired up (toggle off, missing client).
    #[error("detector disabled: {0}")]
    Disabled(&'static str),
}

/// Per-request context handed to every detector in the fan-out.
#[derive(Clone)]
pub struct ScanContext {
    /// Immutable policy snapshot for the request's tenant/channel.
    pub snapshot: Arc<Snapshot>,
    pub tenant: String,
}

impl ScanContext {
    pub fn new(snapshot: Arc<Snapshot>, tenant: impl Into<String>) -> Self {
        Self {
            snapshot,
            tenant: tenant.into(),
        }
    }
}

/// The detector capability set: scan a normalized prompt and return findings.
#[async_trait]
pub trait Detector: Send + Sync {
    fn kind(&self) -> DetectorKind;

    async fn scan(&self, input: &str, ctx: &ScanContext) -> Result<Vec<Finding>, DetectorError>;
}

/// Luhn check-digit validation for card-like digit runs. Shared by the secret
/// and PII detectors.
pub(crate) fn luhn_valid(digits: &str) -> bool {
    let digits: Vec<u32> = digits.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 12 || digits.len() > 19 {
        return false;
    }
    let mut sum = 0u32;
    for (i, d) in digits.iter().rev().enumerate() {
        let mut d = *d;
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    sum % 10 == 0
}
