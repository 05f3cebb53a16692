//! Common types used across gateway components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Decision action on the lattice, ordered from least to most restrictive.
///
/// The derived `Ord` follows declaration order, so `a.max(b)` is the lattice
/// join used by the decision fuser.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Let the prompt through unchanged.
    Allow,
    /// Let it through but record the decision.
    LogOnly,
    /// Hold the request for a human reviewer.
    RequireApproval,
    /// Replace matched spans with redaction tokens.
    Redact,
    /// Refuse the request.
    Block,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::LogOnly => "log_only",
            Action::RequireApproval => "require_approval",
            Action::Redact => "redact",
            Action::Block => "block",
        }
    }

    /// Parse the wire form; unknown strings are rejected at the boundary.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Action::Allow),
            "log_only" => Some(Action::LogOnly),
            "require_approval" => Some(Action::RequireApproval),
            "redact" => Some(Action::Redact),
            "block" => Some(Action::Block),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity attached to a finding.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// The six detector families. Filter rules use the same vocabulary, so this
/// also serves as the rule type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Static,
    Secret,
    Pii,
    Injection,
    Similarity,
    Ml,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::Static => "static",
            DetectorKind::Secret => "secret",
            DetectorKind::Pii => "pii",
            DetectorKind::Injection => "injection",
            DetectorKind::Similarity => "similarity",
            DetectorKind::Ml => "ml",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "static" => Some(DetectorKind::Static),
            "secret" => Some(DetectorKind::Secret),
            "pii" => Some(DetectorKind::Pii),
            "injection" => Some(DetectorKind::Injection),
            "similarity" => Some(DetectorKind::Similarity),
            "ml" => Some(DetectorKind::Ml),
            _ => None,
        }
    }
}

impl std::fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the final decision was reached, reported on the wire.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Allowlist,
    Blocklist,
    Static,
    Secret,
    Pii,
    Injection,
    Similarity,
    Ml,
    Policy,
    Composite,
    Error,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::Allowlist => "allowlist",
            DetectionMethod::Blocklist => "blocklist",
            DetectionMethod::Static => "static",
            DetectionMethod::Secret => "secret",
            DetectionMethod::Pii => "pii",
            DetectionMethod::Injection => "injection",
            DetectionMethod::Similarity => "similarity",
            DetectionMethod::Ml => "ml",
            DetectionMethod::Policy => "policy",
            DetectionMethod::Composite => "composite",
            DetectionMethod::Error => "error",
        }
    }

    pub fn from_detector(kind: DetectorKind) -> Self {
        match kind {
            DetectorKind::Static => DetectionMethod::Static,
            DetectorKind::Secret => DetectionMethod::Secret,
            DetectorKind::Pii => DetectionMethod::Pii,
            DetectorKind::Injection => DetectionMethod::Injection,
            DetectorKind::Similarity => DetectionMethod::Similarity,
            DetectorKind::Ml => DetectionMethod::Ml,
        }
    }
}

/// Deployment lane selecting which active bundle applies.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
    schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Dev,
    Staging,
    #[default]
    Prod,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Dev => "dev",
            Channel::Staging => "staging",
            Channel::Prod => "prod",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dev" => Some(Channel::Dev),
            "staging" => Some(Channel::Staging),
            "prod" => Some(Channel::Prod),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bundle lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleStatus {
    Draft,
    Active,
    Retired,
}

impl BundleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleStatus::Draft => "draft",
            BundleStatus::Active => "active",
            BundleStatus::Retired => "retired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(BundleStatus::Draft),
            "active" => Some(BundleStatus::Active),
            "retired" => Some(BundleStatus::Retired),
            _ => None,
        }
    }
}

/// A versioned policy bundle for one tenant/channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyBundle {
    pub id: i64,
    pub tenant: String,
    pub name: String,
    pub version: String,
    pub channel: Channel,
    pub status: BundleStatus,
    /// Tenant guard: block prompts longer than this (bytes of the normalized
    /// prompt). `None` defers to the gateway-wide default.
    pub max_prompt_length: Option<usize>,
    /// Tenant guard: permitted languages (`ko`, `en`). Empty/`None` = all.
    pub allowed_languages: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

impl PolicyBundle {
    pub fn to_ref(&self) -> BundleRef {
        BundleRef {
            name: self.name.clone(),
            version: self.version.clone(),
            channel: self.channel,
        }
    }
}

/// The bundle identity echoed in decide responses and decision records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct BundleRef {
    pub name: String,
    pub version: String,
    pub channel: Channel,
}

impl BundleRef {
    /// Placeholder identity used when a tenant has no active bundle.
    pub fn builtin(channel: Channel) -> Self {
        Self {
            name: "builtin".to_string(),
            version: "0".to_string(),
            channel,
        }
    }
}

/// A detector rule inside a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub id: i64,
    pub bundle_id: i64,
    pub rule_type: DetectorKind,
    /// Regex for regex-typed rules, an embedding reference for similarity,
    /// a model tag for ml.
    pub pattern: String,
    /// Only meaningful for similarity and ml rules; must be within [0, 1].
    pub threshold: Option<f64>,
    pub action: Action,
    /// Free-form context blob (e.g. `{"pii_type": "ssn"}`).
    #[serde(default)]
    pub context: JsonValue,
    pub enabled: bool,
}

impl FilterRule {
    /// Sub-type declared in the context blob, e.g. `{"pii_type": "ssn"}` or
    /// `{"secret_type": "api_key"}`. Falls back to the rule type name.
    pub fn sub_type(&self) -> String {
        for key in ["pii_type", "secret_type", "sub_type"] {
            if let Some(v) = self.context.get(key).and_then(|v| v.as_str()) {
                return v.to_string();
            }
        }
        self.rule_type.as_str().to_string()
    }
}

/// Allowlist / blocklist entry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListKind {
    /// Case-insensitive regex matched against the normalized prompt.
    Pattern,
    /// Substring match, lowercased.
    Domain,
    /// Exact match of the whole normalized prompt.
    Exact,
}

impl ListKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListKind::Pattern => "pattern",
            ListKind::Domain => "domain",
            ListKind::Exact => "exact",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pattern" => Some(ListKind::Pattern),
            "domain" => Some(ListKind::Domain),
            "exact" => Some(ListKind::Exact),
            _ => None,
        }
    }
}

/// One allowlist or blocklist entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListEntry {
    pub id: i64,
    pub bundle_id: i64,
    pub kind: ListKind,
    pub value: String,
    #[serde(default)]
    pub scope: Option<String>,
    /// Entries past their expiry are ignored, not deleted eagerly.
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
}

impl ListEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.is_some_and(|t| t <= now)
    }
}

/// Byte span into the normalized prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// One detector's observation about a region of the input. Transient, never
/// persisted; the audit record keeps only counts.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub detector: DetectorKind,
    /// Specific kind within the detector family (`api_key`, `ssn`,
    /// `instruction_override`, ...).
    pub sub_type: String,
    /// Matched region; absent for whole-prompt findings (ml, similarity).
    pub span: Option<Span>,
    pub confidence: f64,
    pub severity: Severity,
    pub suggested_action: Action,
    /// Human-readable reason contributed to the decision, e.g. `secret:api_key`.
    pub reason: String,
    pub metadata: JsonValue,
}

impl Finding {
    pub fn new(
        detector: DetectorKind,
        sub_type: impl Into<String>,
        confidence: f64,
        severity: Severity,
        suggested_action: Action,
    ) -> Self {
        let sub_type = sub_type.into();
        let reason = format!("{}:{}", detector.as_str(), sub_type);
        Self {
            detector,
            sub_type,
            span: None,
            confidence,
            severity,
            suggested_action,
            reason,
            metadata: JsonValue::Null,
        }
    }

    pub fn with_span(mut self, start: usize, end: usize) -> Self {
        self.span = Some(Span::new(start, end));
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    /// True when the finding came from a bundle-scoped rule rather than a
    /// built-in pattern set. Used for equal-action tie-breaking.
    pub fn is_bundle_scoped(&self) -> bool {
        self.metadata
            .get("rule_id")
            .map(|v| !v.is_null())
            .unwrap_or(false)
    }
}

/// Counts-only summary of findings, safe to persist and to return on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct FindingsSummary {
    /// Findings per detector kind.
    #[serde(default)]
    pub by_kind: BTreeMap<String, u32>,
    /// Findings per severity.
    #[serde(default)]
    pub by_severity: BTreeMap<String, u32>,
    /// Detectors that failed or timed out this request, as `kind: message`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detector_errors: Vec<String>,
}

impl FindingsSummary {
    pub fn record(&mut self, finding: &Finding) {
        *self
            .by_kind
            .entry(finding.detector.as_str().to_string())
            .or_insert(0) += 1;
        *self
            .by_severity
            .entry(finding.severity.as_str().to_string())
            .or_insert(0) += 1;
    }

    pub fn record_error(&mut self, kind: DetectorKind, message: impl std::fmt::Display) {
        self.detector_errors.push(format!("{}: {}", kind.as_str(), message));
    }

    pub fn count_for(&self, kind: DetectorKind) -> u32 {
        self.by_kind.get(kind.as_str()).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.by_kind.values().sum()
    }
}

/// Per-request context assembled at the boundary.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub tenant: String,
    pub user_id: Option<String>,
    pub session_id: String,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub channel: Channel,
    pub user_roles: Vec<String>,
    pub user_permissions: Vec<String>,
    /// Route recorded in the decision log (`/decide` or `/response/check`).
    pub route: String,
}

impl RequestContext {
    pub fn new(tenant: impl Into<String>, session_id: impl Into<String>, route: &str) -> Self {
        Self {
            tenant: tenant.into(),
            user_id: None,
            session_id: session_id.into(),
            client_ip: None,
            user_agent: None,
            channel: Channel::default(),
            user_roles: Vec::new(),
            user_permissions: Vec::new(),
            route: route.to_string(),
        }
    }
}

/// The gateway's final answer for one request.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub action: Action,
    pub reason: String,
    pub masked_prompt: String,
    pub risk_score: f64,
    pub detection_method: DetectionMethod,
    pub processing_time_ms: u64,
    pub findings_summary: FindingsSummary,
    pub reasons: Vec<String>,
    pub bundle: BundleRef,
}

/// The persisted, non-sensitive audit record. Invariant: `input_digest` is a
/// truncated hash of the normalized input; the raw prompt never appears here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub tenant: String,
    pub user_id: Option<String>,
    pub session_id: String,
    pub ts: DateTime<Utc>,
    pub route: String,
    pub input_digest: String,
    pub input_length: usize,
    pub decision: Action,
    pub reasons: Vec<String>,
    pub bundle_name: String,
    pub bundle_version: String,
    pub channel: Channel,
    pub latency_ms: u64,
    pub findings_summary: FindingsSummary,
}
