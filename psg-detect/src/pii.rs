//! PII detector.
//!
//! Hybrid pipeline over the normalized prompt:
//! 1. pattern matching — bundle rules first, then a TOML pattern file, then
//!    the built-in Korean-context table (precedence DB > TOML > built-in,
//!    applied per kind);
//! 2. structural validators — RRN check digit, Luhn for cards, email and
//!    phone shape checks, octet ranges for IPv4;
//! 3. context scoring over a ±100-byte window (see [`crate::pii_context`]);
//! 4. lightweight Korean name extraction gated on the surname table.
//!
//! Deduplication key is `(kind, start, end)`, keeping the highest-confidence
//! entry. Candidates below confidence 0.3 after scoring are dropped.

use crate::pii_context::score_context;
use crate::{Detector, DetectorError, ScanContext, luhn_valid};
use async_trait::async_trait;
use psg_common::types::{Action, DetectorKind, Finding, Severity, Span};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// Candidates below this confidence after context scoring are dropped.
const MIN_CONFIDENCE: f64 = 0.3;

/// Base confidence for bundle-rule matches before validation/context.
const BUNDLE_RULE_CONFIDENCE: f64 = 0.8;

/// Name candidates need a stronger signal than the generic cut.
const NAME_MIN_CONFIDENCE: f64 = 0.55;

/// PII kinds the detector reports. The wire form doubles as the masking
/// sentinel kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PiiKind {
    Ssn,
    Phone,
    Email,
    CreditCard,
    BankAccount,
    Address,
    IpAddress,
    Mac,
    DateOfBirth,
    Name,
}

impl PiiKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PiiKind::Ssn => "ssn",
            PiiKind::Phone => "phone",
            PiiKind::Email => "email",
            PiiKind::CreditCard => "credit_card",
            PiiKind::BankAccount => "bank_account",
            PiiKind::Address => "address",
            PiiKind::IpAddress => "ip_address",
            PiiKind::Mac => "mac",
            PiiKind::DateOfBirth => "date_of_birth",
            PiiKind::Name => "name",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ssn" => Some(PiiKind::Ssn),
            "phone" => Some(PiiKind::Phone),
            "email" => Some(PiiKind::Email),
            "credit_card" => Some(PiiKind::CreditCard),
            "bank_account" => Some(PiiKind::BankAccount),
            "address" => Some(PiiKind::Address),
            "ip_address" => Some(PiiKind::IpAddress),
            "mac" => Some(PiiKind::Mac),
            "date_of_birth" => Some(PiiKind::DateOfBirth),
            "name" => Some(PiiKind::Name),
            _ => None,
        }
    }

    fn severity(&self) -> Severity {
        match self {
            PiiKind::Ssn | PiiKind::CreditCard | PiiKind::BankAccount => Severity::High,
            PiiKind::Phone | PiiKind::Email | PiiKind::Address | PiiKind::DateOfBirth => {
                Severity::Medium
            }
            PiiKind::IpAddress | PiiKind::Mac | PiiKind::Name => Severity::Low,
        }
    }

    fn suggested_action(&self) -> Action {
        match self.severity() {
            Severity::High | Severity::Medium => Action::Redact,
            _ => Action::LogOnly,
        }
    }
}

/// Built-in Korean-context pattern table: (kind, regex, base confidence).
const BUILTIN_PATTERNS: &[(PiiKind, &str, f64)] = &[
    // Resident registration number (incl. foreign registration range).
    (PiiKind::Ssn, r"\b\d{6}-?[1-8]\d{6}\b", 0.75),
    // Mobile numbers.
    (PiiKind::Phone, r"\b01[016789]-?\d{3,4}-?\d{4}\b", 0.8),
    // Landlines.
    (PiiKind::Phone, r"\b0\d{1,2}-\d{3,4}-\d{4}\b", 0.6),
    // International form.
    (PiiKind::Phone, r"\+\d{1,3}-?\d{1,4}-?\d{3,4}-?\d{4}\b", 0.6),
    (
        PiiKind::Email,
        r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
        0.85,
    ),
    (
        PiiKind::CreditCard,
        r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b",
        0.6,
    ),
    (PiiKind::BankAccount, r"\b\d{3}-\d{2}-\d{6,14}\b", 0.6),
    (
        PiiKind::Address,
        r"(서울|부산|대구|인천|광주|대전|울산|세종|경기|강원|충북|충남|전북|전남|경북|경남|제주)[가-힣\s\d-]*(구|군|시|동|로|길)\s*\d*",
        0.6,
    ),
    (PiiKind::IpAddress, r"\b(?:\d{1,3}\.){3}\d{1,3}\b", 0.55),
    (
        PiiKind::IpAddress,
        r"\b(?:[0-9a-fA-F]{1,4}:){7}[0-9a-fA-F]{1,4}\b",
        0.6,
    ),
    (
        PiiKind::Mac,
        r"\b(?:[0-9a-fA-F]{2}[:-]){5}[0-9a-fA-F]{2}\b",
        0.6,
    ),
    (
        PiiKind::DateOfBirth,
        r"\b(?:19|20)\d{2}[-./](?:0[1-9]|1[0-2])[-./](?:0[1-9]|[12]\d|3[01])\b",
        0.5,
    ),
];

/// Common Korean surnames gating name extraction.
const KOREAN_SURNAMES: &[char] = &[
    '김', '이', '박', '최', '정', '강', '조', '윤', '장', '임', '한', '오', '서', '신', '권',
    '황', '안', '송', '전', '고', '문', '양', '손', '배', '백', '허', '유', '남', '심', '노',
    '하', '곽', '성', '차', '주', '우', '구', '나', '민', '진', '엄', '원', '천', '방', '공',
    '현', '함', '변', '염', '여', '추', '도', '소', '석', '선', '설', '마', '길', '연', '위',
    '표', '명', '기', '반', '금', '옥',
];

const HONORIFICS: &[&str] = &["씨", "님", "선생님", "교수님", "부장님", "과장님", "대리님"];

/// TOML pattern file shape: `[[patterns.ssn]] regex = "..." confidence = 0.9`.
#[derive(Debug, Deserialize)]
struct PatternFile {
    #[serde(default)]
    patterns: BTreeMap<String, Vec<FilePattern>>,
}

#[derive(Debug, Deserialize)]
struct FilePattern {
    regex: String,
    #[serde(default = "default_file_confidence")]
    confidence: f64,
}

fn default_file_confidence() -> f64 {
    0.6
}

struct CompiledPattern {
    kind: PiiKind,
    regex: Regex,
    confidence: f64,
    source: &'static str,
}

/// PII detector with immutable layered pattern state.
pub struct PiiDetector {
    /// Built-in patterns, possibly shadowed per kind by the TOML layer.
    layered: Vec<CompiledPattern>,
    name_candidate: Regex,
}

impl PiiDetector {
    pub fn new() -> Self {
        Self::build(HashMap::new())
    }

    /// Construct with a TOML pattern file. File patterns shadow the built-in
    /// table for the kinds they cover (precedence DB > TOML > built-in; the
    /// DB layer is applied per request from the snapshot).
    pub fn with_patterns_file(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read pattern file {:?}: {}", path, e))?;
        let file: PatternFile =
            toml::from_str(&raw).map_err(|e| format!("malformed pattern file {:?}: {}", path, e))?;

        let mut overlay: HashMap<PiiKind, Vec<(String, f64)>> = HashMap::new();
        for (kind_name, entries) in file.patterns {
            let Some(kind) = PiiKind::parse(&kind_name) else {
                tracing::warn!(kind = %kind_name, "unknown pii kind in pattern file, skipped");
                continue;
            };
            for entry in entries {
                overlay
                    .entry(kind)
                    .or_default()
                    .push((entry.regex, entry.confidence.clamp(0.0, 1.0)));
            }
        }
        Ok(Self::build(overlay))
    }

    fn build(overlay: HashMap<PiiKind, Vec<(String, f64)>>) -> Self {
        let mut layered = Vec::new();

        for (kind, patterns) in &overlay {
            for (pattern, confidence) in patterns {
                match compile(pattern) {
                    Some(regex) => layered.push(CompiledPattern {
                        kind: *kind,
                        regex,
                        confidence: *confidence,
                        source: "file",
                    }),
                    None => {
                        tracing::warn!(pattern = %pattern, "invalid pii pattern in file, skipped")
                    }
                }
            }
        }

        for (kind, pattern, confidence) in BUILTIN_PATTERNS {
            if overlay.contains_key(kind) {
                continue;
            }
            layered.push(CompiledPattern {
                kind: *kind,
                regex: compile(pattern).expect("built-in pii pattern must compile"),
                confidence: *confidence,
                source: "builtin",
            });
        }

        Self {
            layered,
            name_candidate: Regex::new(r"[가-힣]{2,4}").expect("name pattern must compile"),
        }
    }
}

impl Default for PiiDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Detector for PiiDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Pii
    }

    async fn scan(&self, input: &str, ctx: &ScanContext) -> Result<Vec<Finding>, DetectorError> {
        let mut candidates: Vec<Finding> = Vec::new();

        // Kinds covered by bundle rules shadow the layered patterns entirely.
        let db_kinds: HashSet<String> = ctx
            .snapshot
            .pii_rules
            .iter()
            .map(|r| r.sub_type.clone())
            .collect();

        for rule in &ctx.snapshot.pii_rules {
            for m in rule.regex.find_iter(input) {
                let span = Span::new(m.start(), m.end());
                let kind = PiiKind::parse(&rule.sub_type);
                let mut confidence = BUNDLE_RULE_CONFIDENCE;
                if let Some(kind) = kind {
                    confidence += validate(kind, m.as_str());
                }
                confidence += score_context(input, &span, &rule.sub_type).boost;
                candidates.push(
                    Finding::new(
                        DetectorKind::Pii,
                        rule.sub_type.clone(),
                        confidence.clamp(0.0, 1.0),
                        kind.map(|k| k.severity()).unwrap_or(Severity::Medium),
                        rule.action,
                    )
                    .with_span(m.start(), m.end())
                    .with_metadata(json!({ "rule_id": rule.id, "source": "db" })),
                );
            }
        }

        for pattern in &self.layered {
            if db_kinds.contains(pattern.kind.as_str()) {
                continue;
            }
            for m in pattern.regex.find_iter(input) {
                let span = Span::new(m.start(), m.end());
                let score = score_context(input, &span, pattern.kind.as_str());
                let confidence =
                    (pattern.confidence + validate(pattern.kind, m.as_str()) + score.boost)
                        .clamp(0.0, 1.0);
                candidates.push(
                    Finding::new(
                        DetectorKind::Pii,
                        pattern.kind.as_str(),
                        confidence,
                        pattern.kind.severity(),
                        pattern.kind.suggested_action(),
                    )
                    .with_span(m.start(), m.end())
                    .with_metadata(json!({
                        "source": pattern.source,
                        "context": score.cue.as_str(),
                    })),
                );
            }
        }

        if !db_kinds.contains("name") {
            candidates.extend(self.extract_names(input));
        }

        Ok(dedupe(candidates))
    }
}

impl PiiDetector {
    /// Surname-gated Korean name extraction: the lightweight stand-in for a
    /// morphological analyzer. A bare two-to-four syllable word starting with
    /// a common surname is weak evidence; honorifics and name-field keywords
    /// push it over the reporting threshold.
    fn extract_names(&self, input: &str) -> Vec<Finding> {
        let mut findings = Vec::new();
        for m in self.name_candidate.find_iter(input) {
            let mut word = m.as_str();
            let mut end = m.end();
            let mut honorific = false;

            // The candidate regex is greedy and swallows a trailing honorific
            // ("김철수님"); peel it off and keep it as evidence.
            for h in HONORIFICS {
                if word.len() > h.len() && word.ends_with(h) {
                    word = &word[..word.len() - h.len()];
                    end -= h.len();
                    honorific = true;
                    break;
                }
            }
            if !honorific {
                honorific = HONORIFICS.iter().any(|h| input[end..].starts_with(h));
            }

            let chars = word.chars().count();
            if !(2..=4).contains(&chars) {
                continue;
            }
            let Some(first) = word.chars().next() else {
                continue;
            };
            if !KOREAN_SURNAMES.contains(&first) {
                continue;
            }

            let mut confidence: f64 = 0.3;
            confidence += 0.2; // surname hit
            if honorific {
                confidence += 0.3;
            }
            let span = Span::new(m.start(), end);
            confidence += score_context(input, &span, "name").boost;

            if confidence >= NAME_MIN_CONFIDENCE {
                findings.push(
                    Finding::new(
                        DetectorKind::Pii,
                        PiiKind::Name.as_str(),
                        confidence.clamp(0.0, 1.0),
                        Severity::Low,
                        Action::LogOnly,
                    )
                    .with_span(span.start, span.end)
                    .with_metadata(json!({ "source": "analyzer" })),
                );
            }
        }
        findings
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .multi_line(true)
        .build()
        .ok()
}

/// Structural validation delta per kind. Positive for structurally sound
/// matches, negative for shapes that merely look the part.
fn validate(kind: PiiKind, text: &str) -> f64 {
    match kind {
        PiiKind::Ssn => {
            let digits: Vec<u32> = text.chars().filter_map(|c| c.to_digit(10)).collect();
            if digits.len() != 13 {
                return -0.3;
            }
            if rrn_check_digit_valid(&digits) { 0.2 } else { -0.3 }
        }
        PiiKind::Phone => {
            let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
            if digits.len() >= 10
                && digits.len() <= 11
                && (digits.starts_with("01") || text.starts_with('+'))
            {
                0.15
            } else if digits.len() >= 9 && digits.starts_with('0') {
                0.1
            } else {
                -0.3
            }
        }
        PiiKind::Email => {
            let Some((local, domain)) = text.split_once('@') else {
                return -0.4;
            };
            if !local.is_empty() && domain.contains('.') && !text.contains("..") {
                0.1
            } else {
                -0.4
            }
        }
        PiiKind::CreditCard => {
            let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
            if luhn_valid(&digits) { 0.3 } else { -0.35 }
        }
        PiiKind::BankAccount => {
            let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
            if digits.len() >= 11 && digits.len() <= 19 {
                0.1
            } else {
                -0.2
            }
        }
        PiiKind::IpAddress => {
            if !text.contains('.') {
                return 0.0; // IPv6 shape is already specific
            }
            if text
                .split('.')
                .all(|octet| octet.parse::<u16>().map(|n| n <= 255).unwrap_or(false))
            {
                0.15
            } else {
                -0.4
            }
        }
        PiiKind::DateOfBirth => {
            let year: Option<u16> = text.get(0..4).and_then(|y| y.parse().ok());
            match year {
                Some(y) if (1900..=2026).contains(&y) => 0.1,
                _ => -0.2,
            }
        }
        PiiKind::Address => {
            if text.chars().any(|c| c.is_ascii_digit()) {
                0.1
            } else {
                0.0
            }
        }
        PiiKind::Mac | PiiKind::Name => 0.0,
    }
}

/// Korean resident registration number check digit (mod-11 over the first 12
/// digits with weights 2..9,2..5).
fn rrn_check_digit_valid(digits: &[u32]) -> bool {
    const WEIGHTS: [u32; 12] = [2, 3, 4, 5, 6, 7, 8, 9, 2, 3, 4, 5];
    if digits.len() != 13 {
        return false;
    }
    let sum: u32 = digits[..12].iter().zip(WEIGHTS.iter()).map(|(d, w)| d * w).sum();
    let check = (11 - (sum % 11)) % 10;
    check == digits[12]
}

/// Dedup key is `(kind, start, end)`, keeping the highest-confidence entry,
/// then drop anything under the reporting threshold.
fn dedupe(candidates: Vec<Finding>) -> Vec<Finding> {
    let mut best: BTreeMap<(String, usize, usize), Finding> = BTreeMap::new();
    for finding in candidates {
        if finding.confidence < MIN_CONFIDENCE {
            continue;
        }
        let Some(span) = finding.span else { continue };
        let key = (finding.sub_type.clone(), span.start, span.end);
        match best.get(&key) {
            Some(existing) if existing.confidence >= finding.confidence => {}
            _ => {
                best.insert(key, finding);
            }
        }
    }
    best.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScanContext;
    use crate::snapshot::Snapshot;
    use psg_common::types::{BundleStatus, Channel, FilterRule, PolicyBundle};
    use std::io::Write;
    use std::sync::Arc;

    fn builtin_ctx() -> ScanContext {
        ScanContext::new(Arc::new(Snapshot::builtin(Channel::Prod)), "t1")
    }

    fn rule_ctx(pattern: &str, pii_type: &str, action: Action) -> ScanContext {
        let bundle = PolicyBundle {
            id: 3,
            tenant: "t1".into(),
            name: "b".into(),
            version: "1".into(),
            channel: Channel::Prod,
            status: BundleStatus::Active,
            max_prompt_length: None,
            allowed_languages: None,
            created_at: chrono::Utc::now(),
        };
        let rules = vec![FilterRule {
            id: 11,
            bundle_id: 3,
            rule_type: DetectorKind::Pii,
            pattern: pattern.into(),
            threshold: None,
            action,
            context: serde_json::json!({"pii_type": pii_type}),
            enabled: true,
        }];
        ScanContext::new(Arc::new(Snapshot::compile(&bundle, &rules, &[], &[])), "t1")
    }

    #[tokio::test]
    async fn bundle_ssn_rule_suggests_redact() {
        let detector = PiiDetector::new();
        let ctx = rule_ctx(r"\d{6}-\d{7}", "ssn", Action::Redact);
        let findings = detector.scan("계약자 800101-1234567 서명", &ctx).await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].sub_type, "ssn");
        assert_eq!(findings[0].suggested_action, Action::Redact);
        assert!(findings[0].is_bundle_scoped());
    }

    #[tokio::test]
    async fn db_rules_shadow_builtin_for_same_kind() {
        let detector = PiiDetector::new();
        // A rule that cannot match shadows the built-in ssn patterns anyway.
        let ctx = rule_ctx(r"NEVER-MATCHES-\d{20}", "ssn", Action::Redact);
        let findings = detector.scan("계약자 800101-1234567 서명", &ctx).await.unwrap();
        assert!(findings.iter().all(|f| f.sub_type != "ssn"));
    }

    #[tokio::test]
    async fn email_detected_with_validator_boost() {
        let detector = PiiDetector::new();
        let findings = detector
            .scan("메일 주소: kim.cs@example.co.kr 입니다", &builtin_ctx())
            .await
            .unwrap();
        let email = findings.iter().find(|f| f.sub_type == "email").unwrap();
        assert!(email.confidence > 0.9);
        assert_eq!(email.suggested_action, Action::Redact);
    }

    #[tokio::test]
    async fn credit_card_requires_luhn() {
        let detector = PiiDetector::new();
        let valid = detector
            .scan("카드번호 4539-5787-6362-1486 결제", &builtin_ctx())
            .await
            .unwrap();
        assert!(valid.iter().any(|f| f.sub_type == "credit_card" && f.confidence > 0.8));

        let invalid = detector
            .scan("number 4539-5787-6362-1487 here", &builtin_ctx())
            .await
            .unwrap();
        assert!(invalid.iter().all(|f| f.sub_type != "credit_card"));
    }

    #[tokio::test]
    async fn mobile_phone_detected() {
        let detector = PiiDetector::new();
        let findings = detector
            .scan("연락처: 010-1234-5678", &builtin_ctx())
            .await
            .unwrap();
        assert!(findings.iter().any(|f| f.sub_type == "phone" && f.confidence > 0.9));
    }

    #[tokio::test]
    async fn out_of_range_ipv4_rejected() {
        let detector = PiiDetector::new();
        let findings = detector.scan("listen on 999.300.1.2 now", &builtin_ctx()).await.unwrap();
        assert!(findings.iter().all(|f| f.sub_type != "ip_address"));

        let findings = detector.scan("listen on 10.0.0.1 now", &builtin_ctx()).await.unwrap();
        assert!(findings.iter().any(|f| f.sub_type == "ip_address"));
    }

    #[tokio::test]
    async fn surname_with_honorific_yields_name() {
        let detector = PiiDetector::new();
        let findings = detector.scan("김철수님 안녕하세요", &builtin_ctx()).await.unwrap();
        assert!(findings.iter().any(|f| f.sub_type == "name"));
    }

    #[tokio::test]
    async fn bare_korean_word_is_not_a_name() {
        let detector = PiiDetector::new();
        let findings = detector.scan("문서 검토 부탁", &builtin_ctx()).await.unwrap();
        assert!(findings.iter().all(|f| f.sub_type != "name"));
    }

    #[test]
    fn rrn_check_digit() {
        // 800101-1234560 carries a valid check digit for its first 12 digits.
        let digits: Vec<u32> = "8001011234560"
            .chars()
            .filter_map(|c| c.to_digit(10))
            .collect();
        assert!(rrn_check_digit_valid(&digits));
        let bad: Vec<u32> = "8001011234567"
            .chars()
            .filter_map(|c| c.to_digit(10))
            .collect();
        assert!(!rrn_check_digit_valid(&bad));
    }

    #[tokio::test]
    async fn toml_layer_shadows_builtin() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[patterns]\nssn = [{{ regex = \"EMP-\\\\d{{4}}\", confidence = 0.9 }}]"
        )
        .unwrap();
        let detector = PiiDetector::with_patterns_file(file.path()).unwrap();

        let findings = detector.scan("id EMP-1234 here", &builtin_ctx()).await.unwrap();
        assert!(findings.iter().any(|f| f.sub_type == "ssn"));

        // Built-in ssn pattern is shadowed by the file layer.
        let findings = detector
            .scan("계약자 800101-1234560 서명", &builtin_ctx())
            .await
            .unwrap();
        assert!(findings.iter().all(|f| f.sub_type != "ssn"));
    }
}
