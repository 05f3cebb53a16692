//! Immutable policy snapshots.
//!
//! A snapshot is the read-only projection of one active bundle used to serve
//! requests: rules with their regexes compiled once, allow/block lists with
//! pattern entries pre-compiled, and the tenant guards. Readers hold the
//! snapshot by `Arc` for the request's duration; activation produces a new
//! snapshot and never mutates an existing one.

use chrono::{DateTime, Utc};
use psg_common::types::{
    Action, BundleRef, Channel, DetectorKind, FilterRule, ListEntry, ListKind, PolicyBundle,
};
use regex::{Regex, RegexBuilder};
use tracing::warn;

/// A regex-typed rule compiled for the snapshot's lifetime.
#[derive(Debug)]
pub struct CompiledRule {
    pub id: i64,
    pub sub_type: String,
    pub action: Action,
    pub regex: Regex,
}

/// A similarity/ml rule: no regex, just a threshold and an action.
#[derive(Debug, Clone)]
pub struct ThresholdRule {
    pub id: i64,
    pub threshold: f64,
    pub action: Action,
}

/// One allow/block list entry, pattern entries pre-compiled.
#[derive(Debug)]
pub struct CompiledListEntry {
    pub kind: ListKind,
    pub value: String,
    pub regex: Option<Regex>,
    pub expire_at: Option<DateTime<Utc>>,
}

impl CompiledListEntry {
    /// Does this entry match the normalized prompt right now? Expired entries
    /// never match; they are ignored rather than deleted.
    pub fn matches(&self, prompt: &str, now: DateTime<Utc>) -> bool {
        if self.expire_at.is_some_and(|t| t <= now) {
            return false;
        }
        match self.kind {
            ListKind::Pattern => self
                .regex
                .as_ref()
                .map(|re| re.is_match(prompt))
                .unwrap_or(false),
            ListKind::Domain => prompt.to_lowercase().contains(&self.value.to_lowercase()),
            ListKind::Exact => prompt == self.value,
        }
    }
}

/// Tenant guards applied by the policy evaluator.
#[derive(Debug, Clone, Default)]
pub struct Guards {
    pub max_prompt_length: Option<usize>,
    pub allowed_languages: Vec<String>,
}

/// Immutable projection of one bundle, compiled for serving.
pub struct Snapshot {
    pub bundle: BundleRef,
    pub bundle_id: Option<i64>,
    pub static_rules: Vec<CompiledRule>,
    pub secret_rules: Vec<CompiledRule>,
    pub pii_rules: Vec<CompiledRule>,
    pub injection_rules: Vec<CompiledRule>,
    pub similarity_rules: Vec<ThresholdRule>,
    pub ml_rules: Vec<ThresholdRule>,
    pub allowlist: Vec<CompiledListEntry>,
    pub blocklist: Vec<CompiledListEntry>,
    pub guards: Guards,
}

impl Snapshot {
    /// Empty snapshot for tenants with no active bundle; built-in detector
    /// pattern sets still apply.
    pub fn builtin(channel: Channel) -> Self {
        Self {
            bundle: BundleRef::builtin(channel),
            bundle_id: None,
            static_rules: Vec::new(),
            secret_rules: Vec::new(),
            pii_rules: Vec::new(),
            injection_rules: Vec::new(),
            similarity_rules: Vec::new(),
            ml_rules: Vec::new(),
            allowlist: Vec::new(),
            blocklist: Vec::new(),
            guards: Guards::default(),
        }
    }

    /// Compile a bundle and its rules into a snapshot. Rules with invalid
    /// regexes are skipped with a warning; one bad pattern must not take the
    /// whole bundle down.
    pub fn compile(
        bundle: &PolicyBundle,
        rules: &[FilterRule],
        allowlist: &[ListEntry],
        blocklist: &[ListEntry],
    ) -> Self {
        let mut snapshot = Self {
            bundle: bundle.to_ref(),
            bundle_id: Some(bundle.id),
            static_rules: Vec::new(),
            secret_rules: Vec::new(),
            pii_rules: Vec::new(),
            injection_rules: Vec::new(),
            similarity_rules: Vec::new(),
            ml_rules: Vec::new(),
            allowlist: compile_list(allowlist),
            blocklist: compile_list(blocklist),
            guards: Guards {
                max_prompt_length: bundle.max_prompt_length,
                allowed_languages: bundle.allowed_languages.clone().unwrap_or_default(),
            },
        };

        for rule in rules.iter().filter(|r| r.enabled) {
            match rule.rule_type {
                DetectorKind::Similarity | DetectorKind::Ml => {
                    let threshold = match rule.threshold {
                        Some(t) if (0.0..=1.0).contains(&t) => t,
                        _ => {
                            warn!(rule = rule.id, "similarity/ml rule without valid threshold, skipped");
                            continue;
                        }
                    };
                    let compiled = ThresholdRule {
                        id: rule.id,
                        threshold,
                        action: rule.action,
                    };
                    if rule.rule_type == DetectorKind::Similarity {
                        snapshot.similarity_rules.push(compiled);
                    } else {
                        snapshot.ml_rules.push(compiled);
                    }
                }
                kind => {
                    let regex = match compile_pattern(&rule.pattern) {
                        Some(re) => re,
                        None => {
                            warn!(rule = rule.id, pattern = %rule.pattern, "invalid rule pattern, skipped");
                            continue;
                        }
                    };
                    let compiled = CompiledRule {
                        id: rule.id,
                        sub_type: rule.sub_type(),
                        action: rule.action,
                        regex,
                    };
                    match kind {
                        DetectorKind::Static => snapshot.static_rules.push(compiled),
                        DetectorKind::Secret => snapshot.secret_rules.push(compiled),
                        DetectorKind::Pii => snapshot.pii_rules.push(compiled),
                        DetectorKind::Injection => snapshot.injection_rules.push(compiled),
                        _ => unreachable!(),
                    }
                }
            }
        }

        snapshot
    }

    /// First matching allowlist entry, if any.
    pub fn allowlist_match(&self, prompt: &str, now: DateTime<Utc>) -> Option<&CompiledListEntry> {
        self.allowlist.iter().find(|e| e.matches(prompt, now))
    }

    /// First matching blocklist entry, if any.
    pub fn blocklist_match(&self, prompt: &str, now: DateTime<Utc>) -> Option<&CompiledListEntry> {
        self.blocklist.iter().find(|e| e.matches(prompt, now))
    }

    /// Effective similarity threshold: the tightest bundle rule wins over the
    /// supplied default.
    pub fn similarity_threshold(&self, default: f64) -> f64 {
        self.similarity_rules
            .iter()
            .map(|r| r.threshold)
            .fold(default, f64::min)
    }
}

/// Rule regexes evaluate case-insensitively and multiline across the board.
fn compile_pattern(pattern: &str) -> Option<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .multi_line(true)
        .build()
        .ok()
}

fn compile_list(entries: &[ListEntry]) -> Vec<CompiledListEntry> {
    entries
        .iter()
        .filter_map(|entry| {
            let regex = match entry.kind {
                ListKind::Pattern => match compile_pattern(&entry.value) {
                    Some(re) => Some(re),
                    None => {
                        warn!(entry = entry.id, value = %entry.value, "invalid list pattern, skipped");
                        return None;
                    }
                },
                _ => None,
            };
            Some(CompiledListEntry {
                kind: entry.kind,
                value: entry.value.clone(),
                regex,
                expire_at: entry.expire_at,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use psg_common::types::BundleStatus;
    use serde_json::json;

    fn bundle() -> PolicyBundle {
        PolicyBundle {
            id: 1,
            tenant: "t1".into(),
            name: "baseline".into(),
            version: "1.0.0".into(),
            channel: Channel::Prod,
            status: BundleStatus::Active,
            max_prompt_length: Some(4000),
            allowed_languages: Some(vec!["ko".into(), "en".into()]),
            created_at: Utc::now(),
        }
    }

    fn rule(id: i64, rule_type: DetectorKind, pattern: &str, action: Action) -> FilterRule {
        FilterRule {
            id,
            bundle_id: 1,
            rule_type,
            pattern: pattern.into(),
            threshold: None,
            action,
            context: json!({}),
            enabled: true,
        }
    }

    #[test]
    fn compiles_rules_by_kind_and_skips_invalid() {
        let rules = vec![
            rule(1, DetectorKind::Static, "drop\\s+table", Action::Block),
            rule(2, DetectorKind::Pii, r"\d{6}-\d{7}", Action::Redact),
            rule(3, DetectorKind::Static, "([unclosed", Action::Block),
            FilterRule {
                threshold: Some(0.8),
                ..rule(4, DetectorKind::Similarity, "blocked-prompts", Action::Block)
            },
            FilterRule {
                threshold: Some(1.5),
                ..rule(5, DetectorKind::Ml, "risk-v1", Action::Block)
            },
        ];
        let snapshot = Snapshot::compile(&bundle(), &rules, &[], &[]);
        assert_eq!(snapshot.static_rules.len(), 1);
        assert_eq!(snapshot.pii_rules.len(), 1);
        assert_eq!(snapshot.similarity_rules.len(), 1);
        assert!(snapshot.ml_rules.is_empty(), "out-of-range threshold skipped");
        assert_eq!(snapshot.guards.max_prompt_length, Some(4000));
    }

    #[test]
    fn rule_matching_is_case_insensitive() {
        let rules = vec![rule(1, DetectorKind::Static, "confidential", Action::Block)];
        let snapshot = Snapshot::compile(&bundle(), &rules, &[], &[]);
        assert!(snapshot.static_rules[0].regex.is_match("This is CONFIDENTIAL"));
    }

    #[test]
    fn list_matching_honours_kind_and_expiry() {
        let now = Utc::now();
        let allow = vec![ListEntry {
            id: 1,
            bundle_id: 1,
            kind: ListKind::Pattern,
            value: "^HELP: ".into(),
            scope: None,
            expire_at: None,
        }];
        let block = vec![
            ListEntry {
                id: 2,
                bundle_id: 1,
                kind: ListKind::Exact,
                value: "drop table".into(),
                scope: None,
                expire_at: None,
            },
            ListEntry {
                id: 3,
                bundle_id: 1,
                kind: ListKind::Domain,
                value: "evil.example.com".into(),
                scope: None,
                expire_at: Some(now - chrono::Duration::minutes(1)),
            },
        ];
        let snapshot = Snapshot::compile(&bundle(), &[], &allow, &block);

        assert!(snapshot.allowlist_match("HELP: please drop table users", now).is_some());
        assert!(snapshot.allowlist_match("please drop table users", now).is_none());
        assert!(snapshot.blocklist_match("drop table", now).is_some());
        assert!(snapshot.blocklist_match("drop table users", now).is_none(), "exact means exact");
        assert!(
            snapshot.blocklist_match("visit evil.example.com now", now).is_none(),
            "expired entries never match"
        );
    }

    #[test]
    fn tightest_similarity_threshold_wins() {
        let rules = vec![
            FilterRule {
                threshold: Some(0.85),
                ..rule(1, DetectorKind::Similarity, "a", Action::Block)
            },
            FilterRule {
                threshold: Some(0.6),
                ..rule(2, DetectorKind::Similarity, "b", Action::Block)
            },
        ];
        let snapshot = Snapshot::compile(&bundle(), &rules, &[], &[]);
        assert_eq!(snapshot.similarity_threshold(0.75), 0.6);

        let empty = Snapshot::builtin(Channel::Prod);
        assert_eq!(empty.similarity_threshold(0.75), 0.75);
    }
}
