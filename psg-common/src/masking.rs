//! Masking engine for REDACT decisions.
//!
//! Replaces matched spans in the normalized prompt with a fixed,
//! length-agnostic sentinel per kind: `[REDACTED:<kind>]`. Overlapping spans
//! are merged before substitution, and substitutions run in descending start
//! order so earlier offsets stay valid. The engine never introduces content
//! outside spans and never widens a span to token boundaries.

use crate::types::Span;

/// One redaction request: a byte span plus the kind used in the sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskSpan {
    pub span: Span,
    pub kind: String,
}

impl MaskSpan {
    pub fn new(start: usize, end: usize, kind: impl Into<String>) -> Self {
        Self {
            span: Span::new(start, end),
            kind: kind.into(),
        }
    }
}

/// Render the sentinel for a kind.
pub fn sentinel(kind: &str) -> String {
    format!("[REDACTED:{}]", kind)
}

/// Apply redactions to `text`.
///
/// Invalid spans (empty, out of bounds, or off a UTF-8 boundary) are dropped
/// rather than risking a panic mid-request. Overlapping spans merge into one
/// redaction whose kind comes from the earliest-starting contributor (the
/// longer one on a tie).
pub fn apply_masks(text: &str, spans: &[MaskSpan]) -> String {
    let mut valid: Vec<&MaskSpan> = spans
        .iter()
        .filter(|m| {
            m.span.start < m.span.end
                && m.span.end <= text.len()
                && text.is_char_boundary(m.span.start)
                && text.is_char_boundary(m.span.end)
        })
        .collect();
    if valid.is_empty() {
        return text.to_string();
    }

    valid.sort_by(|a, b| {
        a.span
            .start
            .cmp(&b.span.start)
            .then(b.span.end.cmp(&a.span.end))
    });

    // Merge overlapping spans. The first (earliest, longest) contributor of a
    // merged group supplies the kind.
    let mut merged: Vec<MaskSpan> = Vec::with_capacity(valid.len());
    for m in valid {
        match merged.last_mut() {
            Some(last) if m.span.start < last.span.end => {
                last.span.end = last.span.end.max(m.span.end);
            }
            _ => merged.push(m.clone()),
        }
    }

    let mut out = text.to_string();
    for m in merged.iter().rev() {
        out.replace_range(m.span.start..m.span.end, &sentinel(&m.kind));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use regex::Regex;

    #[test]
    fn single_span() {
        let out = apply_masks("call 555-0100 now", &[MaskSpan::new(5, 13, "phone")]);
        assert_eq!(out, "call [REDACTED:phone] now");
    }

    #[test]
    fn descending_order_keeps_offsets_valid() {
        let out = apply_masks(
            "a@b.com and 800101-1234567",
            &[
                MaskSpan::new(0, 7, "email"),
                MaskSpan::new(12, 26, "ssn"),
            ],
        );
        assert_eq!(out, "[REDACTED:email] and [REDACTED:ssn]");
    }

    #[test]
    fn overlapping_spans_merge_to_one_sentinel() {
        let out = apply_masks(
            "0123456789",
            &[MaskSpan::new(1, 6, "ssn"), MaskSpan::new(4, 9, "phone")],
        );
        assert_eq!(out, "0[REDACTED:ssn]9");
    }

    #[test]
    fn adjacent_spans_stay_separate() {
        let out = apply_masks(
            "0123456789",
            &[MaskSpan::new(0, 5, "a"), MaskSpan::new(5, 10, "b")],
        );
        assert_eq!(out, "[REDACTED:a][REDACTED:b]");
    }

    #[test]
    fn invalid_spans_are_dropped() {
        let text = "short";
        assert_eq!(apply_masks(text, &[MaskSpan::new(2, 99, "x")]), text);
        assert_eq!(apply_masks(text, &[MaskSpan::new(3, 3, "x")]), text);
    }

    #[test]
    fn multibyte_text_masks_cleanly() {
        let text = "계약자 800101-1234567 서명";
        let re = Regex::new(r"\d{6}-\d{7}").unwrap();
        let m = re.find(text).unwrap();
        let out = apply_masks(text, &[MaskSpan::new(m.start(), m.end(), "ssn")]);
        assert_eq!(out, "계약자 [REDACTED:ssn] 서명");
    }

    /// Masking the masked output again (recomputing spans with the same
    /// finder) is a no-op: the sentinel contains nothing the finder matches.
    #[test]
    fn masking_is_idempotent_under_refind() {
        let re = Regex::new(r"\d{6}-\d{7}").unwrap();
        let mask = |text: &str| {
            let spans: Vec<MaskSpan> = re
                .find_iter(text)
                .map(|m| MaskSpan::new(m.start(), m.end(), "ssn"))
                .collect();
            apply_masks(text, &spans)
        };
        let once = mask("계약자 800101-1234567 서명");
        let twice = mask(&once);
        assert_eq!(once, twice);
    }

    proptest! {
        #[test]
        fn prefix_before_first_span_is_preserved(
            text in "[a-z0-9 ]{1,60}",
            start in 0usize..40,
            len in 1usize..20,
        ) {
            let start = start.min(text.len().saturating_sub(1));
            let end = (start + len).min(text.len());
            prop_assume!(start < end);
            let out = apply_masks(&text, &[MaskSpan::new(start, end, "x")]);
            prop_assert!(out.starts_with(&text[..start]));
            prop_assert!(out.ends_with(&text[end..]));
            prop_assert!(out.contains("[REDACTED:x]"));
        }

        #[test]
        fn arbitrary_spans_never_panic(
            text in ".{0,80}",
            spans in proptest::collection::vec((0usize..100, 0usize..100), 0..8),
        ) {
            let masks: Vec<MaskSpan> = spans
                .into_iter()
                .map(|(a, b)| MaskSpan::new(a.min(b), a.max(b), "k"))
                .collect();
            let _ = apply_masks(&text, &masks);
        }
    }
}
