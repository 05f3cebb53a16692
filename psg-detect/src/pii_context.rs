//! Context scoring for PII candidates.
//!
//! A candidate match gets its confidence adjusted by what surrounds it: a
//! phone-looking number next to "연락처:" is far more likely to be a phone
//! number than the same digits in a stack trace. The window is ±100 bytes
//! around the candidate, clamped to character boundaries.

use psg_common::types::Span;

/// Window radius in bytes on each side of the candidate.
pub const CONTEXT_RADIUS: usize = 100;

/// Where the candidate appears to live, judged from surrounding cues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextCue {
    FormField,
    Document,
    Database,
    EmailHeader,
    None,
}

impl ContextCue {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextCue::FormField => "form_field",
            ContextCue::Document => "document",
            ContextCue::Database => "database",
            ContextCue::EmailHeader => "email_header",
            ContextCue::None => "none",
        }
    }
}

/// Per-kind keyword families. Korean first; the corpus this gateway fronts is
/// Korean-heavy, with English fallbacks.
fn kind_keywords(kind: &str) -> &'static [&'static str] {
    match kind {
        "name" => &[
            "이름", "성명", "성함", "고객명", "회원명", "담당자", "name",
        ],
        "phone" => &[
            "전화", "연락처", "핸드폰", "휴대폰", "폰번호", "통화", "phone", "mobile",
        ],
        "email" => &["이메일", "메일", "수신", "발신", "email", "mail"],
        "address" => &[
            "주소", "거주지", "배송지", "배송", "우편번호", "address",
        ],
        "ssn" => &[
            "주민번호", "주민등록번호", "주민등록", "신분증", "ssn", "resident",
        ],
        "credit_card" => &[
            "카드", "신용카드", "체크카드", "결제", "카드번호", "card",
        ],
        "bank_account" => &[
            "계좌", "계좌번호", "통장", "은행", "입금", "출금", "account",
        ],
        "date_of_birth" => &["생년월일", "생일", "출생", "birth", "dob"],
        _ => &[],
    }
}

const FORM_FIELD_CUES: &[&str] = &[
    "이름:", "성명:", "전화번호:", "연락처:", "이메일:", "주소:", "생년월일:",
    "주민번호:", "계좌번호:", "name:", "phone:", "email:", "address:", "ssn:",
];

const DOCUMENT_CUES: &[&str] = &[
    "계약", "신청서", "증명서", "보고서", "신분증", "여권", "contract",
    "agreement", "certificate", "report", "passport",
];

const DATABASE_CUES: &[&str] = &[
    "select ", "insert ", "update ", "delete ", "table", "column", "database",
    "데이터베이스",
];

const EMAIL_HEADER_CUES: &[&str] = &["from:", "to:", "cc:", "subject:", "발신자", "수신자", "제목:"];

/// Outcome of context analysis for one candidate.
#[derive(Debug, Clone)]
pub struct ContextScore {
    pub boost: f64,
    pub cue: ContextCue,
}

/// Extract the ±radius window around a span, clamped to char boundaries.
pub fn context_window<'a>(text: &'a str, span: &Span, radius: usize) -> &'a str {
    let mut start = span.start.saturating_sub(radius);
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (span.end + radius).min(text.len());
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }
    &text[start..end]
}

/// Score the window around a candidate of the given kind.
pub fn score_context(text: &str, span: &Span, kind: &str) -> ContextScore {
    let window = context_window(text, span, CONTEXT_RADIUS).to_lowercase();

    let mut boost = 0.0;
    if kind_keywords(kind).iter().any(|k| window.contains(k)) {
        boost += 0.2;
    }

    let cue = if FORM_FIELD_CUES.iter().any(|c| window.contains(c)) {
        boost += 0.1;
        ContextCue::FormField
    } else if EMAIL_HEADER_CUES.iter().any(|c| window.contains(c)) {
        boost += 0.05;
        ContextCue::EmailHeader
    } else if DATABASE_CUES.iter().any(|c| window.contains(c)) {
        boost += 0.05;
        ContextCue::Database
    } else if DOCUMENT_CUES.iter().any(|c| window.contains(c)) {
        boost += 0.05;
        ContextCue::Document
    } else {
        ContextCue::None
    };

    ContextScore { boost, cue }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_clamps_to_char_boundaries() {
        let text = "가나다라마바사아자차카타파하".repeat(10);
        let span = Span::new(30, 33);
        let window = context_window(&text, &span, CONTEXT_RADIUS);
        assert!(!window.is_empty());
        // Slicing must not have panicked, and the window contains the span.
        assert!(window.len() >= 3);
    }

    #[test]
    fn kind_keyword_boosts() {
        let text = "연락처: 010-1234-5678 로 전화주세요";
        let idx = text.find("010").unwrap();
        let span = Span::new(idx, idx + 13);
        let score = score_context(text, &span, "phone");
        assert!(score.boost >= 0.2);
        assert_eq!(score.cue, ContextCue::FormField);
    }

    #[test]
    fn unrelated_window_gives_no_boost() {
        let text = "the quick brown fox 12345 jumps";
        let idx = text.find("12345").unwrap();
        let span = Span::new(idx, idx + 5);
        let score = score_context(text, &span, "ssn");
        assert_eq!(score.boost, 0.0);
        assert_eq!(score.cue, ContextCue::None);
    }

    #[test]
    fn document_cue_detected() {
        let text = "계약서에 기재된 번호 800101-1234567 입니다";
        let idx = text.find("800101").unwrap();
        let span = Span::new(idx, idx + 14);
        let score = score_context(text, &span, "ssn");
        assert_eq!(score.cue, ContextCue::Document);
        assert!(score.boost > 0.0);
    }
}
