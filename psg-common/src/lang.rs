//! Language detection for tenant guards.
//!
//! A simple character-ratio heuristic: the guard only needs to tell Korean
//! from English reliably enough to enforce `allowed_languages`.

/// Hangul-syllable ratio above which text counts as Korean.
const KOREAN_RATIO: f64 = 0.3;

/// Detect the dominant language of a prompt. Returns `"ko"`, `"en"`, or
/// `"unknown"` when the text carries no alphabetic signal.
pub fn detect_language(text: &str) -> &'static str {
    let mut korean = 0usize;
    let mut alphabetic = 0usize;

    for c in text.chars() {
        let is_hangul = ('\u{ac00}'..='\u{d7af}').contains(&c);
        if is_hangul {
            korean += 1;
            alphabetic += 1;
        } else if c.is_alphabetic() {
            alphabetic += 1;
        }
    }

    if alphabetic == 0 {
        return "unknown";
    }
    if korean as f64 / alphabetic as f64 > KOREAN_RATIO {
        "ko"
    } else {
        "en"
    }
}
