//! Prompt normalization and the audit-log digest.
//!
//! The decision log stores a truncated SHA-256 of the *normalized* prompt so
//! that identical inputs are correlatable without ever persisting content.

use sha2::{Digest, Sha256};

/// Hex characters kept from the full SHA-256 digest.
const DIGEST_LEN: usize = 16;

/// Normalize a prompt before detection and digesting: unify line endings and
/// strip surrounding whitespace. Detector spans are byte offsets into this
/// normalized form.
pub fn normalize_prompt(raw: &str) -> String {
    raw.replace("\r\n", "\n").trim().to_string()
}

/// Truncated hex SHA-256 of the normalized input.
pub fn input_digest(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(DIGEST_LEN);
    for byte in digest.iter() {
        if out.len() >= DIGEST_LEN {
            break;
        }
        out.push_str(&format!("{:02x}", byte));
    }
    out.truncate(DIGEST_LEN);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_truncated() {
        let a = input_digest("hello world");
        let b = input_digest("hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn digest_differs_for_different_inputs() {
        assert_ne!(input_digest("hello"), input_digest("hello!"));
    }

    #[test]
    fn normalization_unifies_line_endings() {
        assert_eq!(normalize_prompt("  a\r\nb  "), "a\nb");
    }

    #[test]
    fn digest_sees_normalized_form() {
        assert_eq!(
            input_digest(&normalize_prompt("x\r\ny")),
            input_digest(&normalize_prompt("x\ny"))
        );
    }
}
