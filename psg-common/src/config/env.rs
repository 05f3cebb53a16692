//! Typed access to `PSG_` environment variables.
//!
//! One parser instance reads the whole configuration surface: each getter
//! consumes a single variable, falling back to its default when unset and
//! recording a typed error when set to something unusable. Nothing aborts
//! mid-parse — the caller gets every problem at once in the final
//! [`EnvReport`], together with the list of variables that actually came
//! from the environment (handy when debugging a misbehaving deployment).
//!
//! The getters cover exactly what the gateway config needs: strings, flags,
//! bounded integers, `[0, 1]` ratios for detector thresholds, humantime
//! durations, `~`-expanded paths, comma lists, and optional values for
//! endpoint URLs and credentials.

use std::env;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A variable that was set but could not be used.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("{var}: expected {expected}, found '{value}'")]
    Parse {
        var: String,
        expected: &'static str,
        value: String,
    },

    #[error("{var}: {value} is outside {min}..={max}")]
    Range {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("{var}: unrecognized duration '{value}' (try '300s', '5m', or a bare number of seconds)")]
    Duration { var: String, value: String },
}

/// Everything the parser learned: accumulated errors plus which variables
/// were explicitly set.
#[derive(Debug, Default)]
pub struct EnvReport {
    pub errors: Vec<EnvError>,
    /// Fully-prefixed names of variables found in the environment.
    pub overrides: Vec<String>,
}

/// Accumulating parser over the `PSG_` namespace.
pub struct EnvParser {
    prefix: &'static str,
    report: EnvReport,
}

impl EnvParser {
    pub fn new() -> Self {
        Self {
            prefix: "PSG_",
            report: EnvReport::default(),
        }
    }

    /// True once any getter has recorded an error.
    pub fn has_errors(&self) -> bool {
        !self.report.errors.is_empty()
    }

    /// Consume the parser, yielding errors and overrides.
    pub fn finish(self) -> EnvReport {
        self.report
    }

    /// Read one variable, remembering that it was set.
    fn var(&mut self, name: &str) -> (String, Option<String>) {
        let key = format!("{}{}", self.prefix, name);
        match env::var(&key) {
            Ok(value) => {
                self.report.overrides.push(key.clone());
                (key, Some(value))
            }
            Err(_) => (key, None),
        }
    }

    fn parse_error(&mut self, var: String, expected: &'static str, value: String) {
        self.report.errors.push(EnvError::Parse {
            var,
            expected,
            value,
        });
    }

    /// Plain string with a default.
    pub fn string(&mut self, name: &str, default: &str) -> String {
        self.var(name).1.unwrap_or_else(|| default.to_string())
    }

    /// Optional value: unset and empty both mean "not configured". Used for
    /// endpoint URLs, credentials, and optional file paths.
    pub fn optional(&mut self, name: &str) -> Option<String> {
        self.var(name).1.filter(|v| !v.is_empty())
    }

    /// Boolean toggle. `1`/`true`/`yes`/`on` enable; `0`/`false`/`no`/`off`
    /// and the empty string disable; anything else is an error and the
    /// default stands.
    pub fn flag(&mut self, name: &str, default: bool) -> bool {
        let (key, raw) = self.var(name);
        let Some(raw) = raw else { return default };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "" | "0" | "false" | "no" | "off" => false,
            _ => {
                self.parse_error(key, "a boolean toggle (true/false/1/0/yes/no/on/off)", raw);
                default
            }
        }
    }

    /// Unsigned integer constrained to `range`. Out-of-range values keep the
    /// default rather than being clamped, so a typo cannot silently become a
    /// surprising limit.
    pub fn integer(&mut self, name: &str, default: u64, range: RangeInclusive<u64>) -> u64 {
        let (key, raw) = self.var(name);
        let Some(raw) = raw else { return default };
        match raw.parse::<u64>() {
            Ok(n) if range.contains(&n) => n,
            Ok(n) => {
                self.report.errors.push(EnvError::Range {
                    var: key,
                    value: n.to_string(),
                    min: range.start().to_string(),
                    max: range.end().to_string(),
                });
                default
            }
            Err(_) => {
                self.parse_error(key, "an unsigned integer", raw);
                default
            }
        }
    }

    /// A score or threshold in `[0, 1]` — the only floats the gateway
    /// configures.
    pub fn ratio(&mut self, name: &str, default: f64) -> f64 {
        let (key, raw) = self.var(name);
        let Some(raw) = raw else { return default };
        match raw.parse::<f64>() {
            Ok(n) if (0.0..=1.0).contains(&n) => n,
            Ok(n) => {
                self.report.errors.push(EnvError::Range {
                    var: key,
                    value: n.to_string(),
                    min: "0".to_string(),
                    max: "1".to_string(),
                });
                default
            }
            Err(_) => {
                self.parse_error(key, "a ratio between 0 and 1", raw);
                default
            }
        }
    }

    /// Duration in humantime form (`300s`, `5m`, `1h 30m`) or a bare number
    /// of seconds.
    pub fn duration(&mut self, name: &str, default: Duration) -> Duration {
        let (key, raw) = self.var(name);
        let Some(raw) = raw else { return default };
        if let Ok(secs) = raw.parse::<u64>() {
            return Duration::from_secs(secs);
        }
        match humantime::parse_duration(&raw) {
            Ok(d) => d,
            Err(_) => {
                self.report
                    .errors
                    .push(EnvError::Duration { var: key, value: raw });
                default
            }
        }
    }

    /// Filesystem path with `~/` expanded to the home directory.
    pub fn path(&mut self, name: &str, default: &str) -> PathBuf {
        let raw = self.string(name, default);
        match raw.strip_prefix("~/").and_then(|rest| {
            dirs::home_dir().map(|home| home.join(rest))
        }) {
            Some(expanded) => expanded,
            None => PathBuf::from(raw),
        }
    }

    /// Comma-separated list; items are trimmed and empties dropped, so
    /// `"ko, en ,"` parses the way people type it. Unset means empty.
    pub fn list(&mut self, name: &str) -> Vec<String> {
        let Some(raw) = self.var(name).1 else {
            return Vec::new();
        };
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;
    use std::env;

    fn with_var<T>(key: &str, value: Option<&str>, body: impl FnOnce() -> T) -> T {
        let _guard = env_test_lock();
        // SAFETY: the lock above serializes all env mutation across tests
        unsafe {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
        let out = body();
        // SAFETY: as above
        unsafe { env::remove_var(key) };
        out
    }

    #[test]
    fn unset_variables_fall_back_and_leave_no_trace() {
        with_var("PSG_ABSENT", None, || {
            let mut parser = EnvParser::new();
            assert_eq!(parser.string("ABSENT", "fallback"), "fallback");
            assert!(parser.flag("ABSENT", true));
            let report = parser.finish();
            assert!(report.errors.is_empty());
            assert!(report.overrides.is_empty());
        });
    }

    #[test]
    fn set_variables_are_reported_as_overrides() {
        with_var("PSG_LISTEN_ADDR", Some("0.0.0.0:9999"), || {
            let mut parser = EnvParser::new();
            assert_eq!(parser.string("LISTEN_ADDR", "x"), "0.0.0.0:9999");
            let report = parser.finish();
            assert_eq!(report.overrides, vec!["PSG_LISTEN_ADDR".to_string()]);
        });
    }

    #[test]
    fn flag_accepts_the_usual_spellings() {
        for (raw, expected) in [("on", true), ("YES", true), ("0", false), ("off", false)] {
            with_var("PSG_TOGGLE", Some(raw), || {
                let mut parser = EnvParser::new();
                assert_eq!(parser.flag("TOGGLE", !expected), expected, "for '{}'", raw);
                assert!(!parser.has_errors());
            });
        }
    }

    #[test]
    fn garbage_flag_keeps_default_and_errs() {
        with_var("PSG_TOGGLE", Some("maybe"), || {
            let mut parser = EnvParser::new();
            assert!(parser.flag("TOGGLE", true));
            assert!(parser.has_errors());
        });
    }

    #[test]
    fn integer_rejects_out_of_range_without_clamping() {
        with_var("PSG_TIMEOUT_PATTERN_MS", Some("999999"), || {
            let mut parser = EnvParser::new();
            assert_eq!(parser.integer("TIMEOUT_PATTERN_MS", 50, 1..=60_000), 50);
            let report = parser.finish();
            assert!(matches!(report.errors.as_slice(), [EnvError::Range { .. }]));
        });
    }

    #[test]
    fn ratio_is_bounded_to_the_unit_interval() {
        with_var("PSG_SIMILARITY_THRESHOLD", Some("0.9"), || {
            let mut parser = EnvParser::new();
            assert_eq!(parser.ratio("SIMILARITY_THRESHOLD", 0.75), 0.9);
        });
        with_var("PSG_SIMILARITY_THRESHOLD", Some("1.5"), || {
            let mut parser = EnvParser::new();
            assert_eq!(parser.ratio("SIMILARITY_THRESHOLD", 0.75), 0.75);
            assert!(parser.has_errors());
        });
    }

    #[test]
    fn duration_takes_humantime_or_bare_seconds() {
        with_var("PSG_CACHE_TTL", Some("5m"), || {
            let mut parser = EnvParser::new();
            assert_eq!(
                parser.duration("CACHE_TTL", Duration::from_secs(1)),
                Duration::from_secs(300)
            );
        });
        with_var("PSG_CACHE_TTL", Some("42"), || {
            let mut parser = EnvParser::new();
            assert_eq!(
                parser.duration("CACHE_TTL", Duration::from_secs(1)),
                Duration::from_secs(42)
            );
        });
        with_var("PSG_CACHE_TTL", Some("soon"), || {
            let mut parser = EnvParser::new();
            assert_eq!(
                parser.duration("CACHE_TTL", Duration::from_secs(7)),
                Duration::from_secs(7)
            );
            assert!(parser.has_errors());
        });
    }

    #[test]
    fn list_trims_and_drops_empties() {
        with_var("PSG_ALLOWED_LANGUAGES", Some("ko, en ,"), || {
            let mut parser = EnvParser::new();
            assert_eq!(parser.list("ALLOWED_LANGUAGES"), vec!["ko", "en"]);
        });
        with_var("PSG_ALLOWED_LANGUAGES", None, || {
            let mut parser = EnvParser::new();
            assert!(parser.list("ALLOWED_LANGUAGES").is_empty());
        });
    }

    #[test]
    fn optional_treats_empty_as_unset() {
        with_var("PSG_EVALUATOR_URL", Some(""), || {
            let mut parser = EnvParser::new();
            assert!(parser.optional("EVALUATOR_URL").is_none());
        });
        with_var("PSG_EVALUATOR_URL", Some("http://opa:8181"), || {
            let mut parser = EnvParser::new();
            assert_eq!(parser.optional("EVALUATOR_URL").as_deref(), Some("http://opa:8181"));
        });
    }

    #[test]
    fn tilde_paths_expand_to_home() {
        with_var("PSG_DB_PATH", Some("~/psg/policy.db"), || {
            let mut parser = EnvParser::new();
            let path = parser.path("DB_PATH", "psg.db");
            if let Some(home) = dirs::home_dir() {
                assert_eq!(path, home.join("psg/policy.db"));
            }
        });
        with_var("PSG_DB_PATH", None, || {
            let mut parser = EnvParser::new();
            assert_eq!(parser.path("DB_PATH", "psg.db"), PathBuf::from("psg.db"));
        });
    }
}
