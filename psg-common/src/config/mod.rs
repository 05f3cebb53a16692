//! Configuration system for the gateway.
//!
//! Environment-driven: every knob is a `PSG_`-prefixed variable read through
//! [`EnvParser`], which accumulates typed errors so all problems surface in a
//! single startup failure and reports which variables were explicitly set.
//! `validate_config` runs a consistency pass after parsing and emits warnings
//! for toggles that cannot take effect (e.g. a remote evaluator enabled
//! without a URL).

pub mod env;
pub mod validate;

pub use env::{EnvError, EnvParser, EnvReport};
pub use validate::{ConfigWarning, WarningSeverity, validate_config};

use std::path::PathBuf;
use std::time::Duration;

/// Per-detector timeouts; all overridable via env.
#[derive(Debug, Clone)]
pub struct DetectorTimeouts {
    /// Pattern-family detectors: static, secret, pii, heuristic injection.
    pub pattern: Duration,
    /// Similarity detector (embedding + vector index round trip).
    pub similarity: Duration,
    /// Remote injection model classifier.
    pub model: Duration,
    /// ML classifier.
    pub ml: Duration,
    /// Remote policy evaluator.
    pub evaluator: Duration,
}

impl Default for DetectorTimeouts {
    fn default() -> Self {
        Self {
            pattern: Duration::from_millis(50),
            similarity: Duration::from_millis(300),
            model: Duration::from_millis(2_000),
            ml: Duration::from_millis(500),
            evaluator: Duration::from_millis(5_000),
        }
    }
}

/// Injection sub-check score thresholds.
#[derive(Debug, Clone)]
pub struct InjectionThresholds {
    pub heuristic: f64,
    pub similarity: f64,
    pub model: f64,
}

impl Default for InjectionThresholds {
    fn default() -> Self {
        Self {
            heuristic: 0.75,
            similarity: 0.90,
            model: 0.90,
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// HTTP listen address.
    pub listen_addr: String,
    /// SQLite rule-store path.
    pub db_path: PathBuf,
    /// Log output format: `text` or `json`.
    pub log_format: String,
    /// External log index base URL (None disables shipping regardless of toggle).
    pub log_index_url: Option<String>,
    pub log_index_api_key: Option<String>,
    /// Vector index base URL for the similarity detector.
    pub vector_index_url: Option<String>,
    /// Remote policy evaluator base URL.
    pub evaluator_url: Option<String>,
    /// Embedding back-end base URL.
    pub embedding_url: Option<String>,
    /// Remote injection model base URL.
    pub model_url: Option<String>,

    // Feature toggles (documented defaults in from_env).
    pub enable_remote_evaluator: bool,
    pub enable_similarity: bool,
    pub enable_ml: bool,
    pub enable_log_shipping: bool,
    /// Treat remote-evaluator unavailability as BLOCK instead of local fallback.
    pub evaluator_fail_closed: bool,

    pub timeouts: DetectorTimeouts,
    pub injection: InjectionThresholds,
    /// Cosine similarity threshold for the similarity detector.
    pub similarity_threshold: f64,
    /// Tenant cache TTL.
    pub cache_ttl: Duration,
    /// Request-wide deadline; expiry collapses the decision to BLOCK.
    pub request_deadline: Duration,
    /// Gateway-wide prompt length ceiling (bundles may lower it).
    pub max_prompt_length: usize,
    /// Gateway-wide allowed languages (empty = all; bundles may narrow it).
    pub allowed_languages: Vec<String>,
    /// Optional TOML file supplying PII patterns (precedence: DB > TOML > built-in).
    pub pii_patterns_file: Option<PathBuf>,
    /// Audit shipper queue capacity.
    pub shipper_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8089".to_string(),
            db_path: PathBuf::from("psg.db"),
            log_format: "text".to_string(),
            log_index_url: None,
            log_index_api_key: None,
            vector_index_url: None,
            evaluator_url: None,
            embedding_url: None,
            model_url: None,
            enable_remote_evaluator: false,
            enable_similarity: false,
            enable_ml: true,
            enable_log_shipping: false,
            evaluator_fail_closed: false,
            timeouts: DetectorTimeouts::default(),
            injection: InjectionThresholds::default(),
            similarity_threshold: 0.75,
            cache_ttl: Duration::from_secs(300),
            request_deadline: Duration::from_secs(10),
            max_prompt_length: 10_000,
            allowed_languages: Vec::new(),
            pii_patterns_file: None,
            shipper_buffer: 256,
        }
    }
}

impl GatewayConfig {
    /// Parse the configuration from the environment. Callers decide whether
    /// the report's errors are fatal; the daemon refuses to start on any.
    pub fn from_env() -> (Self, EnvReport) {
        let mut p = EnvParser::new();
        let defaults = Self::default();

        let config = Self {
            listen_addr: p.string("LISTEN_ADDR", &defaults.listen_addr),
            db_path: p.path("DB_PATH", "psg.db"),
            log_format: match p.string("LOG_FORMAT", "text").as_str() {
                "json" => "json".to_string(),
                _ => "text".to_string(),
            },
            log_index_url: p.optional("LOG_INDEX_URL"),
            log_index_api_key: p.optional("LOG_INDEX_API_KEY"),
            vector_index_url: p.optional("VECTOR_INDEX_URL"),
            evaluator_url: p.optional("EVALUATOR_URL"),
            embedding_url: p.optional("EMBEDDING_URL"),
            model_url: p.optional("MODEL_URL"),
            enable_remote_evaluator: p.flag("ENABLE_REMOTE_EVALUATOR", false),
            enable_similarity: p.flag("ENABLE_SIMILARITY", false),
            enable_ml: p.flag("ENABLE_ML", true),
            enable_log_shipping: p.flag("ENABLE_LOG_SHIPPING", false),
            evaluator_fail_closed: p.flag("EVALUATOR_FAIL_CLOSED", false),
            timeouts: DetectorTimeouts {
                pattern: Duration::from_millis(p.integer("TIMEOUT_PATTERN_MS", 50, 1..=60_000)),
                similarity: Duration::from_millis(
                    p.integer("TIMEOUT_SIMILARITY_MS", 300, 1..=60_000),
                ),
                model: Duration::from_millis(p.integer("TIMEOUT_MODEL_MS", 2_000, 1..=120_000)),
                ml: Duration::from_millis(p.integer("TIMEOUT_ML_MS", 500, 1..=60_000)),
                evaluator: Duration::from_millis(
                    p.integer("TIMEOUT_EVALUATOR_MS", 5_000, 1..=120_000),
                ),
            },
            injection: InjectionThresholds {
                heuristic: p.ratio("INJECTION_HEURISTIC_THRESHOLD", 0.75),
                similarity: p.ratio("INJECTION_SIMILARITY_THRESHOLD", 0.90),
                model: p.ratio("INJECTION_MODEL_THRESHOLD", 0.90),
            },
            similarity_threshold: p.ratio("SIMILARITY_THRESHOLD", 0.75),
            cache_ttl: p.duration("CACHE_TTL", Duration::from_secs(300)),
            request_deadline: p.duration("REQUEST_DEADLINE", Duration::from_secs(10)),
            max_prompt_length: p.integer("MAX_PROMPT_LENGTH", 10_000, 1..=10_000_000) as usize,
            allowed_languages: p.list("ALLOWED_LANGUAGES"),
            pii_patterns_file: p.optional("PII_PATTERNS_FILE").map(PathBuf::from),
            shipper_buffer: p.integer("SHIPPER_BUFFER", 256, 1..=1_000_000) as usize,
        };

        (config, p.finish())
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap()
}
