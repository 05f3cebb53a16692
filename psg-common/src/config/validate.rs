//! Configuration consistency validation.
//!
//! Runs after parsing and reports warnings for combinations that parse fine
//! but cannot work at runtime. Warnings are logged at startup; none are fatal
//! because every affected feature degrades to a safe default.

use super::GatewayConfig;

/// Warning severity, for log-level selection at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Info,
    Warning,
}

/// One validation warning.
#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub severity: WarningSeverity,
    pub message: String,
}

impl ConfigWarning {
    fn warn(message: impl Into<String>) -> Self {
        Self {
            severity: WarningSeverity::Warning,
            message: message.into(),
        }
    }

    fn info(message: impl Into<String>) -> Self {
        Self {
            severity: WarningSeverity::Info,
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if config.enable_remote_evaluator && config.evaluator_url.is_none() {
        warnings.push(ConfigWarning::warn(
            "PSG_ENABLE_REMOTE_EVALUATOR is set but PSG_EVALUATOR_URL is empty; \
             evaluation will run locally",
        ));
    }
    if config.enable_similarity {
        if config.vector_index_url.is_none() {
            warnings.push(ConfigWarning::warn(
                "PSG_ENABLE_SIMILARITY is set but PSG_VECTOR_INDEX_URL is empty; \
                 similarity detection disabled",
            ));
        }
        if config.embedding_url.is_none() {
            warnings.push(ConfigWarning::warn(
                "PSG_ENABLE_SIMILARITY is set but PSG_EMBEDDING_URL is empty; \
                 similarity detection disabled",
            ));
        }
    }
    if config.enable_log_shipping && config.log_index_url.is_none() {
        warnings.push(ConfigWarning::warn(
            "PSG_ENABLE_LOG_SHIPPING is set but PSG_LOG_INDEX_URL is empty; \
             decisions will only be persisted locally",
        ));
    }
    if config.request_deadline < config.timeouts.evaluator {
        warnings.push(ConfigWarning::info(
            "PSG_REQUEST_DEADLINE is shorter than the remote evaluator timeout; \
             the evaluator will be cut off by the request deadline",
        ));
    }
    for lang in &config.allowed_languages {
        if lang != "ko" && lang != "en" {
            warnings.push(ConfigWarning::warn(format!(
                "PSG_ALLOWED_LANGUAGES contains '{}' which the language heuristic \
                 never reports (known: ko, en)",
                lang
            )));
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_clean() {
        assert!(validate_config(&GatewayConfig::default()).is_empty());
    }

    #[test]
    fn remote_evaluator_without_url_warns() {
        let config = GatewayConfig {
            enable_remote_evaluator: true,
            ..GatewayConfig::default()
        };
        let warnings = validate_config(&config);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("PSG_EVALUATOR_URL"));
    }

    #[test]
    fn unknown_language_warns() {
        let config = GatewayConfig {
            allowed_languages: vec!["ko".into(), "fr".into()],
            ..GatewayConfig::default()
        };
        let warnings = validate_config(&config);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("'fr'"));
    }
}
