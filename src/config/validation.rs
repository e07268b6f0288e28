//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`GatewayConfig`] that cannot
//! be expressed through the type system alone (range checks, URL shapes,
//! rule table consistency).
//!
//! ## Guarantees
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - Checking credentials (that belongs to `env_health`)

use url::Url;

use super::GatewayConfig;
use crate::routing::rules::check_rules;
use crate::routing::ProviderId;

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "routing.rules[0].keywords").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// The process environment failed its startup health check.
    #[error("ENV health check failed: {0}")]
    Environment(String),

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// Fold a list of violations into a single [`ConfigError::Validation`].
    pub fn from_violations(errors: &[ConfigError]) -> Self {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}

/// Validate all semantic constraints on a [`GatewayConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
pub fn validate(config: &GatewayConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Server ───────────────────────────────────────────────────────
    if config.server.port == 0 {
        errors.push(invalid("server.port", "0", "must be between 1 and 65535"));
    }
    if config.server.host.trim().is_empty() {
        errors.push(invalid("server.host", "", "must not be empty"));
    }
    if config.server.max_request_size == 0 {
        errors.push(invalid("server.max_request_size", "0", "must be at least 1 byte"));
    }

    // ── Routing ──────────────────────────────────────────────────────
    errors.extend(check_rules(&config.routing));

    let mut referenced: Vec<ProviderId> = config.routing.rules.iter().map(|r| r.provider).collect();
    referenced.push(config.routing.default_provider);
    if referenced.contains(&ProviderId::Echo) && !config.providers.echo.enabled {
        errors.push(invalid(
            "providers.echo.enabled",
            "false",
            "the echo provider is referenced by routing but not enabled",
        ));
    }

    for (provider, model) in &config.routing.models {
        if model.trim().is_empty() {
            errors.push(invalid(
                &format!("routing.models.{provider}"),
                "",
                "model name must not be empty",
            ));
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────
    if config.dispatch.timeout_ms == 0 {
        errors.push(invalid("dispatch.timeout_ms", "0", "must be at least 1ms"));
    }

    // ── Provider endpoints ───────────────────────────────────────────
    for (field, url) in [
        ("providers.gemini.base_url", config.providers.gemini.base_url.as_deref()),
        ("providers.groq.base_url", config.providers.groq.base_url.as_deref()),
        ("providers.hf.base_url", config.providers.hf.base_url.as_deref()),
        (
            "providers.pollinations.text_url",
            Some(config.providers.pollinations.text_url.as_str()),
        ),
        (
            "providers.pollinations.image_url",
            Some(config.providers.pollinations.image_url.as_str()),
        ),
        ("search.base_url", Some(config.search.base_url.as_str())),
    ] {
        if let Some(url) = url {
            if !is_valid_http_url(url) {
                errors.push(invalid(field, url, "must be an absolute http(s) URL"));
            }
        }
    }

    for (field, timeout) in [
        ("providers.gemini.timeout_s", config.providers.gemini.timeout_s),
        ("providers.groq.timeout_s", config.providers.groq.timeout_s),
        ("providers.hf.timeout_s", config.providers.hf.timeout_s),
        ("providers.pollinations.timeout_s", Some(config.providers.pollinations.timeout_s)),
        ("search.timeout_s", Some(config.search.timeout_s)),
    ] {
        if timeout == Some(0) {
            errors.push(invalid(field, "0", "must be at least 1 second"));
        }
    }

    // ── Store ────────────────────────────────────────────────────────
    if let Some(url) = &config.store.url {
        if !is_valid_redis_url(url) {
            errors.push(invalid("store.url", url, "must be a redis:// or rediss:// URL"));
        }
    }
    if config.store.session_ttl_s == Some(0) {
        errors.push(invalid("store.session_ttl_s", "0", "must be at least 1 second"));
    }

    // ── Health ───────────────────────────────────────────────────────
    if config.health.probe_interval_s == 0 {
        errors.push(invalid("health.probe_interval_s", "0", "must be at least 1 second"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// `true` when `value` is an absolute `http`/`https` URL with a host.
pub fn is_valid_http_url(value: &str) -> bool {
    Url::parse(value)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}

/// `true` when `value` is a `redis*` URL with a host.
pub fn is_valid_redis_url(value: &str) -> bool {
    Url::parse(value)
        .map(|u| u.scheme().starts_with("redis") && u.host_str().is_some())
        .unwrap_or(false)
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> GatewayConfig {
        toml::from_str(
            r#"
[routing]
default_provider = "gemini"

[[routing.rules]]
keywords = ["image", "picture"]
provider = "pollinations"
model = "image-v1"
priority = 1

[[routing.rules]]
keywords = ["code"]
provider = "groq"
model = "code-v1"
priority = 2
"#,
        )
        .expect("test: base config parses")
    }

    fn field_names(errors: &[ConfigError]) -> Vec<String> {
        errors
            .iter()
            .filter_map(|e| match e {
                ConfigError::InvalidField { field, .. } => Some(field.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(validate(&base()).is_ok());
    }

    #[test]
    fn test_zero_port_is_rejected() {
        let mut config = base();
        config.server.port = 0;
        let errors = validate(&config).unwrap_err();
        assert!(field_names(&errors).contains(&"server.port".to_string()));
    }

    #[test]
    fn test_empty_keywords_are_rejected() {
        let mut config = base();
        config.routing.rules[0].keywords.clear();
        let errors = validate(&config).unwrap_err();
        assert!(field_names(&errors)
            .iter()
            .any(|f| f == "routing.rules[0].keywords"));
    }

    #[test]
    fn test_echo_referenced_but_disabled_is_rejected() {
        let mut config = base();
        config.routing.default_provider = ProviderId::Echo;
        let errors = validate(&config).unwrap_err();
        assert!(field_names(&errors).contains(&"providers.echo.enabled".to_string()));

        config.providers.echo.enabled = true;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_bad_urls_are_rejected() {
        let mut config = base();
        config.providers.pollinations.text_url = "not a url".into();
        config.providers.groq.base_url = Some("ftp://groq.example".into());
        config.store.url = Some("http://localhost:6379".into());
        let names = field_names(&validate(&config).unwrap_err());
        assert!(names.contains(&"providers.pollinations.text_url".to_string()));
        assert!(names.contains(&"providers.groq.base_url".to_string()));
        assert!(names.contains(&"store.url".to_string()));
    }

    #[test]
    fn test_all_errors_are_collected() {
        let mut config = base();
        config.server.port = 0;
        config.dispatch.timeout_ms = 0;
        config.health.probe_interval_s = 0;
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_zero_timeouts_are_rejected() {
        let mut config = base();
        config.providers.hf.timeout_s = Some(0);
        config.store.session_ttl_s = Some(0);
        let names = field_names(&validate(&config).unwrap_err());
        assert!(names.contains(&"providers.hf.timeout_s".to_string()));
        assert!(names.contains(&"store.session_ttl_s".to_string()));
    }

    #[test]
    fn test_url_helpers() {
        assert!(is_valid_http_url("https://text.pollinations.ai/"));
        assert!(!is_valid_http_url("text.pollinations.ai"));
        assert!(is_valid_redis_url("redis://localhost:6379"));
        assert!(is_valid_redis_url("rediss://user:pw@cache:6380/0"));
        assert!(!is_valid_redis_url("redis-no-host"));
    }

    #[test]
    fn test_from_violations_joins_messages() {
        let err = ConfigError::from_violations(&[
            invalid("a", "1", "bad"),
            invalid("b", "2", "worse"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("'a'"));
        assert!(msg.contains("'b'"));
    }
}
