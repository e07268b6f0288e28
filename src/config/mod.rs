//! # Stage: Declarative Gateway Configuration
//!
//! ## Responsibility
//! Parse, validate, and hot-reload the gateway TOML document: server
//! binding, routing rules, provider endpoints, dispatch policy, session
//! store and health probing. Environment variables override selected
//! fields after parsing.
//!
//! ## Guarantees
//! - Deterministic: same TOML input and environment always produce the same
//!   `GatewayConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Type-safe: unknown provider identifiers are rejected at parse time via serde
//! - Hot-reloadable: file changes are detected and validated before the rule
//!   table is swapped
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Compiling rules into a routing table (that belongs to `routing`)
//! - Constructing provider clients (that belongs to `provider`)
//! - Reading credentials (those only ever come from the environment)

pub mod env_health;
pub mod loader;
pub mod validation;
pub mod watcher;

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::routing::ProviderId;
use validation::ConfigError;

// ── Default value functions ──────────────────────────────────────────────

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

/// Default maximum request body: 1 MiB.
fn default_max_request_size() -> usize {
    1024 * 1024
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

/// Default provider call timeout: 30s.
fn default_dispatch_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_pollinations_text_url() -> String {
    "https://text.pollinations.ai/".to_string()
}

fn default_pollinations_image_url() -> String {
    "https://image.pollinations.ai/prompt/".to_string()
}

/// Pollinations calls are cheap; fail fast.
fn default_pollinations_timeout_s() -> u64 {
    8
}

fn default_search_url() -> String {
    "https://api.duckduckgo.com/".to_string()
}

fn default_search_timeout_s() -> u64 {
    8
}

fn default_store_max_entries() -> usize {
    10_000
}

fn default_probe_interval_s() -> u64 {
    30
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a gateway process.
///
/// Deserialized from a TOML file, overlaid with environment overrides and
/// validated before use. Only `[routing]` is mandatory.
///
/// # Example
///
/// ```toml
/// environment = "development"
///
/// [routing]
/// default_provider = "gemini"
///
/// [[routing.rules]]
/// keywords = ["image", "picture"]
/// provider = "pollinations"
/// model = "flux"
/// priority = 1
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct GatewayConfig {
    /// Deployment environment. Production makes environment problems fatal.
    #[serde(default)]
    pub environment: Environment,
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// The rule table document.
    pub routing: RoutingConfig,
    /// Dispatch policy: fallback mode, timeouts, search context.
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Per-provider endpoint settings.
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// Search passthrough settings.
    #[serde(default)]
    pub search: SearchConfig,
    /// Session store settings.
    #[serde(default)]
    pub store: StoreConfig,
    /// Provider health probing.
    #[serde(default)]
    pub health: HealthConfig,
}

// ── Environment ──────────────────────────────────────────────────────────

/// Deployment environment name.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Local development: environment problems are warnings.
    #[default]
    Development,
    /// Production: missing credentials or invalid settings abort startup.
    Production,
    /// Test runs.
    Test,
}

impl Environment {
    /// Parse an environment name leniently; unknown names are development.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "test" => Self::Test,
            _ => Self::Development,
        }
    }

    /// Return the canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }

    /// `true` for [`Environment::Production`].
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Server ───────────────────────────────────────────────────────────────

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ServerConfig {
    /// IP address or hostname to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum accepted request body in bytes.
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    /// Allowed CORS origins. `["*"]` allows any origin.
    #[serde(default = "default_cors_origins")]
    pub cors_allow_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_request_size: default_max_request_size(),
            cors_allow_origins: default_cors_origins(),
        }
    }
}

impl ServerConfig {
    /// `host:port` bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── Routing document ─────────────────────────────────────────────────────

/// The rule table document.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RoutingConfig {
    /// Provider used when no candidate is available.
    pub default_provider: ProviderId,
    /// Default model per provider, used for overrides without a model and
    /// for the default provider.
    #[serde(default)]
    pub models: BTreeMap<ProviderId, String>,
    /// Routing rules in declaration order.
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

/// One routing clause as written in the document.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RuleDefinition {
    /// Whole-token keywords; matched case-insensitively.
    pub keywords: Vec<String>,
    /// Optional case-insensitive regular expression over the prompt text.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Target provider.
    pub provider: ProviderId,
    /// Target model at that provider.
    pub model: String,
    /// Lower value wins when several rules match.
    pub priority: i32,
}

// ── Dispatch ─────────────────────────────────────────────────────────────

/// What the dispatch facade does when the selected provider call fails.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Surface the provider error to the caller.
    #[default]
    Disabled,
    /// Try the next available candidate, then the default provider.
    NextCandidate,
}

/// Dispatch policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DispatchConfig {
    /// Behaviour after a provider failure.
    #[serde(default)]
    pub fallback: FallbackMode,
    /// Upper bound for a single provider call, in milliseconds.
    #[serde(default = "default_dispatch_timeout_ms")]
    pub timeout_ms: u64,
    /// Prepend search results to prompts containing search triggers.
    #[serde(default = "default_true")]
    pub search_context: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            fallback: FallbackMode::default(),
            timeout_ms: default_dispatch_timeout_ms(),
            search_context: true,
        }
    }
}

// ── Providers ────────────────────────────────────────────────────────────

/// Endpoint settings for every provider adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ProvidersConfig {
    /// Google Gemini.
    #[serde(default)]
    pub gemini: EndpointConfig,
    /// Groq (OpenAI-compatible chat completions).
    #[serde(default)]
    pub groq: EndpointConfig,
    /// Hugging Face Inference API.
    #[serde(default)]
    pub hf: EndpointConfig,
    /// Pollinations text and image endpoints.
    #[serde(default)]
    pub pollinations: PollinationsConfig,
    /// Local loopback provider.
    #[serde(default)]
    pub echo: EchoConfig,
}

/// Base URL and timeout override for an HTTP provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EndpointConfig {
    /// API base URL. `None` uses the provider's public endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Request timeout in seconds. `None` uses the adapter default.
    #[serde(default)]
    pub timeout_s: Option<u64>,
}

/// Pollinations endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PollinationsConfig {
    /// Text generation base URL; the encoded prompt is appended.
    #[serde(default = "default_pollinations_text_url")]
    pub text_url: String,
    /// Image base URL; the encoded prompt is appended.
    #[serde(default = "default_pollinations_image_url")]
    pub image_url: String,
    /// Text request timeout in seconds.
    #[serde(default = "default_pollinations_timeout_s")]
    pub timeout_s: u64,
}

impl Default for PollinationsConfig {
    fn default() -> Self {
        Self {
            text_url: default_pollinations_text_url(),
            image_url: default_pollinations_image_url(),
            timeout_s: default_pollinations_timeout_s(),
        }
    }
}

/// Loopback provider, useful for local development without credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EchoConfig {
    /// Register the echo provider.
    #[serde(default)]
    pub enabled: bool,
    /// Simulated latency in milliseconds.
    #[serde(default)]
    pub delay_ms: u64,
}

// ── Search ───────────────────────────────────────────────────────────────

/// Search passthrough settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SearchConfig {
    /// DuckDuckGo Instant Answer endpoint.
    #[serde(default = "default_search_url")]
    pub base_url: String,
    /// Request timeout in seconds.
    #[serde(default = "default_search_timeout_s")]
    pub timeout_s: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: default_search_url(),
            timeout_s: default_search_timeout_s(),
        }
    }
}

// ── Store ────────────────────────────────────────────────────────────────

/// Session store settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct StoreConfig {
    /// Record session transcripts at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// `redis://` connection string. `None` keeps sessions in memory.
    #[serde(default)]
    pub url: Option<String>,
    /// Transcript expiry in seconds. `None` keeps transcripts indefinitely.
    #[serde(default)]
    pub session_ttl_s: Option<u64>,
    /// Capacity of the in-memory store.
    #[serde(default = "default_store_max_entries")]
    pub max_entries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            session_ttl_s: None,
            max_entries: default_store_max_entries(),
        }
    }
}

// ── Health ───────────────────────────────────────────────────────────────

/// Provider health probing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct HealthConfig {
    /// Seconds between probe rounds.
    #[serde(default = "default_probe_interval_s")]
    pub probe_interval_s: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_s: default_probe_interval_s(),
        }
    }
}

// ── Environment overrides ────────────────────────────────────────────────

impl GatewayConfig {
    /// Overlay environment variables onto the parsed document.
    ///
    /// `lookup` returns the value of a variable, or `None` when unset. Empty
    /// values are treated as unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] when a numeric variable cannot be
    /// parsed.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(env) = get("ENV") {
            self.environment = Environment::parse(&env);
        }
        if let Some(host) = get("HOST") {
            self.server.host = host;
        }
        if let Some(port) = get("PORT") {
            self.server.port = parse_env_number("PORT", &port)?;
        }
        if let Some(origins) = get("CORS_ALLOW_ORIGINS") {
            self.server.cors_allow_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }

        for (var, provider) in [
            ("GEMINI_MODEL", ProviderId::Gemini),
            ("GROQ_MODEL", ProviderId::Groq),
            ("HF_MODEL", ProviderId::HuggingFace),
        ] {
            if let Some(model) = get(var) {
                self.routing.models.insert(provider, model);
            }
        }
        if let Some(timeout) = get("HF_TIMEOUT") {
            self.providers.hf.timeout_s = Some(parse_env_number("HF_TIMEOUT", &timeout)?);
        }

        if let Some(url) = get("POLLINATIONS_TEXT_URL") {
            self.providers.pollinations.text_url = url;
        }
        if let Some(url) = get("POLLINATIONS_IMAGE_URL") {
            self.providers.pollinations.image_url = url;
        }

        if let Some(url) = get("REDIS_URL") {
            self.store.url = Some(url);
        }
        if let Some(ttl) = get("SESSION_TTL_SECONDS") {
            self.store.session_ttl_s = Some(parse_env_number("SESSION_TTL_SECONDS", &ttl)?);
        }

        Ok(())
    }
}

fn parse_env_number<T: std::str::FromStr>(var: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidField {
        field: var.to_string(),
        value: raw.to_string(),
        reason: "must be a non-negative integer in range".into(),
    })
}

/// Export the JSON Schema for `GatewayConfig`.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(GatewayConfig);
    serde_json::to_string_pretty(&schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL_TOML: &str = r#"
[routing]
default_provider = "gemini"
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_minimal_toml_applies_defaults() {
        let config: GatewayConfig = toml::from_str(MINIMAL_TOML).expect("test: parse");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.cors_allow_origins, vec!["*"]);
        assert_eq!(config.dispatch.fallback, FallbackMode::Disabled);
        assert_eq!(config.dispatch.timeout_ms, 30_000);
        assert!(config.dispatch.search_context);
        assert!(config.routing.rules.is_empty());
        assert!(config.store.enabled);
        assert!(config.store.url.is_none());
        assert_eq!(config.health.probe_interval_s, 30);
        assert_eq!(config.providers.pollinations.timeout_s, 8);
        assert!(!config.providers.echo.enabled);
    }

    #[test]
    fn test_full_toml_parses_rules_and_models() {
        let toml_str = r#"
environment = "production"

[server]
host = "127.0.0.1"
port = 9000

[routing]
default_provider = "groq"

[routing.models]
groq = "llama-3.3-70b-versatile"
hf = "HuggingFaceH4/zephyr-7b-beta"

[[routing.rules]]
keywords = ["image", "picture"]
provider = "pollinations"
model = "image-v1"
priority = 1

[[routing.rules]]
keywords = ["code"]
pattern = "def |fn "
provider = "groq"
model = "code-v1"
priority = 2

[dispatch]
fallback = "next_candidate"
timeout_ms = 5000
search_context = false

[providers.hf]
timeout_s = 45

[store]
url = "redis://localhost:6379"
session_ttl_s = 3600
"#;
        let config: GatewayConfig = toml::from_str(toml_str).expect("test: parse");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.server.bind_addr(), "127.0.0.1:9000");
        assert_eq!(config.routing.default_provider, ProviderId::Groq);
        assert_eq!(
            config.routing.models.get(&ProviderId::HuggingFace).map(String::as_str),
            Some("HuggingFaceH4/zephyr-7b-beta")
        );
        assert_eq!(config.routing.rules.len(), 2);
        assert_eq!(config.routing.rules[1].pattern.as_deref(), Some("def |fn "));
        assert_eq!(config.dispatch.fallback, FallbackMode::NextCandidate);
        assert!(!config.dispatch.search_context);
        assert_eq!(config.providers.hf.timeout_s, Some(45));
        assert_eq!(config.store.session_ttl_s, Some(3600));
    }

    #[test]
    fn test_unknown_provider_in_rule_fails_to_parse() {
        let toml_str = r#"
[routing]
default_provider = "gemini"

[[routing.rules]]
keywords = ["x"]
provider = "openai"
model = "gpt"
priority = 1
"#;
        assert!(toml::from_str::<GatewayConfig>(toml_str).is_err());
    }

    #[test]
    fn test_environment_parse_is_lenient() {
        assert_eq!(Environment::parse("PRODUCTION"), Environment::Production);
        assert_eq!(Environment::parse("prod"), Environment::Production);
        assert_eq!(Environment::parse("test"), Environment::Test);
        assert_eq!(Environment::parse("staging"), Environment::Development);
        assert!(Environment::Production.is_production());
    }

    #[test]
    fn test_env_overrides_replace_document_values() {
        let mut config: GatewayConfig = toml::from_str(MINIMAL_TOML).expect("test: parse");
        config
            .apply_env_overrides(env(&[
                ("ENV", "production"),
                ("HOST", "127.0.0.1"),
                ("PORT", "9100"),
                ("GROQ_MODEL", "mixtral"),
                ("HF_TIMEOUT", "12"),
                ("REDIS_URL", "redis://cache:6379"),
                ("SESSION_TTL_SECONDS", "60"),
                ("CORS_ALLOW_ORIGINS", "https://a.example, https://b.example"),
            ]))
            .expect("test: overrides apply");

        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.server.bind_addr(), "127.0.0.1:9100");
        assert_eq!(
            config.routing.models.get(&ProviderId::Groq).map(String::as_str),
            Some("mixtral")
        );
        assert_eq!(config.providers.hf.timeout_s, Some(12));
        assert_eq!(config.store.url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.store.session_ttl_s, Some(60));
        assert_eq!(
            config.server.cors_allow_origins,
            vec!["https://a.example", "https://b.example"]
        );
    }

    #[test]
    fn test_env_override_bad_port_is_invalid_field() {
        let mut config: GatewayConfig = toml::from_str(MINIMAL_TOML).expect("test: parse");
        let err = config
            .apply_env_overrides(env(&[("PORT", "99999")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidField { ref field, .. } if field == "PORT"));
    }

    #[test]
    fn test_env_override_empty_values_are_ignored() {
        let mut config: GatewayConfig = toml::from_str(MINIMAL_TOML).expect("test: parse");
        config
            .apply_env_overrides(env(&[("PORT", ""), ("HOST", "  ")]))
            .expect("test: overrides apply");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn test_fallback_mode_serializes_to_snake_case() {
        let json = serde_json::to_string(&FallbackMode::NextCandidate).expect("test: ser");
        assert_eq!(json, "\"next_candidate\"");
    }

    #[test]
    fn test_export_schema_produces_valid_json() {
        let schema = export_schema().expect("test: schema export");
        let parsed: serde_json::Value =
            serde_json::from_str(&schema).expect("test: schema is valid JSON");
        assert!(parsed.get("properties").is_some() || parsed.get("$ref").is_some());
    }
}
