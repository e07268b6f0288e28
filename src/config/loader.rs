//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into a [`GatewayConfig`], overlay
//! environment overrides and run validation before returning. This is the
//! primary entry point for loading gateway configuration at startup and on
//! reload.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message
//!
//! ## NOT Responsible For
//! - Hot-reloading on file changes (that belongs to `watcher`)
//! - Defining the config schema (that belongs to `mod.rs`)

use std::path::Path;

use super::validation::{self, ConfigError};
use super::GatewayConfig;

/// Environment lookup backed by the process environment.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Environment lookup that never finds anything.
pub fn no_env(_key: &str) -> Option<String> {
    None
}

/// Load a [`GatewayConfig`] from a TOML file without environment overrides.
///
/// # Returns
///
/// - `Err(ConfigError::Io)` if the file cannot be read.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
///
/// # Example
///
/// ```rust,ignore
/// use prompt_gateway::config::loader::load_from_file;
/// use std::path::Path;
///
/// let config = load_from_file(Path::new("gateway.toml"))?;
/// println!("default provider: {}", config.routing.default_provider);
/// ```
pub fn load_from_file(path: &Path) -> Result<GatewayConfig, ConfigError> {
    load_from_file_with_env(path, no_env)
}

/// Load a [`GatewayConfig`] from a TOML file, applying environment overrides
/// from `lookup` before validation.
pub fn load_from_file_with_env<F>(path: &Path, lookup: F) -> Result<GatewayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str_with_env(&content, &path.display().to_string(), lookup)
}

/// Load a [`GatewayConfig`] from a TOML string.
///
/// `source_name` identifies the source in error messages.
pub fn load_from_str(content: &str, source_name: &str) -> Result<GatewayConfig, ConfigError> {
    load_from_str_with_env(content, source_name, no_env)
}

/// Load a [`GatewayConfig`] from a TOML string with environment overrides.
pub fn load_from_str_with_env<F>(
    content: &str,
    source_name: &str,
    lookup: F,
) -> Result<GatewayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config: GatewayConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    config.apply_env_overrides(lookup)?;

    validation::validate(&config).map_err(|errors| ConfigError::from_violations(&errors))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::ProviderId;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[server]
port = 8000

[routing]
default_provider = "gemini"

[[routing.rules]]
keywords = ["image", "picture"]
provider = "pollinations"
model = "image-v1"
priority = 1
"#;

    #[test]
    fn test_load_from_str_valid_toml_succeeds() {
        let config = load_from_str(VALID_TOML, "test").expect("test: valid config");
        assert_eq!(config.routing.default_provider, ProviderId::Gemini);
        assert_eq!(config.routing.rules.len(), 1);
    }

    #[test]
    fn test_load_from_str_invalid_toml_returns_parse_error() {
        let err = load_from_str("not valid toml [[[", "bad.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_from_str_validation_failure_returns_validation_error() {
        let toml_str = r#"
[routing]
default_provider = "gemini"

[[routing.rules]]
keywords = []
provider = "groq"
model = "code-v1"
priority = 1
"#;
        let err = load_from_str(toml_str, "empty-keywords.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_load_from_str_source_name_appears_in_error() {
        let err = load_from_str("invalid [[[", "my-source.toml").unwrap_err();
        assert!(err.to_string().contains("my-source.toml"));
    }

    #[test]
    fn test_load_from_str_missing_routing_returns_parse_error() {
        let err = load_from_str("[server]\nport = 1\n", "no-routing.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_from_str_unknown_provider_fails() {
        let toml_str = r#"
[routing]
default_provider = "mystery"
"#;
        let err = load_from_str(toml_str, "unknown.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_overrides_are_validated() {
        let lookup = |key: &str| (key == "REDIS_URL").then(|| "http://wrong".to_string());
        let err = load_from_str_with_env(VALID_TOML, "env.toml", lookup).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref m) if m.contains("store.url")));
    }

    #[test]
    fn test_load_from_file_valid_toml_succeeds() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("gateway.toml");
        let mut f = std::fs::File::create(&path).expect("test: create file");
        f.write_all(VALID_TOML.as_bytes()).expect("test: write");
        drop(f);

        let config = load_from_file(&path).expect("test: load from file");
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_load_from_file_missing_file_returns_io_error() {
        let err = load_from_file(Path::new("/nonexistent/path/gateway.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
