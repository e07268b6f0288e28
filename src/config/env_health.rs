//! Startup environment health report.
//!
//! ## Responsibility
//! Inspect the process environment for provider credentials and optional
//! settings, produce a redacted report, and decide whether startup may
//! continue.
//!
//! ## Guarantees
//! - Secrets never appear in the report: credentials are masked to their
//!   last four characters.
//! - Collecting a report never fails; only [`ensure_env`] returns errors.
//!
//! ## NOT Responsible For
//! - Validating the TOML document (that belongs to `validation`)

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{error, info, Level};

use super::validation::{is_valid_http_url, is_valid_redis_url, ConfigError};
use super::GatewayConfig;

/// Optional variables checked for shape.
pub const OPTIONAL_VARS: [&str; 10] = [
    "GEMINI_MODEL",
    "GROQ_MODEL",
    "HF_MODEL",
    "HF_TIMEOUT",
    "POLLINATIONS_TEXT_URL",
    "POLLINATIONS_IMAGE_URL",
    "REDIS_URL",
    "SESSION_TTL_SECONDS",
    "PORT",
    "ENV",
];

const SECRET_KEEP: usize = 4;

/// A required credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequiredVar {
    /// Variable name.
    pub name: String,
    /// Set and non-empty.
    pub present: bool,
    /// Masked value, or `<missing>`.
    pub preview: String,
}

/// An optional setting with lightweight checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionalVar {
    /// Variable name.
    pub name: String,
    /// Set at all.
    pub present: bool,
    /// Display value, or `<unset>`.
    pub preview: String,
    /// URL shape check, for URL variables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_url: Option<bool>,
    /// Integer parse check, for numeric variables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_int: Option<bool>,
    /// Range check, for numeric variables that parsed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_range: Option<bool>,
}

impl OptionalVar {
    fn url_ok(&self) -> bool {
        self.valid_url.unwrap_or(true)
    }

    fn int_ok(&self) -> bool {
        self.valid_int.unwrap_or(true) && self.valid_range.unwrap_or(true)
    }
}

/// Redacted snapshot of the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvReport {
    /// `ENV` value, `development` when unset.
    pub env: String,
    /// Credentials the configured routes need.
    pub required: Vec<RequiredVar>,
    /// Optional settings.
    pub optional: Vec<OptionalVar>,
}

impl EnvReport {
    /// Every required credential is present.
    pub fn ok_required(&self) -> bool {
        self.required.iter().all(|v| v.present)
    }

    /// Every URL variable is well-formed.
    pub fn ok_urls(&self) -> bool {
        self.optional.iter().all(OptionalVar::url_ok)
    }

    /// Every numeric variable parses and is in range.
    pub fn ok_ints(&self) -> bool {
        self.optional.iter().all(OptionalVar::int_ok)
    }

    /// All checks pass.
    pub fn is_ok(&self) -> bool {
        self.ok_required() && self.ok_urls() && self.ok_ints()
    }

    /// Human-readable list of failed checks.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|v| !v.present)
            .map(|v| v.name.as_str())
            .collect();
        if !missing.is_empty() {
            problems.push(format!("Missing required: {}", missing.join(", ")));
        }

        let bad_urls: Vec<&str> = self
            .optional
            .iter()
            .filter(|v| !v.url_ok())
            .map(|v| v.name.as_str())
            .collect();
        if !bad_urls.is_empty() {
            problems.push(format!("Invalid URLs: {}", bad_urls.join(", ")));
        }

        let bad_ints: Vec<&str> = self
            .optional
            .iter()
            .filter(|v| !v.int_ok())
            .map(|v| v.name.as_str())
            .collect();
        if !bad_ints.is_empty() {
            problems.push(format!("Invalid integers: {}", bad_ints.join(", ")));
        }

        problems
    }
}

/// Mask all but the last `keep` characters of `value`.
pub fn mask_secret(value: &str, keep: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.is_empty() {
        return "<empty>".to_string();
    }
    if chars.len() <= keep {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - keep..].iter().collect();
    format!("{}{tail}", "*".repeat(chars.len() - keep))
}

/// Credential variables needed by the providers `config` routes to.
pub fn required_credentials(config: &GatewayConfig) -> Vec<&'static str> {
    let providers: BTreeSet<_> = config
        .routing
        .rules
        .iter()
        .map(|r| r.provider)
        .chain(std::iter::once(config.routing.default_provider))
        .collect();
    providers
        .into_iter()
        .filter_map(|p| p.credential_var())
        .collect()
}

/// Build a report using `lookup` to read variables.
pub fn collect_env_report_with<F>(lookup: F, required: &[&str]) -> EnvReport
where
    F: Fn(&str) -> Option<String>,
{
    let env = lookup("ENV")
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "development".to_string());

    let required = required
        .iter()
        .map(|name| {
            let value = lookup(*name).filter(|v| !v.is_empty());
            RequiredVar {
                name: (*name).to_string(),
                present: value.is_some(),
                preview: value
                    .as_deref()
                    .map_or_else(|| "<missing>".to_string(), |v| mask_secret(v, SECRET_KEEP)),
            }
        })
        .collect();

    let optional = OPTIONAL_VARS
        .iter()
        .map(|name| check_optional(name, lookup(*name)))
        .collect();

    EnvReport {
        env,
        required,
        optional,
    }
}

fn check_optional(name: &str, value: Option<String>) -> OptionalVar {
    let set = value.as_deref().filter(|v| !v.is_empty());
    let preview = match (name, set) {
        (_, None) => "<unset>".to_string(),
        // Connection strings may embed a password.
        ("REDIS_URL", Some(v)) => mask_secret(v, SECRET_KEEP),
        (_, Some(v)) => v.to_string(),
    };

    let mut entry = OptionalVar {
        name: name.to_string(),
        present: value.is_some(),
        preview,
        valid_url: None,
        valid_int: None,
        valid_range: None,
    };

    match name {
        "POLLINATIONS_TEXT_URL" | "POLLINATIONS_IMAGE_URL" => {
            entry.valid_url = Some(set.map_or(true, is_valid_http_url));
        }
        "REDIS_URL" => {
            entry.valid_url = Some(set.map_or(true, is_valid_redis_url));
        }
        "HF_TIMEOUT" | "SESSION_TTL_SECONDS" | "PORT" => {
            let parsed = set.map(|v| v.trim().parse::<i64>());
            entry.valid_int = Some(!matches!(parsed, Some(Err(_))));
            if let Some(Ok(n)) = parsed {
                entry.valid_range = Some(match name {
                    "PORT" => (1..=65_535).contains(&n),
                    _ => n > 0,
                });
            }
        }
        _ => {}
    }

    entry
}

/// Log a redacted report at `ERROR` when `level` is [`Level::ERROR`], at
/// `INFO` otherwise.
pub fn log_env_report(report: &EnvReport, level: Level) {
    macro_rules! emit {
        ($($arg:tt)*) => {
            if level == Level::ERROR {
                error!($($arg)*);
            } else {
                info!($($arg)*);
            }
        };
    }

    emit!(env = %report.env, "ENV mode");
    emit!(ok = report.ok_required(), "required vars");
    for v in &report.required {
        emit!(var = %v.name, present = v.present, value = %v.preview, "required var");
    }
    emit!(urls_ok = report.ok_urls(), ints_ok = report.ok_ints(), "optional var checks");
    for v in &report.optional {
        emit!(
            var = %v.name,
            present = v.present,
            value = %v.preview,
            valid_url = ?v.valid_url,
            valid_int = ?v.valid_int,
            valid_range = ?v.valid_range,
            "optional var"
        );
    }
    emit!(ok = report.is_ok(), "overall ENV health");
}

/// Fail when `strict` and the report has problems.
///
/// # Errors
///
/// [`ConfigError::Environment`] listing every problem.
pub fn ensure_env(report: &EnvReport, strict: bool) -> Result<(), ConfigError> {
    if !strict {
        return Ok(());
    }
    let problems = report.problems();
    if problems.is_empty() {
        return Ok(());
    }
    log_env_report(report, Level::ERROR);
    Err(ConfigError::Environment(problems.join(" | ")))
}
