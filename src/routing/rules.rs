//! Rule table: the compiled, immutable form of `[routing]`.
//!
//! Rules are sorted by ascending priority with declaration order breaking
//! ties (stable sort). Keywords are lowercased at load; patterns are compiled
//! once as case-insensitive regular expressions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use regex::{Regex, RegexBuilder};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::classifier::{Candidate, CandidateSource};
use crate::config::validation::ConfigError;
use crate::config::RoutingConfig;

/// Upper bound on compiled pattern size.
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

/// Identifier of a supported downstream provider.
///
/// # Panics
///
/// This type never panics.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    /// Google Gemini text generation.
    Gemini,
    /// Groq-hosted open models.
    Groq,
    /// Hugging Face Inference API.
    #[serde(rename = "hf", alias = "hugging_face")]
    HuggingFace,
    /// Pollinations text and image generation.
    Pollinations,
    /// Local loopback provider.
    Echo,
}

impl ProviderId {
    /// Every known provider.
    pub const ALL: [ProviderId; 5] = [
        ProviderId::Gemini,
        ProviderId::Groq,
        ProviderId::HuggingFace,
        ProviderId::Pollinations,
        ProviderId::Echo,
    ];

    /// Wire name, as used in configuration and JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::Groq => "groq",
            Self::HuggingFace => "hf",
            Self::Pollinations => "pollinations",
            Self::Echo => "echo",
        }
    }

    /// Environment variable holding this provider's credential, if it needs one.
    pub fn credential_var(&self) -> Option<&'static str> {
        match self {
            Self::Gemini => Some("GEMINI_API_KEY"),
            Self::Groq => Some("GROQ_API_KEY"),
            Self::HuggingFace => Some("HF_API_KEY"),
            Self::Pollinations | Self::Echo => None,
        }
    }

    /// Model used when neither a rule nor `[routing.models]` names one.
    pub fn builtin_model(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini-2.0-flash",
            Self::Groq => "llama-3.3-70b-versatile",
            Self::HuggingFace => "HuggingFaceH4/zephyr-7b-beta",
            Self::Pollinations => "default",
            Self::Echo => "echo",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown provider name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown provider '{0}'")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderId {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "groq" => Ok(Self::Groq),
            "hf" | "hugging_face" | "huggingface" => Ok(Self::HuggingFace),
            "pollinations" => Ok(Self::Pollinations),
            "echo" => Ok(Self::Echo),
            _ => Err(UnknownProvider(s.to_string())),
        }
    }
}

/// One compiled routing clause.
#[derive(Debug, Clone)]
pub struct RoutingRule {
    keywords: BTreeSet<String>,
    pattern: Option<Regex>,
    provider: ProviderId,
    model: String,
    priority: i32,
    declared_at: usize,
}

impl RoutingRule {
    /// Lowercased match tokens.
    pub fn keywords(&self) -> &BTreeSet<String> {
        &self.keywords
    }

    /// Source of the compiled pattern, if any.
    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_ref().map(Regex::as_str)
    }

    /// Target provider.
    pub fn provider(&self) -> ProviderId {
        self.provider
    }

    /// Target model.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Precedence; lower wins.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Index of this rule in the source document.
    pub fn declared_at(&self) -> usize {
        self.declared_at
    }

    /// Test the rule against a normalized prompt.
    ///
    /// `tokens` must be the token set of `normalized`. A rule matches when
    /// any keyword is a whole token or the pattern matches anywhere.
    pub fn matches(&self, tokens: &std::collections::HashSet<&str>, normalized: &str) -> bool {
        self.keywords.iter().any(|k| tokens.contains(k.as_str()))
            || self
                .pattern
                .as_ref()
                .is_some_and(|p| p.is_match(normalized))
    }
}

/// Immutable, priority-ordered set of routing rules plus model defaults.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<RoutingRule>,
    default_provider: ProviderId,
    models: BTreeMap<ProviderId, String>,
}

impl RuleTable {
    /// Compile a routing document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Validation`] listing every malformed rule: empty keyword
    /// sets, blank models, invalid patterns, or duplicate
    /// `(provider, model, priority, keywords)` entries.
    pub fn load(source: &RoutingConfig) -> Result<Self, ConfigError> {
        let errors = check_rules(source);
        if !errors.is_empty() {
            return Err(ConfigError::from_violations(&errors));
        }

        let mut rules = Vec::with_capacity(source.rules.len());
        for (i, def) in source.rules.iter().enumerate() {
            let pattern = match def.pattern.as_deref() {
                Some(p) => Some(compile_pattern(p).map_err(|e| ConfigError::InvalidField {
                    field: format!("routing.rules[{i}].pattern"),
                    value: p.to_string(),
                    reason: e.to_string(),
                })?),
                None => None,
            };
            rules.push(RoutingRule {
                keywords: normalize_keywords(&def.keywords),
                pattern,
                provider: def.provider,
                model: def.model.trim().to_string(),
                priority: def.priority,
                declared_at: i,
            });
        }

        warn_on_overlaps(&rules);

        // Stable: equal priorities keep declaration order.
        rules.sort_by_key(|r| r.priority);

        Ok(Self {
            rules,
            default_provider: source.default_provider,
            models: source
                .models
                .iter()
                .map(|(p, m)| (*p, m.trim().to_string()))
                .collect(),
        })
    }

    /// Rules sorted by ascending priority, ties in declaration order.
    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// `true` when the table has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Provider used when no candidate is usable.
    pub fn default_provider(&self) -> ProviderId {
        self.default_provider
    }

    /// Default model for `provider`.
    pub fn model_for(&self, provider: ProviderId) -> &str {
        self.models
            .get(&provider)
            .map(String::as_str)
            .unwrap_or_else(|| provider.builtin_model())
    }

    /// The default target as a candidate.
    pub fn default_candidate(&self) -> Candidate {
        Candidate {
            provider: self.default_provider,
            model: self.model_for(self.default_provider).to_string(),
            source: CandidateSource::Default,
        }
    }

    /// Every provider the table can route to.
    pub fn referenced_providers(&self) -> BTreeSet<ProviderId> {
        self.rules
            .iter()
            .map(|r| r.provider)
            .chain(std::iter::once(self.default_provider))
            .collect()
    }
}

/// Check every rule in a routing document, collecting all violations.
pub fn check_rules(source: &RoutingConfig) -> Vec<ConfigError> {
    let mut errors = Vec::new();
    let mut seen: Vec<(ProviderId, &str, i32, BTreeSet<String>, usize)> = Vec::new();

    for (i, def) in source.rules.iter().enumerate() {
        let field = |name: &str| format!("routing.rules[{i}].{name}");

        if def.keywords.is_empty() {
            errors.push(ConfigError::InvalidField {
                field: field("keywords"),
                value: "[]".into(),
                reason: "at least one keyword is required".into(),
            });
        }
        for kw in &def.keywords {
            let trimmed = kw.trim();
            if trimmed.is_empty() {
                errors.push(ConfigError::InvalidField {
                    field: field("keywords"),
                    value: format!("{kw:?}"),
                    reason: "keywords must not be blank".into(),
                });
            } else if trimmed.chars().any(|c| !c.is_alphanumeric()) {
                errors.push(ConfigError::InvalidField {
                    field: field("keywords"),
                    value: kw.clone(),
                    reason: "keywords are single tokens; use `pattern` for phrases".into(),
                });
            }
        }

        if def.model.trim().is_empty() {
            errors.push(ConfigError::InvalidField {
                field: field("model"),
                value: String::new(),
                reason: "model name must not be empty".into(),
            });
        }

        if let Some(p) = def.pattern.as_deref() {
            if p.is_empty() {
                errors.push(ConfigError::InvalidField {
                    field: field("pattern"),
                    value: String::new(),
                    reason: "pattern must not be empty".into(),
                });
            } else if let Err(e) = compile_pattern(p) {
                errors.push(ConfigError::InvalidField {
                    field: field("pattern"),
                    value: p.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        let keywords = normalize_keywords(&def.keywords);
        let model = def.model.trim();
        if let Some((.., first)) = seen.iter().find(|(p, m, prio, kws, _)| {
            *p == def.provider && *m == model && *prio == def.priority && *kws == keywords
        }) {
            errors.push(ConfigError::InvalidField {
                field: format!("routing.rules[{i}]"),
                value: format!("{}/{}", def.provider, model),
                reason: format!(
                    "duplicates routing.rules[{first}] (same provider, model, priority and keywords)"
                ),
            });
        }
        seen.push((def.provider, model, def.priority, keywords, i));
    }

    errors
}

fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(PATTERN_SIZE_LIMIT)
        .build()
}

fn normalize_keywords(keywords: &[String]) -> BTreeSet<String> {
    keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

/// Overlapping keyword sets at equal priority for the same target are legal
/// but ambiguous; declaration order decides.
fn warn_on_overlaps(rules: &[RoutingRule]) {
    for (i, a) in rules.iter().enumerate() {
        for b in &rules[i + 1..] {
            if a.provider == b.provider
                && a.model == b.model
                && a.priority == b.priority
                && !a.keywords.is_disjoint(&b.keywords)
            {
                warn!(
                    first = a.declared_at,
                    second = b.declared_at,
                    provider = %a.provider,
                    model = %a.model,
                    "routing rules overlap at equal priority; declaration order wins"
                );
            }
        }
    }
}
