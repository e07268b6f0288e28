//! Prompt classification against a [`RuleTable`].
//!
//! `classify` is a pure function: lowercase the prompt, split it into
//! alphanumeric tokens, then walk the priority-sorted rules collecting every
//! one that matches. No deduplication happens here; two rules pointing at
//! the same provider become two candidates.

use std::collections::HashSet;

use serde::Serialize;

use super::rules::{ProviderId, RuleTable};
use crate::Prompt;

/// Why a candidate was proposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CandidateSource {
    /// A routing rule matched.
    Rule {
        /// Index of the rule in the source document.
        declared_at: usize,
        /// The rule's priority.
        priority: i32,
    },
    /// The caller named the target explicitly.
    Override,
    /// The table's configured default provider.
    Default,
}

impl CandidateSource {
    /// Metric label for this source.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Rule { .. } => "rule",
            Self::Override => "override",
            Self::Default => "default",
        }
    }
}

/// A `(provider, model)` pair proposed for a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    /// Target provider.
    pub provider: ProviderId,
    /// Target model.
    pub model: String,
    /// The rule, override or default that produced this candidate.
    pub source: CandidateSource,
}

/// Ordered candidates, most preferred first. Empty when nothing matched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoutingDecision {
    /// Candidates in preference order.
    pub candidates: Vec<Candidate>,
}

impl RoutingDecision {
    /// `true` when no rule matched and no override was given.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// `true` when this decision came from a caller override.
    pub fn is_override(&self) -> bool {
        matches!(
            self.candidates.as_slice(),
            [Candidate {
                source: CandidateSource::Override,
                ..
            }]
        )
    }
}

/// Classify `prompt` against `table`.
///
/// An override short-circuits classification and yields exactly one
/// candidate. Otherwise every matching rule contributes a candidate in
/// table order (ascending priority, declaration order on ties).
///
/// # Panics
///
/// This function never panics.
pub fn classify(prompt: &Prompt, table: &RuleTable) -> RoutingDecision {
    if let Some(ov) = &prompt.override_target {
        let model = ov
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| table.model_for(ov.provider))
            .to_string();
        return RoutingDecision {
            candidates: vec![Candidate {
                provider: ov.provider,
                model,
                source: CandidateSource::Override,
            }],
        };
    }

    let normalized = prompt.text.to_lowercase();
    let tokens = tokenize(&normalized);

    let candidates = table
        .rules()
        .iter()
        .filter(|rule| rule.matches(&tokens, &normalized))
        .map(|rule| Candidate {
            provider: rule.provider(),
            model: rule.model().to_string(),
            source: CandidateSource::Rule {
                declared_at: rule.declared_at(),
                priority: rule.priority(),
            },
        })
        .collect();

    RoutingDecision { candidates }
}

/// Split lowercased text on anything that is not alphanumeric.
pub(crate) fn tokenize(normalized: &str) -> HashSet<&str> {
    normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect()
}
