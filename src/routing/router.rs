//! Health-filtered target selection.
//!
//! The [`select`] function walks a [`RoutingDecision`] in order and returns
//! the first candidate whose provider is available in the supplied health
//! view, falling back to the configured default. It never calls a provider
//! and never mutates health data; callers take one snapshot before calling
//! it so the whole walk sees a single point in time.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use super::classifier::{Candidate, CandidateSource, RoutingDecision};
use super::rules::ProviderId;
use crate::health::ProviderHealthView;

/// The `(provider, model)` chosen for a request.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectedTarget {
    /// Provider to call.
    pub provider: ProviderId,
    /// Model at that provider.
    pub model: String,
    /// Where the target came from.
    pub source: CandidateSource,
    /// Position in the decision, or the decision length for the default.
    pub rank: usize,
}

impl SelectedTarget {
    /// `true` when the default provider was chosen.
    pub fn is_default(&self) -> bool {
        self.source == CandidateSource::Default
    }
}

/// One provider that was considered and rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptedProvider {
    /// The provider.
    pub provider: ProviderId,
    /// Why it was unusable.
    pub reason: String,
}

impl fmt::Display for AttemptedProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.provider, self.reason)
    }
}

/// Every candidate and the default provider were unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no provider available; attempted: {}", format_attempted(.attempted))]
pub struct NoProviderAvailable {
    /// Each distinct provider checked, in the order it was checked.
    pub attempted: Vec<AttemptedProvider>,
}

fn format_attempted(attempted: &[AttemptedProvider]) -> String {
    attempted
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Select the first usable target for `decision`.
///
/// # Errors
///
/// [`NoProviderAvailable`] when neither any candidate nor `default` is
/// available; the error lists every provider checked with its reason.
///
/// # Panics
///
/// This function never panics.
pub fn select<H>(
    decision: &RoutingDecision,
    health: &H,
    default: &Candidate,
) -> Result<SelectedTarget, NoProviderAvailable>
where
    H: ProviderHealthView + ?Sized,
{
    select_all(decision, health, default)?
        .into_iter()
        .next()
        .ok_or_else(|| NoProviderAvailable {
            attempted: Vec::new(),
        })
}

/// Every usable target for `decision`, in preference order, with the
/// default appended last.
///
/// Duplicate `(provider, model)` pairs are collapsed to their first
/// occurrence. This is the walk order used by fallback dispatch.
///
/// # Errors
///
/// [`NoProviderAvailable`] when the result would be empty.
pub fn select_all<H>(
    decision: &RoutingDecision,
    health: &H,
    default: &Candidate,
) -> Result<Vec<SelectedTarget>, NoProviderAvailable>
where
    H: ProviderHealthView + ?Sized,
{
    let mut usable: Vec<SelectedTarget> = Vec::new();
    let mut attempted: Vec<AttemptedProvider> = Vec::new();

    let ranked = decision
        .candidates
        .iter()
        .enumerate()
        .chain(std::iter::once((decision.candidates.len(), default)));

    for (rank, candidate) in ranked {
        if usable
            .iter()
            .any(|t| t.provider == candidate.provider && t.model == candidate.model)
        {
            continue;
        }
        if health.is_available(candidate.provider) {
            usable.push(SelectedTarget {
                provider: candidate.provider,
                model: candidate.model.clone(),
                source: candidate.source,
                rank,
            });
        } else if !attempted.iter().any(|a| a.provider == candidate.provider) {
            attempted.push(AttemptedProvider {
                provider: candidate.provider,
                reason: health
                    .reason(candidate.provider)
                    .unwrap_or_else(|| "unavailable".to_string()),
            });
        }
    }

    if usable.is_empty() {
        Err(NoProviderAvailable { attempted })
    } else {
        Ok(usable)
    }
}
