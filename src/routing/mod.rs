//! # Stage: Prompt Routing
//!
//! ## Responsibility
//! Map a prompt to a `(provider, model)` target. The rule table is compiled
//! from configuration, the classifier turns a prompt into ranked candidates,
//! and the router filters those candidates through a health snapshot.
//!
//! ## Guarantees
//! - Deterministic: the same prompt and table always produce the same
//!   ordered decision.
//! - Read-only: classification and selection never mutate shared state and
//!   take no locks.
//! - Atomic reload: [`RuleTableHandle`] swaps whole tables, never parts.
//!
//! ## NOT Responsible For
//! - Calling providers (that belongs to `dispatch`)
//! - Probing provider health (that belongs to `health`)

pub mod classifier;
pub mod router;
pub mod rules;
pub mod table;

// Re-exports for convenience
pub use classifier::{classify, Candidate, CandidateSource, RoutingDecision};
pub use router::{select, select_all, AttemptedProvider, NoProviderAvailable, SelectedTarget};
pub use rules::{ProviderId, RoutingRule, RuleTable, UnknownProvider};
pub use table::RuleTableHandle;
