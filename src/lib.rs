//! # prompt-gateway
//!
//! A keyword-routed gateway in front of several AI providers.
//!
//! ## Architecture
//!
//! ```text
//! Prompt → classify(RuleTable) → select(HealthSnapshot) → ProviderCapability → DispatchResult
//! ```
//!
//! The rule table is loaded once from the gateway TOML document and swapped
//! atomically on reload. Health is an externally refreshed snapshot. The only
//! suspending step is the provider call made by the [`dispatch`] facade.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod augment;
pub mod config;
pub mod dispatch;
pub mod health;
pub mod metrics;
pub mod provider;
pub mod routing;
pub mod store;

#[cfg(feature = "web-api")]
pub mod web_api;

// Re-exports for convenience
pub use config::validation::ConfigError;
pub use dispatch::{DispatchError, DispatchFacade, DispatchResult, ResultKind};
pub use provider::{
    GenerationParams, ProviderCapability, ProviderError, ProviderErrorKind, ProviderRegistry,
};
pub use routing::{
    classify, select, Candidate, NoProviderAvailable, ProviderId, RoutingDecision, RuleTable,
    RuleTableHandle, SelectedTarget,
};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`GatewayError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Example
///
/// ```no_run
/// # use prompt_gateway::{init_tracing, GatewayError};
/// # fn example() -> Result<(), GatewayError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), GatewayError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(filter)
            .try_init(),
    };

    result.map_err(|e| GatewayError::Other(format!("tracing init failed: {e}")))
}

/// Top-level gateway errors.
///
/// Module errors convert into this type with `?` so the binary can treat
/// every failure uniformly at its edge.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The gateway document or environment is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A prompt could not be dispatched.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The session store backend failed.
    #[error(transparent)]
    Store(#[from] store::StoreError),

    /// Binding or serving the HTTP listener failed.
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// Caller-supplied explicit provider selection.
///
/// When present on a [`Prompt`], keyword classification is skipped and the
/// named provider becomes the sole candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptOverride {
    /// Provider to route to.
    pub provider: ProviderId,
    /// Model at that provider. `None` uses the rule table's default model.
    #[serde(default)]
    pub model: Option<String>,
}

impl PromptOverride {
    /// Override to `provider` with its default model.
    pub fn provider(provider: ProviderId) -> Self {
        Self {
            provider,
            model: None,
        }
    }

    /// Override to an explicit `(provider, model)` pair.
    pub fn target(provider: ProviderId, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: Some(model.into()),
        }
    }
}

/// Immutable input to one dispatch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Prompt {
    /// Raw prompt text as supplied by the caller.
    pub text: String,
    /// Explicit provider selection that bypasses classification.
    pub override_target: Option<PromptOverride>,
    /// Generation parameters forwarded to the provider.
    pub params: GenerationParams,
    /// Session whose transcript should record this exchange.
    pub session_id: Option<String>,
    /// Regenerate from this transcript position, dropping later messages.
    pub edit_index: Option<usize>,
}

impl Prompt {
    /// Create a prompt with default parameters and no override.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Route this prompt to an explicit target instead of classifying it.
    pub fn with_override(mut self, target: PromptOverride) -> Self {
        self.override_target = Some(target);
        self
    }

    /// Replace the generation parameters.
    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    /// Mark this prompt as an image-generation request.
    pub fn as_image(mut self) -> Self {
        self.params.image = true;
        self
    }

    /// Attach a session identifier.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Continue the session from message `index` instead of its end.
    pub fn with_edit_index(mut self, index: usize) -> Self {
        self.edit_index = Some(index);
        self
    }
}
