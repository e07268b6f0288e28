//! # Stage: Provider Capabilities
//!
//! ## Responsibility
//! Define the uniform contract every downstream provider implements and
//! hold one adapter per [`ProviderId`]. Adapters own their wire format;
//! nothing outside this module knows how a provider is called.
//!
//! ## Guarantees
//! - Object-safe: adapters are stored as `Arc<dyn ProviderCapability>`.
//! - Typed failures: every adapter error maps to a [`ProviderErrorKind`].
//! - No secrets in errors: request URLs are stripped from transport errors
//!   and credentials travel in headers.
//! - Single attempt: adapters never retry.
//!
//! ## NOT Responsible For
//! - Choosing which provider to call (that belongs to `routing`)
//! - Timeouts and cancellation of a whole dispatch (that belongs to
//!   `dispatch`)

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::GatewayConfig;
use crate::health::ProviderHealth;
use crate::routing::ProviderId;
use crate::store::Message;

pub mod echo;
pub mod gemini;
pub mod groq;
pub mod huggingface;
pub mod pollinations;
pub mod search;

pub use echo::EchoProvider;
pub use gemini::GeminiProvider;
pub use groq::GroqProvider;
pub use huggingface::HuggingFaceProvider;
pub use pollinations::PollinationsProvider;
pub use search::{DuckDuckGoSearch, SearchError, SearchProvider, SearchQuery, SearchResult};

/// Longest provider response body quoted in an error message.
const MAX_ERROR_BODY: usize = 300;

/// Failure class of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Credential missing or rejected.
    Unauthorized,
    /// The provider is throttling us.
    RateLimited,
    /// The call did not finish in time.
    Timeout,
    /// The provider is down, warming up or returned nothing usable.
    Unavailable,
    /// The model does not exist or cannot serve this request.
    InvalidModel,
}

impl ProviderErrorKind {
    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::InvalidModel => "invalid_model",
        }
    }

    /// Classify an HTTP status returned by a provider.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Unauthorized,
            429 => Self::RateLimited,
            404 | 422 => Self::InvalidModel,
            408 | 504 => Self::Timeout,
            _ => Self::Unavailable,
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed provider call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{provider} {kind}: {message}")]
pub struct ProviderError {
    /// Provider that failed.
    pub provider: ProviderId,
    /// Failure class.
    pub kind: ProviderErrorKind,
    /// Human-readable detail, free of credentials.
    pub message: String,
}

impl ProviderError {
    /// Build an error.
    pub fn new(provider: ProviderId, kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            provider,
            kind,
            message: message.into(),
        }
    }

    /// Error for a non-success HTTP status, quoting a bounded body excerpt.
    pub fn from_status(provider: ProviderId, status: u16, body: &str) -> Self {
        let excerpt: String = body.trim().chars().take(MAX_ERROR_BODY).collect();
        let message = if excerpt.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {excerpt}")
        };
        Self::new(provider, ProviderErrorKind::from_status(status), message)
    }

    /// Error for a transport-level failure.
    pub fn from_reqwest(provider: ProviderId, err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else if let Some(status) = err.status() {
            ProviderErrorKind::from_status(status.as_u16())
        } else {
            ProviderErrorKind::Unavailable
        };
        Self::new(provider, kind, err.without_url().to_string())
    }

    /// The request needs a credential that is not configured.
    pub fn missing_credential(provider: ProviderId) -> Self {
        let var = provider.credential_var().unwrap_or("credential");
        Self::new(
            provider,
            ProviderErrorKind::Unauthorized,
            format!("{var} is not set"),
        )
    }

    /// The provider answered with no usable text.
    pub fn empty_response(provider: ProviderId) -> Self {
        Self::new(provider, ProviderErrorKind::Unavailable, "empty response")
    }

    /// The response body did not have the expected shape.
    pub fn malformed(provider: ProviderId, detail: impl fmt::Display) -> Self {
        Self::new(
            provider,
            ProviderErrorKind::Unavailable,
            format!("unexpected response: {detail}"),
        )
    }

    /// A text-only provider was asked for an image.
    pub fn image_unsupported(provider: ProviderId) -> Self {
        Self::new(
            provider,
            ProviderErrorKind::InvalidModel,
            "image generation is not supported by this provider",
        )
    }
}

/// Per-request generation parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Sampling temperature, 0.0..=2.0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Maximum number of generated tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Request an image instead of text.
    #[serde(default)]
    pub image: bool,
    /// Image width in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// Image height in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Raw provider output: generated text, or an image URL when an image was
/// requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProviderResponse {
    /// Text or URL.
    pub body: String,
}

impl RawProviderResponse {
    /// Wrap a body.
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

/// Uniform contract for a downstream provider.
///
/// Implementations must be `Send + Sync`; the registry shares them across
/// request tasks behind an `Arc`.
#[async_trait]
pub trait ProviderCapability: Send + Sync {
    /// Which provider this adapter speaks to.
    fn id(&self) -> ProviderId;

    /// Make one generation call.
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<RawProviderResponse, ProviderError>;

    /// Make one generation call continuing a conversation.
    ///
    /// `history` holds the earlier turns, oldest first; `prompt` is the new
    /// user turn. Adapters without a conversation format ignore `history`.
    async fn chat(
        &self,
        model: &str,
        history: &[Message],
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<RawProviderResponse, ProviderError> {
        let _ = history;
        self.generate(model, prompt, params).await
    }

    /// Report whether the provider can currently be called.
    async fn probe(&self) -> ProviderHealth;
}

/// Credentials read from the environment.
#[derive(Clone, Default)]
pub struct Credentials {
    keys: BTreeMap<ProviderId, String>,
}

impl Credentials {
    /// Collect every provider credential via `lookup`. Blank values are
    /// ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let keys = ProviderId::ALL
            .iter()
            .filter_map(|id| {
                let var = id.credential_var()?;
                let value = lookup(var)?.trim().to_string();
                (!value.is_empty()).then_some((*id, value))
            })
            .collect();
        Self { keys }
    }

    /// Credential for `provider`.
    pub fn get(&self, provider: ProviderId) -> Option<&str> {
        self.keys.get(&provider).map(String::as_str)
    }

    /// Set a credential.
    pub fn with(mut self, provider: ProviderId, key: impl Into<String>) -> Self {
        self.keys.insert(provider, key.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.keys.keys().map(|id| (id.as_str(), "<redacted>")))
            .finish()
    }
}

/// Lookup from [`ProviderId`] to its adapter.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<ProviderId, Arc<dyn ProviderCapability>>,
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same id.
    pub fn register(&mut self, provider: Arc<dyn ProviderCapability>) {
        self.providers.insert(provider.id(), provider);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, provider: Arc<dyn ProviderCapability>) -> Self {
        self.register(provider);
        self
    }

    /// Adapter for `id`.
    pub fn get(&self, id: ProviderId) -> Option<Arc<dyn ProviderCapability>> {
        self.providers.get(&id).cloned()
    }

    /// Registered adapters in id order.
    pub fn iter(&self) -> impl Iterator<Item = (ProviderId, &Arc<dyn ProviderCapability>)> {
        self.providers.iter().map(|(id, p)| (*id, p))
    }

    /// Registered ids.
    pub fn ids(&self) -> Vec<ProviderId> {
        self.providers.keys().copied().collect()
    }

    /// Number of adapters.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// `true` when no adapter is registered.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Build every adapter described by `config`.
    ///
    /// Gemini, Groq, Hugging Face and Pollinations are always registered;
    /// those without a credential report themselves unavailable when
    /// probed. Echo is registered only when enabled.
    pub fn from_config(config: &GatewayConfig, credentials: &Credentials) -> Self {
        let providers = &config.providers;
        let mut registry = Self::new();

        let mut gemini = GeminiProvider::new(credentials.get(ProviderId::Gemini));
        if let Some(url) = &providers.gemini.base_url {
            gemini = gemini.with_base_url(url);
        }
        if let Some(t) = providers.gemini.timeout_s {
            gemini = gemini.with_timeout(Duration::from_secs(t));
        }
        registry.register(Arc::new(gemini));

        let mut groq = GroqProvider::new(credentials.get(ProviderId::Groq));
        if let Some(url) = &providers.groq.base_url {
            groq = groq.with_base_url(url);
        }
        if let Some(t) = providers.groq.timeout_s {
            groq = groq.with_timeout(Duration::from_secs(t));
        }
        registry.register(Arc::new(groq));

        let mut hf = HuggingFaceProvider::new(credentials.get(ProviderId::HuggingFace));
        if let Some(url) = &providers.hf.base_url {
            hf = hf.with_base_url(url);
        }
        if let Some(t) = providers.hf.timeout_s {
            hf = hf.with_timeout(Duration::from_secs(t));
        }
        registry.register(Arc::new(hf));

        registry.register(Arc::new(
            PollinationsProvider::new()
                .with_text_url(&providers.pollinations.text_url)
                .with_image_url(&providers.pollinations.image_url)
                .with_timeout(Duration::from_secs(providers.pollinations.timeout_s)),
        ));

        if providers.echo.enabled {
            registry.register(Arc::new(EchoProvider::with_delay(providers.echo.delay_ms)));
        }

        registry
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.ids())
            .finish()
    }
}

/// Health derived from whether a required credential is configured.
pub(crate) fn credential_health(provider: ProviderId, has_key: bool) -> ProviderHealth {
    if has_key {
        ProviderHealth::available()
    } else {
        let var = provider.credential_var().unwrap_or("credential");
        ProviderHealth::unavailable(format!("{var} not set"))
    }
}

/// Join a base URL and a path with exactly one slash between them.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
