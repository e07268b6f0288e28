//! # Stage: Dispatch Facade
//!
//! ## Responsibility
//! Single entry point from a [`Prompt`] to a [`DispatchResult`]: classify,
//! take a health snapshot, select a target, call the provider, normalize the
//! response.
//!
//! ## Guarantees
//! - Stateless across requests: every call starts at
//!   [`DispatchState::Received`].
//! - Lock-free provider calls: the rule table and health snapshot are `Arc`
//!   clones taken before any I/O begins.
//! - Cancellable: a caller token or the configured timeout aborts the
//!   provider call; routing has already completed by then.
//! - Explicit fallback: a failed provider call is only retried against the
//!   next candidate when [`FallbackMode::NextCandidate`] is configured.
//! - Conversational: with a session store, the prompt's transcript (cut at
//!   `edit_index`) is sent along and the new exchange is saved after a
//!   successful call.
//!
//! ## NOT Responsible For
//! - HTTP status mapping (that belongs to `web_api`)
//! - Retrying a single provider (adapters make exactly one attempt)

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::augment;
use crate::config::{DispatchConfig, FallbackMode};
use crate::health::HealthSource;
use crate::metrics;
use crate::provider::{
    ProviderError, ProviderErrorKind, ProviderRegistry, SearchProvider, SearchQuery,
};
use crate::routing::{
    classify, select, select_all, NoProviderAvailable, ProviderId, RuleTableHandle,
    SelectedTarget,
};
use crate::store::{Message, SessionStore};
use crate::Prompt;

/// Dispatch policy derived from `[dispatch]`.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOptions {
    /// What to do after a provider failure.
    pub fallback: FallbackMode,
    /// Upper bound for one provider call.
    pub timeout: Duration,
    /// Prepend search results to prompts with search triggers.
    pub search_context: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

impl From<&DispatchConfig> for DispatchOptions {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            fallback: config.fallback,
            timeout: Duration::from_millis(config.timeout_ms),
            search_context: config.search_context,
        }
    }
}

/// Shape of a [`DispatchResult`] payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    /// Generated text.
    Text,
    /// URL of a generated image.
    Image,
    /// Error message.
    Error,
}

/// Normalized output of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResult {
    /// Payload shape.
    pub kind: ResultKind,
    /// Text, image URL or error message.
    pub payload: String,
    /// Provider that produced the payload.
    pub provider_used: Option<ProviderId>,
    /// Model that produced the payload.
    pub model_used: Option<String>,
}

/// A dispatch that did not produce a result.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The prompt was rejected before routing.
    #[error("invalid prompt: {0}")]
    InvalidPrompt(String),

    /// Every candidate and the default provider were unavailable.
    #[error(transparent)]
    NoProviderAvailable(#[from] NoProviderAvailable),

    /// The selected provider call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The caller cancelled the request.
    #[error("dispatch cancelled by caller")]
    Cancelled,
}

impl DispatchError {
    /// Stable error-kind label, used in HTTP bodies and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidPrompt(_) => "invalid_request",
            Self::NoProviderAvailable(_) => "no_provider_available",
            Self::Provider(_) => "provider_error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Per-request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Prompt accepted.
    Received,
    /// Candidates computed.
    Classified,
    /// Target chosen against a health snapshot.
    Selected,
    /// Provider call in flight.
    Dispatching,
    /// Result produced.
    Completed,
    /// Error produced.
    Failed,
}

impl DispatchState {
    /// Lowercase name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Classified => "classified",
            Self::Selected => "selected",
            Self::Dispatching => "dispatching",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Routes prompts and calls providers.
///
/// Cheap to share: hold it in an `Arc` and call it from any number of tasks.
pub struct DispatchFacade {
    rules: Arc<RuleTableHandle>,
    health: Arc<dyn HealthSource>,
    providers: Arc<ProviderRegistry>,
    search: Option<Arc<dyn SearchProvider>>,
    sessions: Option<SessionStore>,
    options: DispatchOptions,
}

impl std::fmt::Debug for DispatchFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchFacade")
            .field("rules_generation", &self.rules.generation())
            .field("providers", &self.providers)
            .field("search", &self.search.is_some())
            .field("sessions", &self.sessions)
            .field("options", &self.options)
            .finish()
    }
}

impl DispatchFacade {
    /// Facade with default options, no search and no sessions.
    pub fn new(
        rules: Arc<RuleTableHandle>,
        health: Arc<dyn HealthSource>,
        providers: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            rules,
            health,
            providers,
            search: None,
            sessions: None,
            options: DispatchOptions::default(),
        }
    }

    /// Attach a search provider for search context.
    pub fn with_search(mut self, search: Arc<dyn SearchProvider>) -> Self {
        self.search = Some(search);
        self
    }

    /// Attach a session store.
    pub fn with_sessions(mut self, sessions: SessionStore) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Replace the dispatch options.
    pub fn with_options(mut self, options: DispatchOptions) -> Self {
        self.options = options;
        self
    }

    /// The live rule table handle.
    pub fn rules(&self) -> &Arc<RuleTableHandle> {
        &self.rules
    }

    /// The session store, if configured.
    pub fn sessions(&self) -> Option<&SessionStore> {
        self.sessions.as_ref()
    }

    /// The search provider, if configured.
    pub fn search(&self) -> Option<&Arc<dyn SearchProvider>> {
        self.search.as_ref()
    }

    /// The active options.
    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    /// Dispatch `prompt` with only the configured timeout.
    ///
    /// # Errors
    ///
    /// See [`dispatch_with_cancel`](Self::dispatch_with_cancel).
    pub async fn dispatch(&self, prompt: &Prompt) -> Result<DispatchResult, DispatchError> {
        self.dispatch_with_cancel(prompt, &CancellationToken::new())
            .await
    }

    /// Dispatch `prompt`, aborting if `cancel` fires.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::InvalidPrompt`] for blank text.
    /// - [`DispatchError::NoProviderAvailable`] when nothing is healthy.
    /// - [`DispatchError::Provider`] when the provider call fails or times
    ///   out (the last failure when fallback is enabled).
    /// - [`DispatchError::Cancelled`] when `cancel` fires first.
    pub async fn dispatch_with_cancel(
        &self,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<DispatchResult, DispatchError> {
        let result = self.run(prompt, cancel).await;
        match &result {
            Ok(r) => debug!(
                state = DispatchState::Completed.as_str(),
                provider = ?r.provider_used,
                "dispatch finished"
            ),
            Err(e) => {
                metrics::inc_error(e.kind());
                warn!(
                    state = DispatchState::Failed.as_str(),
                    error_kind = e.kind(),
                    error = %e,
                    "dispatch failed"
                );
            }
        }
        result
    }

    /// Like [`dispatch_with_cancel`](Self::dispatch_with_cancel) but folds
    /// errors into a `kind = error` result.
    pub async fn dispatch_normalized(
        &self,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> DispatchResult {
        match self.dispatch_with_cancel(prompt, cancel).await {
            Ok(result) => result,
            Err(e) => DispatchResult {
                kind: ResultKind::Error,
                payload: e.to_string(),
                provider_used: match &e {
                    DispatchError::Provider(p) => Some(p.provider),
                    _ => None,
                },
                model_used: None,
            },
        }
    }

    async fn run(
        &self,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<DispatchResult, DispatchError> {
        debug!(state = DispatchState::Received.as_str(), "dispatch started");
        if prompt.text.trim().is_empty() {
            return Err(DispatchError::InvalidPrompt("prompt must not be empty".into()));
        }
        let history = self.history(prompt).await?;

        let table = self.rules.snapshot();
        let decision = classify(prompt, &table);
        debug!(
            state = DispatchState::Classified.as_str(),
            candidates = decision.candidates.len(),
            "prompt classified"
        );

        // One snapshot for the whole selection walk.
        let health = self.health.snapshot();
        let default = table.default_candidate();
        let targets: Vec<SelectedTarget> = match self.options.fallback {
            FallbackMode::Disabled => vec![select(&decision, health.as_ref(), &default)?],
            FallbackMode::NextCandidate => select_all(&decision, health.as_ref(), &default)?,
        };
        drop(table);
        drop(health);

        if let Some(first) = targets.first() {
            metrics::inc_routing(first.source.label());
            debug!(
                state = DispatchState::Selected.as_str(),
                provider = %first.provider,
                model = %first.model,
                source = first.source.label(),
                "target selected"
            );
        }

        let text = self.augment(prompt, cancel).await?;

        let prior = history.as_deref().unwrap_or_default();
        let mut last_error: Option<ProviderError> = None;
        let total = targets.len();
        for (attempt, target) in targets.into_iter().enumerate() {
            match self.call(&target, prior, &text, prompt, cancel).await {
                Ok(result) => {
                    if history.is_some() {
                        self.record_session(prompt, prior, &result).await;
                    }
                    return Ok(result);
                }
                Err(DispatchError::Provider(e)) if attempt + 1 < total => {
                    warn!(
                        provider = %e.provider,
                        error_kind = e.kind.as_str(),
                        error = %e.message,
                        "provider failed, trying next candidate"
                    );
                    last_error = Some(e);
                }
                Err(other) => return Err(other),
            }
        }

        // Only reachable if `targets` was empty, which select never returns.
        Err(match last_error {
            Some(e) => DispatchError::Provider(e),
            None => DispatchError::NoProviderAvailable(NoProviderAvailable {
                attempted: Vec::new(),
            }),
        })
    }

    /// Prompt text with search context prepended when applicable.
    async fn augment(
        &self,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<String, DispatchError> {
        let Some(search) = &self.search else {
            return Ok(prompt.text.clone());
        };
        if !self.options.search_context
            || prompt.params.image
            || !augment::should_search(&prompt.text)
        {
            return Ok(prompt.text.clone());
        }
        let query = augment::extract_query(&prompt.text);
        if query.is_empty() {
            return Ok(prompt.text.clone());
        }

        let request = SearchQuery::new(query).with_limit(augment::FETCH_RESULTS);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            r = tokio::time::timeout(self.options.timeout, search.search(&request)) => r,
        };
        match outcome {
            Ok(Ok(results)) => {
                debug!(hits = results.len(), "search context attached");
                Ok(augment::with_search_context(&prompt.text, &results))
            }
            Ok(Err(e)) => {
                warn!(error = %e, "search failed, continuing without context");
                Ok(prompt.text.clone())
            }
            Err(_) => {
                warn!("search timed out, continuing without context");
                Ok(prompt.text.clone())
            }
        }
    }

    /// Earlier turns of the prompt's session, cut at `edit_index`.
    ///
    /// `None` when the transcript could not be read; the exchange is then
    /// not recorded so the stored transcript is left intact.
    async fn history(&self, prompt: &Prompt) -> Result<Option<Vec<Message>>, DispatchError> {
        let mut history = match (&self.sessions, prompt.session_id.as_deref()) {
            (Some(sessions), Some(session_id)) => match sessions.load(session_id).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(session_id, error = %e, "failed to load session transcript");
                    return Ok(None);
                }
            },
            _ => Vec::new(),
        };
        if let Some(index) = prompt.edit_index {
            if index > history.len() {
                return Err(DispatchError::InvalidPrompt(format!(
                    "edit_index {index} out of range (transcript has {} messages)",
                    history.len()
                )));
            }
            history.truncate(index);
        }
        Ok(Some(history))
    }

    async fn call(
        &self,
        target: &SelectedTarget,
        history: &[Message],
        text: &str,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<DispatchResult, DispatchError> {
        let provider = self.providers.get(target.provider).ok_or_else(|| {
            ProviderError::new(
                target.provider,
                ProviderErrorKind::Unavailable,
                "provider is not registered",
            )
        })?;

        debug!(
            state = DispatchState::Dispatching.as_str(),
            provider = %target.provider,
            model = %target.model,
            "calling provider"
        );
        let started = Instant::now();
        let timeout = self.options.timeout;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            r = tokio::time::timeout(
                timeout,
                provider.chat(&target.model, history, text, &prompt.params),
            ) => r,
        };
        metrics::record_dispatch_latency(target.provider.as_str(), started.elapsed());

        let response = match outcome {
            Ok(r) => r?,
            Err(_) => {
                return Err(ProviderError::new(
                    target.provider,
                    ProviderErrorKind::Timeout,
                    format!("no response within {}ms", timeout.as_millis()),
                )
                .into())
            }
        };

        metrics::inc_request(target.provider.as_str());
        info!(
            provider = %target.provider,
            model = %target.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "provider call succeeded"
        );
        Ok(DispatchResult {
            kind: if prompt.params.image {
                ResultKind::Image
            } else {
                ResultKind::Text
            },
            payload: response.body,
            provider_used: Some(target.provider),
            model_used: Some(target.model.clone()),
        })
    }

    async fn record_session(&self, prompt: &Prompt, prior: &[Message], result: &DispatchResult) {
        let (Some(sessions), Some(session_id)) = (&self.sessions, prompt.session_id.as_deref())
        else {
            return;
        };
        let mut transcript = Vec::with_capacity(prior.len() + 2);
        transcript.extend_from_slice(prior);
        transcript.push(Message::user(prompt.text.clone()));
        transcript.push(Message::assistant(result.payload.clone()));
        if let Err(e) = sessions.save(session_id, &transcript).await {
            warn!(session_id, error = %e, "failed to record session transcript");
        }
    }
}
