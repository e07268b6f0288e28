//! Groq adapter (OpenAI-compatible chat completions).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    credential_health, join_url, GenerationParams, ProviderCapability, ProviderError,
    RawProviderResponse,
};
use crate::health::ProviderHealth;
use crate::routing::ProviderId;
use crate::store::{Message, Role};

const DEFAULT_BASE_URL: &str = "https://api.groq.com";
const DEFAULT_MAX_TOKENS: u32 = 1024;
const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Groq chat completions.
///
/// ## Example
///
/// ```no_run
/// use prompt_gateway::provider::GroqProvider;
/// use std::time::Duration;
///
/// let groq = GroqProvider::new(Some("gsk_..."))
///     .with_timeout(Duration::from_secs(20));
/// ```
#[derive(Debug, Clone)]
pub struct GroqProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    timeout: Duration,
}

impl GroqProvider {
    /// Adapter using `api_key`; without one every call is `Unauthorized`.
    pub fn new(api_key: Option<&str>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.map(str::to_string),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Override the API host.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

#[async_trait]
impl ProviderCapability for GroqProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Groq
    }

    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<RawProviderResponse, ProviderError> {
        self.chat(model, &[], prompt, params).await
    }

    async fn chat(
        &self,
        model: &str,
        history: &[Message],
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<RawProviderResponse, ProviderError> {
        const ID: ProviderId = ProviderId::Groq;

        if params.image {
            return Err(ProviderError::image_unsupported(ID));
        }
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::missing_credential(ID))?;

        let messages = history
            .iter()
            .map(|m| ChatMessage {
                role: role_name(m.role),
                content: &m.content,
            })
            .chain(std::iter::once(ChatMessage {
                role: "user",
                content: prompt,
            }))
            .collect();
        let request = ChatRequest {
            model,
            messages,
            max_tokens: params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: params.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            stream: false,
        };

        let response = self
            .client
            .post(join_url(&self.base_url, "/openai/v1/chat/completions"))
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(ID, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(ID, status.as_u16(), &body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::malformed(ID, e.without_url()))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        if text.is_empty() {
            return Err(ProviderError::empty_response(ID));
        }
        debug!(model, chars = text.len(), "groq completion received");
        Ok(RawProviderResponse::new(text))
    }

    async fn probe(&self) -> ProviderHealth {
        credential_health(ProviderId::Groq, self.api_key.is_some())
    }
}
