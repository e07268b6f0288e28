//! Google Gemini adapter (`generateContent`).

use std::borrow::Cow;
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

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: Cow<'a, str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
}

#[derive(Debug, Deserialize)]
struct ResponseCandidate {
    #[serde(default)]
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

/// Gemini text generation. The key travels in the `x-goog-api-key` header,
/// never in the URL.
#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    timeout: Duration,
}

impl GeminiProvider {
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

/// Gemini only knows `user` and `model` turns; system context rides in a
/// marked user turn.
fn content_for(message: &Message) -> Content<'_> {
    let (role, text) = match message.role {
        Role::User => ("user", Cow::Borrowed(message.content.as_str())),
        Role::Assistant => ("model", Cow::Borrowed(message.content.as_str())),
        Role::System => ("user", Cow::Owned(format!("[System] {}", message.content))),
    };
    Content {
        role,
        parts: vec![Part { text }],
    }
}

#[async_trait]
impl ProviderCapability for GeminiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Gemini
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
        const ID: ProviderId = ProviderId::Gemini;

        if params.image {
            return Err(ProviderError::image_unsupported(ID));
        }
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::missing_credential(ID))?;

        let generation_config = (params.temperature.is_some() || params.max_tokens.is_some())
            .then_some(GenerationConfig {
                temperature: params.temperature,
                max_output_tokens: params.max_tokens,
            });
        let contents = history
            .iter()
            .map(content_for)
            .chain(std::iter::once(Content {
                role: "user",
                parts: vec![Part {
                    text: Cow::Borrowed(prompt),
                }],
            }))
            .collect();
        let request = GenerateRequest {
            contents,
            generation_config,
        };

        let path = format!("/v1beta/models/{model}:generateContent");
        let response = self
            .client
            .post(join_url(&self.base_url, &path))
            .header("x-goog-api-key", api_key)
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

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::malformed(ID, e.without_url()))?;

        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
            .trim()
            .to_string();

        if text.is_empty() {
            return Err(ProviderError::empty_response(ID));
        }
        debug!(model, chars = text.len(), "gemini completion received");
        Ok(RawProviderResponse::new(text))
    }

    async fn probe(&self) -> ProviderHealth {
        credential_health(ProviderId::Gemini, self.api_key.is_some())
    }
}
