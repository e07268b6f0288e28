//! Hugging Face Inference API adapter.
//!
//! The API answers in several shapes depending on the model task: a list of
//! `{generated_text}` objects, a single object, or `{error, estimated_time}`
//! while a cold model loads. All three are handled here.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{
    credential_health, join_url, GenerationParams, ProviderCapability, ProviderError,
    ProviderErrorKind, RawProviderResponse,
};
use crate::health::ProviderHealth;
use crate::routing::ProviderId;

const DEFAULT_BASE_URL: &str = "https://api-inference.huggingface.co";
const DEFAULT_MAX_NEW_TOKENS: u32 = 256;
const DEFAULT_TEMPERATURE: f32 = 0.7;
const WARMING_UP: &str = "model warming up, retry shortly";

#[derive(Debug, Serialize)]
struct InferenceRequest<'a> {
    inputs: &'a str,
    options: InferenceOptions,
    parameters: InferenceParameters,
}

#[derive(Debug, Serialize)]
struct InferenceOptions {
    wait_for_model: bool,
}

#[derive(Debug, Serialize)]
struct InferenceParameters {
    max_new_tokens: u32,
    temperature: f32,
    top_p: f32,
    repetition_penalty: f32,
}

/// Hugging Face hosted inference.
#[derive(Debug, Clone)]
pub struct HuggingFaceProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    timeout: Duration,
}

impl HuggingFaceProvider {
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

/// Pull generated text out of any of the documented response shapes.
fn extract_text(body: &Value) -> Result<String, ProviderError> {
    const ID: ProviderId = ProviderId::HuggingFace;

    let generated = match body {
        Value::Array(items) => items
            .first()
            .and_then(|item| item.get("generated_text"))
            .and_then(Value::as_str),
        Value::Object(map) => {
            if let Some(text) = map.get("generated_text") {
                text.as_str()
            } else if let Some(err) = map.get("error") {
                let message = err.as_str().unwrap_or("unknown error");
                if let Some(eta) = map.get("estimated_time").and_then(Value::as_f64) {
                    info!(estimated_time = eta, "hugging face model loading");
                    return Err(ProviderError::new(
                        ID,
                        ProviderErrorKind::Unavailable,
                        format!("{WARMING_UP} (estimated {eta:.0}s)"),
                    ));
                }
                return Err(ProviderError::new(
                    ID,
                    ProviderErrorKind::Unavailable,
                    message.to_string(),
                ));
            } else {
                None
            }
        }
        _ => None,
    };

    match generated {
        Some(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        Some(_) => Err(ProviderError::empty_response(ID)),
        None => {
            let shape: String = body.to_string().chars().take(120).collect();
            Err(ProviderError::malformed(ID, shape))
        }
    }
}

#[async_trait]
impl ProviderCapability for HuggingFaceProvider {
    fn id(&self) -> ProviderId {
        ProviderId::HuggingFace
    }

    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<RawProviderResponse, ProviderError> {
        const ID: ProviderId = ProviderId::HuggingFace;

        if params.image {
            return Err(ProviderError::image_unsupported(ID));
        }
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::missing_credential(ID))?;

        let request = InferenceRequest {
            inputs: prompt,
            options: InferenceOptions {
                wait_for_model: true,
            },
            parameters: InferenceParameters {
                max_new_tokens: params.max_tokens.unwrap_or(DEFAULT_MAX_NEW_TOKENS),
                temperature: params.temperature.unwrap_or(DEFAULT_TEMPERATURE),
                top_p: 0.9,
                repetition_penalty: 1.05,
            },
        };

        let response = self
            .client
            .post(join_url(&self.base_url, &format!("/models/{model}")))
            .bearer_auth(api_key)
            .header("Accept", "application/json")
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(ID, e))?;

        let status = response.status();
        if status.as_u16() == 503 {
            return Err(ProviderError::new(ID, ProviderErrorKind::Unavailable, WARMING_UP));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(ID, status.as_u16(), &body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::malformed(ID, e.without_url()))?;
        let text = extract_text(&body)?;
        debug!(model, chars = text.len(), "hugging face completion received");
        Ok(RawProviderResponse::new(text))
    }

    async fn probe(&self) -> ProviderHealth {
        credential_health(ProviderId::HuggingFace, self.api_key.is_some())
    }
}
