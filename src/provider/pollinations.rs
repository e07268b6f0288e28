//! Pollinations text and image adapter.
//!
//! Text is a plain `GET` with the prompt as the last path segment. Images
//! need no network call at all: the adapter builds the URL the client
//! fetches.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{GenerationParams, ProviderCapability, ProviderError, RawProviderResponse};
use crate::health::ProviderHealth;
use crate::routing::ProviderId;

const DEFAULT_TEXT_URL: &str = "https://text.pollinations.ai/";
const DEFAULT_IMAGE_URL: &str = "https://image.pollinations.ai/prompt/";
const DEFAULT_IMAGE_SIZE: u32 = 1024;

/// Form-style encoding: spaces become `+`.
fn quote_plus(text: &str) -> String {
    url::form_urlencoded::byte_serialize(text.as_bytes()).collect()
}

fn with_trailing_slash(base: &str) -> String {
    format!("{}/", base.trim_end_matches('/'))
}

/// Pollinations public endpoints. No credential is needed.
#[derive(Debug, Clone)]
pub struct PollinationsProvider {
    client: reqwest::Client,
    text_url: String,
    image_url: String,
    timeout: Duration,
}

impl Default for PollinationsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PollinationsProvider {
    /// Adapter against the public endpoints.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            text_url: DEFAULT_TEXT_URL.to_string(),
            image_url: DEFAULT_IMAGE_URL.to_string(),
            timeout: Duration::from_secs(8),
        }
    }

    /// Override the text endpoint.
    pub fn with_text_url(mut self, url: impl Into<String>) -> Self {
        self.text_url = url.into();
        self
    }

    /// Override the image endpoint.
    pub fn with_image_url(mut self, url: impl Into<String>) -> Self {
        self.image_url = url.into();
        self
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Image URL for `prompt`; `nologo` hides Pollinations branding.
    pub fn image_url_for(&self, prompt: &str, width: u32, height: u32, nologo: bool) -> String {
        let mut url = format!(
            "{}{}?width={width}&height={height}",
            with_trailing_slash(&self.image_url),
            quote_plus(prompt)
        );
        if nologo {
            url.push_str("&nologo=true");
        }
        url
    }
}

#[async_trait]
impl ProviderCapability for PollinationsProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Pollinations
    }

    async fn generate(
        &self,
        _model: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<RawProviderResponse, ProviderError> {
        const ID: ProviderId = ProviderId::Pollinations;

        if params.image {
            let url = self.image_url_for(
                prompt,
                params.width.unwrap_or(DEFAULT_IMAGE_SIZE),
                params.height.unwrap_or(DEFAULT_IMAGE_SIZE),
                true,
            );
            return Ok(RawProviderResponse::new(url));
        }

        let url = format!("{}{}", with_trailing_slash(&self.text_url), quote_plus(prompt));
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(ID, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::from_reqwest(ID, e))?;
        if !status.is_success() {
            return Err(ProviderError::from_status(ID, status.as_u16(), &body));
        }

        let text = body.trim();
        if text.is_empty() {
            return Err(ProviderError::empty_response(ID));
        }
        debug!(chars = text.len(), "pollinations text received");
        Ok(RawProviderResponse::new(text))
    }

    async fn probe(&self) -> ProviderHealth {
        ProviderHealth::available()
    }
}
