//! Local loopback provider for development and tests.

use std::time::Duration;

use async_trait::async_trait;

use super::{GenerationParams, ProviderCapability, ProviderError, RawProviderResponse};
use crate::health::ProviderHealth;
use crate::routing::ProviderId;

/// Echoes the prompt back after an optional delay.
///
/// Image requests return a `echo://image/{prompt}` pseudo-URL.
#[derive(Debug, Clone, Default)]
pub struct EchoProvider {
    /// Simulated latency.
    pub delay_ms: u64,
}

impl EchoProvider {
    /// Echo with no delay.
    pub fn new() -> Self {
        Self { delay_ms: 0 }
    }

    /// Echo with a fixed delay.
    pub fn with_delay(delay_ms: u64) -> Self {
        Self { delay_ms }
    }
}

#[async_trait]
impl ProviderCapability for EchoProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Echo
    }

    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<RawProviderResponse, ProviderError> {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        if prompt.trim().is_empty() {
            return Err(ProviderError::empty_response(ProviderId::Echo));
        }
        if params.image {
            let encoded: String = url::form_urlencoded::byte_serialize(prompt.as_bytes()).collect();
            return Ok(RawProviderResponse::new(format!("echo://image/{encoded}")));
        }
        Ok(RawProviderResponse::new(format!("[{model}] {prompt}")))
    }

    async fn probe(&self) -> ProviderHealth {
        ProviderHealth::available()
    }
}
