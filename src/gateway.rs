//! Concurrency-capped, retrying adapter over the remote generate call.
//!
//! The [`ModelGateway`] is the only path to the model. It owns a FIFO admission
//! gate ([`tokio::sync::Semaphore`]) shared by every task in the process and wraps
//! each call in a timeout race with exponential backoff between attempts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, error, instrument, warn};

use crate::error::{Result, StudioError};

/// Sampling knobs forwarded to text models. Image models never receive them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sampling {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<i32>,
}

impl Sampling {
    pub fn new(temperature: f32, top_p: f32, top_k: i32) -> Self {
        Self {
            temperature: Some(temperature),
            top_p: Some(top_p),
            top_k: Some(top_k),
        }
    }

    /// Only a temperature, as used by the critic and prompt enhancer.
    pub fn temperature(temperature: f32) -> Self {
        Self {
            temperature: Some(temperature),
            ..Default::default()
        }
    }
}

/// What a request is bound to besides plain generation.
///
/// Web grounding and tool/schema bindings are mutually exclusive per request,
/// which the enum makes unrepresentable.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ToolBinding {
    #[default]
    None,
    /// Force a JSON response matching this schema.
    ResponseSchema(Value),
    /// Raw tool declarations as supplied by the user.
    Tools(Value),
    /// Google Search grounding.
    WebSearch,
}

/// A single call to the remote model.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub model: String,
    pub system_instruction: Option<String>,
    pub prompt: String,
    /// Data URI of an image to send alongside the prompt.
    pub prompt_image: Option<String>,
    pub image_output: bool,
    pub sampling: Sampling,
    pub binding: ToolBinding,
}

impl ModelRequest {
    /// Text generation request.
    pub fn text(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Image generation request. The response text is a data URI.
    pub fn image(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            image_output: true,
            ..Default::default()
        }
    }

    pub fn system(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn sampling(mut self, sampling: Sampling) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn binding(mut self, binding: ToolBinding) -> Self {
        self.binding = binding;
        self
    }

    pub fn prompt_image(mut self, data_uri: Option<String>) -> Self {
        self.prompt_image = data_uri;
        self
    }
}

/// Result of a successful model call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub grounding_metadata: Option<Value>,
    /// The first function call the model emitted, if any.
    pub function_call: Option<Value>,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Opaque remote generate call.
///
/// Implemented by [`crate::gemini::GeminiTransport`] for the real service and by
/// [`MockTransport`] for offline use.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse>;
}

/// Handler used to short-circuit model calls during tests.
pub type MockHandler = Arc<dyn Fn(&ModelRequest) -> Result<ModelResponse> + Send + Sync>;

/// Transport that answers every request with a user-supplied closure.
#[derive(Clone)]
pub struct MockTransport {
    handler: MockHandler,
}

impl MockTransport {
    pub fn new(
        handler: impl Fn(&ModelRequest) -> Result<ModelResponse> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

#[async_trait]
impl ModelTransport for MockTransport {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse> {
        (self.handler)(request)
    }
}

/// Resilience settings for the gateway.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Maximum calls in flight across the process (default: 8)
    pub concurrency: usize,
    /// Per-attempt timeout (default: 60s)
    pub timeout: Duration,
    /// Total attempts per call, including the first (default: 3)
    pub max_attempts: usize,
    /// Delay before the second attempt; doubles for every later one (default: 1s)
    pub base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            timeout: Duration::from_secs(60),
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl GatewayConfig {
    /// Backoff before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        self.base_delay.saturating_mul(2u32.pow(exponent))
    }
}

/// Concurrency-capped, retrying wrapper around a [`ModelTransport`].
#[derive(Clone)]
pub struct ModelGateway {
    transport: Arc<dyn ModelTransport>,
    limiter: Arc<Semaphore>,
    config: GatewayConfig,
}

impl ModelGateway {
    pub fn new(transport: Arc<dyn ModelTransport>) -> Self {
        Self::with_config(transport, GatewayConfig::default())
    }

    pub fn with_config(transport: Arc<dyn ModelTransport>, mut config: GatewayConfig) -> Self {
        config.concurrency = config.concurrency.max(1);
        config.max_attempts = config.max_attempts.max(1);
        Self {
            transport,
            limiter: Arc::new(Semaphore::new(config.concurrency)),
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Permits currently free at the admission gate.
    pub fn available_slots(&self) -> usize {
        self.limiter.available_permits()
    }

    /// Perform one logical generate call.
    ///
    /// Waits for a slot in arrival order, then tries up to `max_attempts` times.
    /// The last transport failure is returned as-is; non-transport errors are
    /// returned without retrying.
    #[instrument(skip_all, fields(model = %request.model, image = request.image_output))]
    pub async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| StudioError::transport("gateway admission gate closed"))?;

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let outcome =
                match tokio::time::timeout(self.config.timeout, self.transport.generate(request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(StudioError::Timeout {
                        after_ms: self.config.timeout.as_millis() as u64,
                    }),
                };

            match outcome {
                Ok(response) => {
                    debug!(attempt, "Model call succeeded");
                    return Ok(response);
                }
                Err(err) if err.is_transport() && attempt < self.config.max_attempts => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.config.max_attempts,
                        "Model call failed ({}). Retrying after {}ms",
                        err,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(attempt, "Model call failed: {}", err);
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_doubles_from_base() {
        let config = GatewayConfig::default();
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(3), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn non_transport_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let gateway = ModelGateway::new(Arc::new(MockTransport::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StudioError::config("no such model"))
        })));

        let err = gateway
            .generate(&ModelRequest::text("gemini-2.5-flash", "hi"))
            .await
            .unwrap_err();

        assert!(err.is_config());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permit_is_released_after_failure() {
        let gateway = ModelGateway::with_config(
            Arc::new(MockTransport::new(|_| Err(StudioError::transport("down")))),
            GatewayConfig {
                concurrency: 2,
                ..Default::default()
            },
        );

        let _ = gateway
            .generate(&ModelRequest::text("gemini-2.5-flash", "hi"))
            .await;
        assert_eq!(gateway.available_slots(), 2);
    }
}
