use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, warn};

use ensemble_core::traits::llm::ChunkStream;
use ensemble_core::{ChatMessage, GenerationConfig, LlmChunk, LlmError, LlmProvider, LlmResponse};

/// Alias reserved for the local provider; preferred when no explicit
/// provider is requested.
pub const LOCAL_PROVIDER: &str = "ollama";

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.base_delay * 2u32.saturating_pow(attempt);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
        backoff + jitter
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub messages: Vec<ChatMessage>,
    /// Explicit provider alias; when unset the gateway prefers the local
    /// provider, then the configured default.
    pub provider: Option<String>,
    pub config: GenerationConfig,
}

impl GenerateRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            provider: None,
            config: GenerationConfig::default(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }
}

/// Provider-agnostic text generation with retry, per-provider selection,
/// streaming, and thinking-mode passthrough.
pub struct LlmGateway {
    providers: RwLock<HashMap<String, Arc<dyn LlmProvider>>>,
    default_alias: RwLock<Option<String>>,
    retry: RetryPolicy,
    /// Per-provider retry limits overriding the default policy.
    retry_overrides: RwLock<HashMap<String, u32>>,
}

impl LlmGateway {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            default_alias: RwLock::new(None),
            retry: RetryPolicy::default(),
            retry_overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn register(&self, alias: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        let alias = alias.into();
        let mut providers = self.providers.write();
        if providers.is_empty() {
            *self.default_alias.write() = Some(alias.clone());
        }
        providers.insert(alias, provider);
    }

    pub fn set_default(&self, alias: impl Into<String>) {
        *self.default_alias.write() = Some(alias.into());
    }

    pub fn set_provider_retries(&self, alias: impl Into<String>, retries: u32) {
        self.retry_overrides.write().insert(alias.into(), retries);
    }

    pub fn has_provider(&self, alias: &str) -> bool {
        self.providers.read().contains_key(alias)
    }

    pub fn provider_aliases(&self) -> Vec<String> {
        self.providers.read().keys().cloned().collect()
    }

    fn resolve(&self, requested: Option<&str>) -> Result<(String, Arc<dyn LlmProvider>), LlmError> {
        let providers = self.providers.read();

        let alias = match requested {
            Some(alias) => alias.to_string(),
            None if providers.contains_key(LOCAL_PROVIDER) => LOCAL_PROVIDER.to_string(),
            None => self
                .default_alias
                .read()
                .clone()
                .ok_or_else(|| LlmError::Config("no LLM providers registered".into()))?,
        };

        let provider = providers
            .get(&alias)
            .cloned()
            .ok_or_else(|| LlmError::Config(format!("unknown LLM provider: {}", alias)))?;
        Ok((alias, provider))
    }

    pub async fn generate(&self, request: GenerateRequest) -> Result<LlmResponse, LlmError> {
        let (alias, provider) = self.resolve(request.provider.as_deref())?;
        let max_retries = self
            .retry_overrides
            .read()
            .get(&alias)
            .copied()
            .unwrap_or(self.retry.max_retries);

        let mut attempt = 0;
        loop {
            match provider.complete(&request.messages, &request.config).await {
                Ok(mut response) => {
                    response.provider = Some(alias.clone());
                    return Ok(response);
                }
                Err(err) if err.is_transient() && attempt < max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        provider = %alias,
                        attempt,
                        error = %err,
                        "transient provider error, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Stream chunks from the selected provider. Falls back to a single
    /// chunk via `generate` when the provider lacks streaming support.
    /// The returned stream is finite and not restartable.
    pub async fn stream(&self, request: GenerateRequest) -> Result<ChunkStream, LlmError> {
        let (alias, provider) = self.resolve(request.provider.as_deref())?;

        if provider.supports_streaming() {
            match provider.complete_stream(&request.messages, &request.config).await {
                Ok(stream) => return Ok(stream),
                Err(LlmError::StreamingUnsupported(_)) => {
                    debug!(provider = %alias, "provider declined streaming, falling back");
                }
                Err(err) => return Err(err),
            }
        }

        let response = self.generate(request).await?;
        let chunks = vec![
            Ok(LlmChunk::new(response.content, false)),
            Ok(LlmChunk::new("", true)),
        ];
        Ok(Box::new(Box::pin(stream::iter(chunks))))
    }

    /// Per-provider model listing used by health checks.
    pub async fn list_available_models(&self) -> HashMap<String, Vec<String>> {
        let providers: Vec<(String, Arc<dyn LlmProvider>)> = self
            .providers
            .read()
            .iter()
            .map(|(alias, p)| (alias.clone(), Arc::clone(p)))
            .collect();

        let mut out = HashMap::new();
        for (alias, provider) in providers {
            match provider.available_models().await {
                Ok(models) => {
                    out.insert(alias, models);
                }
                Err(err) => {
                    debug!(provider = %alias, error = %err, "model listing failed");
                    out.insert(alias, Vec::new());
                }
            }
        }
        out
    }
}

impl Default for LlmGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;
    use futures::StreamExt;

    fn user_request(text: &str) -> GenerateRequest {
        GenerateRequest::new(vec![ChatMessage::user(text)])
    }

    #[tokio::test]
    async fn generate_uses_default_provider() {
        let gateway = LlmGateway::new();
        gateway.register("main", Arc::new(MockProvider::new().with_response("hello")));

        let response = gateway.generate(user_request("hi")).await.unwrap();
        assert_eq!(response.content, "hello");
        assert_eq!(response.provider.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn local_provider_preferred_when_unspecified() {
        let gateway = LlmGateway::new();
        gateway.register("cloud", Arc::new(MockProvider::new().with_response("cloud answer")));
        gateway.register(LOCAL_PROVIDER, Arc::new(MockProvider::new().with_response("local answer")));
        gateway.set_default("cloud");

        let response = gateway.generate(user_request("hi")).await.unwrap();
        assert_eq!(response.content, "local answer");
    }

    #[tokio::test]
    async fn explicit_provider_wins() {
        let gateway = LlmGateway::new();
        gateway.register("cloud", Arc::new(MockProvider::new().with_response("cloud answer")));
        gateway.register(LOCAL_PROVIDER, Arc::new(MockProvider::new().with_response("local answer")));

        let response = gateway
            .generate(user_request("hi").with_provider("cloud"))
            .await
            .unwrap();
        assert_eq!(response.content, "cloud answer");
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let gateway = LlmGateway::new().with_retry(RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
        });
        let provider = MockProvider::new()
            .with_transient_failures(2)
            .with_response("recovered");
        gateway.register("flaky", Arc::new(provider));

        let response = gateway.generate(user_request("hi")).await.unwrap();
        assert_eq!(response.content, "recovered");
    }

    #[tokio::test]
    async fn non_transient_errors_surface_immediately() {
        let gateway = LlmGateway::new();
        let provider = MockProvider::new().with_error(LlmError::Config("bad key".into()));
        gateway.register("broken", Arc::new(provider.clone()));

        let err = gateway.generate(user_request("hi")).await.unwrap_err();
        assert!(matches!(err, LlmError::Config(_)));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn unknown_provider_is_a_config_error() {
        let gateway = LlmGateway::new();
        gateway.register("main", Arc::new(MockProvider::new()));
        let err = gateway
            .generate(user_request("hi").with_provider("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Config(_)));
    }

    #[tokio::test]
    async fn stream_falls_back_to_single_chunk() {
        let gateway = LlmGateway::new();
        let provider = MockProvider::new()
            .with_response("full answer")
            .with_streaming(false);
        gateway.register("main", Arc::new(provider));

        let mut stream = gateway.stream(user_request("hi")).await.unwrap();
        let mut collected = String::new();
        while let Some(chunk) = stream.next().await {
            collected.push_str(&chunk.unwrap().delta);
        }
        assert_eq!(collected, "full answer");
    }

    #[tokio::test]
    async fn stream_uses_provider_chunks_when_supported() {
        let gateway = LlmGateway::new();
        let provider = MockProvider::new().with_response("a b c").with_streaming(true);
        gateway.register("main", Arc::new(provider));

        let mut stream = gateway.stream(user_request("hi")).await.unwrap();
        let mut chunks = 0;
        let mut collected = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            if !chunk.done {
                chunks += 1;
            }
            collected.push_str(&chunk.delta);
        }
        assert!(chunks > 1, "expected word-level chunks, got {}", chunks);
        assert_eq!(collected, "a b c");
    }

    #[tokio::test]
    async fn list_available_models_covers_all_providers() {
        let gateway = LlmGateway::new();
        gateway.register(
            "main",
            Arc::new(MockProvider::new().with_models(vec!["m1".into(), "m2".into()])),
        );
        gateway.register("empty", Arc::new(MockProvider::new()));

        let models = gateway.list_available_models().await;
        assert_eq!(models["main"], vec!["m1".to_string(), "m2".to_string()]);
        assert!(models["empty"].is_empty());
    }
}
