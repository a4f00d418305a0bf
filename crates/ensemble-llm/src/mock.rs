//! Scriptable provider for tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use ensemble_core::traits::llm::ChunkStream;
use ensemble_core::types::FinishReason;
use ensemble_core::{ChatMessage, GenerationConfig, LlmChunk, LlmError, LlmProvider, LlmResponse};

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<ChatMessage>,
    pub config: GenerationConfig,
}

struct MockState {
    responses: Vec<LlmResponse>,
    next: usize,
    cycle: bool,
    transient_failures_left: u32,
    fixed_error: Option<Arc<LlmError>>,
    calls: Vec<RecordedCall>,
    latency: Duration,
    models: Vec<String>,
}

fn replay_error(err: &LlmError) -> LlmError {
    match err {
        LlmError::Api { message, status } => LlmError::Api {
            message: message.clone(),
            status: *status,
        },
        LlmError::Network(m) => LlmError::Network(m.clone()),
        LlmError::RateLimit { retry_after } => LlmError::RateLimit {
            retry_after: *retry_after,
        },
        LlmError::Config(m) => LlmError::Config(m.clone()),
        LlmError::ModelNotFound(m) => LlmError::ModelNotFound(m.clone()),
        LlmError::Serialization(m) => LlmError::Serialization(m.clone()),
        LlmError::StreamingUnsupported(m) => LlmError::StreamingUnsupported(m.clone()),
        LlmError::Other(m) => LlmError::Other(m.clone()),
    }
}

/// Mock LLM provider. Responses are consumed in order (optionally
/// cycling); failures and latency can be injected.
#[derive(Clone)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
    streaming: bool,
    thinking: bool,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                responses: Vec::new(),
                next: 0,
                cycle: true,
                transient_failures_left: 0,
                fixed_error: None,
                calls: Vec::new(),
                latency: Duration::ZERO,
                models: Vec::new(),
            })),
            streaming: true,
            thinking: true,
        }
    }

    pub fn with_response(self, content: impl Into<String>) -> Self {
        self.state
            .lock()
            .responses
            .push(LlmResponse::new(content, FinishReason::Stop));
        self
    }

    pub fn with_responses(self, contents: Vec<String>) -> Self {
        {
            let mut state = self.state.lock();
            for content in contents {
                state.responses.push(LlmResponse::new(content, FinishReason::Stop));
            }
        }
        self
    }

    pub fn with_full_response(self, response: LlmResponse) -> Self {
        self.state.lock().responses.push(response);
        self
    }

    /// Consume responses once instead of cycling the last one forever.
    pub fn once(self) -> Self {
        self.state.lock().cycle = false;
        self
    }

    /// Fail the first `count` calls with a transient network error.
    pub fn with_transient_failures(self, count: u32) -> Self {
        self.state.lock().transient_failures_left = count;
        self
    }

    pub fn with_error(self, error: LlmError) -> Self {
        self.state.lock().fixed_error = Some(Arc::new(error));
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_thinking_support(mut self, thinking: bool) -> Self {
        self.thinking = thinking;
        self
    }

    pub fn with_models(self, models: Vec<String>) -> Self {
        self.state.lock().models = models;
        self
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    pub fn last_call(&self) -> Option<RecordedCall> {
        self.state.lock().calls.last().cloned()
    }

    fn take_response(
        &self,
        messages: &[ChatMessage],
        config: &GenerationConfig,
    ) -> Result<(LlmResponse, Duration), LlmError> {
        let mut state = self.state.lock();
        state.calls.push(RecordedCall {
            messages: messages.to_vec(),
            config: config.clone(),
        });

        if let Some(ref err) = state.fixed_error {
            return Err(replay_error(err));
        }
        if state.transient_failures_left > 0 {
            state.transient_failures_left -= 1;
            return Err(LlmError::Network("mock connection reset".into()));
        }

        if state.responses.is_empty() {
            return Ok((LlmResponse::new("", FinishReason::Stop), state.latency));
        }

        let index = if state.next < state.responses.len() {
            state.next
        } else if state.cycle {
            state.responses.len() - 1
        } else {
            return Err(LlmError::Other("mock responses exhausted".into()));
        };
        state.next += 1;

        let mut response = state.responses[index].clone();
        if config.thinking && self.thinking && response.thinking.is_none() {
            response.thinking = Some(format!("thinking about: {}", truncate_first_user(messages)));
        }
        Ok((response, state.latency))
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_first_user(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .find(|m| matches!(m.role, ensemble_core::Role::User))
        .map(|m| m.content.chars().take(40).collect())
        .unwrap_or_default()
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        config: &GenerationConfig,
    ) -> Result<LlmResponse, LlmError> {
        let (response, latency) = self.take_response(messages, config)?;
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }
        Ok(response)
    }

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        config: &GenerationConfig,
    ) -> Result<ChunkStream, LlmError> {
        if !self.streaming {
            return Err(LlmError::StreamingUnsupported("mock".into()));
        }
        let (response, latency) = self.take_response(messages, config)?;
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }

        // Word-level chunks with separators preserved.
        let mut chunks: Vec<Result<LlmChunk, LlmError>> = Vec::new();
        let mut rest = response.content.as_str();
        while let Some(pos) = rest.find(' ') {
            chunks.push(Ok(LlmChunk::new(&rest[..=pos], false)));
            rest = &rest[pos + 1..];
        }
        if !rest.is_empty() {
            chunks.push(Ok(LlmChunk::new(rest, false)));
        }
        chunks.push(Ok(LlmChunk::new("", true)));
        Ok(Box::new(Box::pin(stream::iter(chunks))))
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    fn supports_thinking(&self) -> bool {
        self.thinking
    }

    async fn available_models(&self) -> Result<Vec<String>, LlmError> {
        Ok(self.state.lock().models.clone())
    }
}
