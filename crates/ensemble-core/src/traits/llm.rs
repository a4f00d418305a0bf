//! LLM provider trait and error kinds

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::message::ChatMessage;
use crate::types::{GenerationConfig, LlmChunk, LlmResponse};

pub type ChunkStream = Box<dyn Stream<Item = std::result::Result<LlmChunk, LlmError>> + Unpin + Send>;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        config: &GenerationConfig,
    ) -> std::result::Result<LlmResponse, LlmError>;

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        config: &GenerationConfig,
    ) -> std::result::Result<ChunkStream, LlmError>;

    fn name(&self) -> &str;

    fn supports_streaming(&self) -> bool {
        false
    }

    fn supports_thinking(&self) -> bool {
        false
    }

    async fn available_models(&self) -> std::result::Result<Vec<String>, LlmError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("API error: {message}")]
    Api {
        message: String,
        status: Option<u16>,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimit {
        retry_after: Option<std::time::Duration>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("streaming not supported by provider {0}")]
    StreamingUnsupported(String),

    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// Whether a retry may succeed without changing the request.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Network(_) | LlmError::RateLimit { .. } => true,
            LlmError::Api { status, .. } => matches!(status, Some(s) if *s >= 500),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::Serialization(err.to_string())
    }
}
