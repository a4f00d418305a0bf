//! Vendor-backed provider over the `llm` crate

use std::str::FromStr;

use async_trait::async_trait;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};

use ensemble_core::traits::llm::ChunkStream;
use ensemble_core::types::FinishReason;
use ensemble_core::{
    ChatMessage, GenerationConfig, LlmChunk, LlmError, LlmProvider, LlmResponse, Role, TokenUsage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    OpenAI,
    Anthropic,
    Ollama,
    DeepSeek,
    Groq,
    Google,
    Mistral,
}

impl ProviderType {
    pub fn api_key_env_var(&self) -> Option<&'static str> {
        match self {
            Self::OpenAI => Some("OPENAI_API_KEY"),
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
            Self::DeepSeek => Some("DEEPSEEK_API_KEY"),
            Self::Groq => Some("GROQ_API_KEY"),
            Self::Google => Some("GOOGLE_API_KEY"),
            Self::Mistral => Some("MISTRAL_API_KEY"),
            Self::Ollama => None,
        }
    }

    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Self::Ollama => Some("http://localhost:11434"),
            _ => None,
        }
    }

    pub fn alias(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
            Self::DeepSeek => "deepseek",
            Self::Groq => "groq",
            Self::Google => "google",
            Self::Mistral => "mistral",
        }
    }

    fn backend(&self) -> llm::builder::LLMBackend {
        match self {
            Self::OpenAI => llm::builder::LLMBackend::OpenAI,
            Self::Anthropic => llm::builder::LLMBackend::Anthropic,
            Self::Ollama => llm::builder::LLMBackend::Ollama,
            Self::DeepSeek => llm::builder::LLMBackend::DeepSeek,
            Self::Groq => llm::builder::LLMBackend::Groq,
            Self::Google => llm::builder::LLMBackend::Google,
            Self::Mistral => llm::builder::LLMBackend::Mistral,
        }
    }
}

impl FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            "deepseek" => Ok(Self::DeepSeek),
            "groq" => Ok(Self::Groq),
            "google" => Ok(Self::Google),
            "mistral" => Ok(Self::Mistral),
            other => Err(format!("unknown provider type: {}", other)),
        }
    }
}

/// One configured vendor endpoint. The per-call `server_url` extra, when
/// present, overrides the configured base URL (distributed routing).
#[derive(Debug)]
pub struct UnifiedProvider {
    provider_type: ProviderType,
    default_model: String,
    api_key: Option<String>,
    base_url: Option<String>,
}

impl UnifiedProvider {
    pub fn new(
        provider_type: ProviderType,
        default_model: impl Into<String>,
        api_key: Option<String>,
        base_url: Option<String>,
    ) -> Result<Self, LlmError> {
        let api_key = match api_key {
            Some(key) => Some(key),
            None => match provider_type.api_key_env_var() {
                Some(var) => Some(std::env::var(var).map_err(|_| {
                    LlmError::Config(format!("API key not found in environment variable {}", var))
                })?),
                None => None,
            },
        };

        let base_url = base_url.or_else(|| provider_type.default_base_url().map(str::to_string));

        Ok(Self {
            provider_type,
            default_model: default_model.into(),
            api_key,
            base_url,
        })
    }

    pub fn from_env(provider_type: ProviderType, model: impl Into<String>) -> Result<Self, LlmError> {
        Self::new(provider_type, model, None, None)
    }

    pub fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    fn convert_message(msg: &ChatMessage) -> llm::chat::ChatMessage {
        match msg.role {
            Role::System | Role::User => {
                llm::chat::ChatMessage::user().content(&msg.content).build()
            }
            Role::Assistant => llm::chat::ChatMessage::assistant()
                .content(&msg.content)
                .build(),
            Role::Tool => llm::chat::ChatMessage::user()
                .content(format!("Tool: {}", msg.content))
                .build(),
        }
    }

    fn build_backend(
        &self,
        config: &GenerationConfig,
    ) -> Result<Box<dyn llm::LLMProvider>, LlmError> {
        let model = config.model.as_deref().unwrap_or(&self.default_model);

        let mut builder = llm::builder::LLMBuilder::new()
            .backend(self.provider_type.backend())
            .model(model);

        if let Some(ref key) = self.api_key {
            if !key.is_empty() {
                builder = builder.api_key(key);
            }
        }

        let base_url = config
            .server_url()
            .map(str::to_string)
            .or_else(|| self.base_url.clone());
        if let Some(url) = base_url {
            builder = builder.base_url(url);
        }

        if let Some(temp) = config.temperature {
            builder = builder.temperature(temp);
        }
        if let Some(max_tokens) = config.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }
        if let Some(top_p) = config.top_p {
            builder = builder.top_p(top_p);
        }

        builder
            .build()
            .map_err(|e| LlmError::Config(format!("failed to build LLM backend: {}", e)))
    }
}

#[async_trait]
impl LlmProvider for UnifiedProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        config: &GenerationConfig,
    ) -> Result<LlmResponse, LlmError> {
        let backend_messages: Vec<llm::chat::ChatMessage> =
            messages.iter().map(Self::convert_message).collect();
        let backend = self.build_backend(config)?;

        let response = backend.chat(&backend_messages).await.map_err(|e| LlmError::Api {
            message: format!("vendor error: {}", e),
            status: None,
        })?;

        let content = response.text().unwrap_or_default();
        let usage = response.usage().map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(LlmResponse {
            content,
            thinking: None,
            finish_reason: FinishReason::Stop,
            usage,
            model: Some(
                config
                    .model
                    .clone()
                    .unwrap_or_else(|| self.default_model.clone()),
            ),
            provider: Some(self.provider_type.alias().to_string()),
        })
    }

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        config: &GenerationConfig,
    ) -> Result<ChunkStream, LlmError> {
        let backend_messages: Vec<llm::chat::ChatMessage> =
            messages.iter().map(Self::convert_message).collect();
        let backend = self.build_backend(config)?;

        let stream = backend
            .chat_stream(&backend_messages)
            .await
            .map_err(|e| LlmError::Api {
                message: format!("vendor error: {}", e),
                status: None,
            })?;

        let mapped = stream.map(|result| {
            result
                .map(|token| LlmChunk::new(token, false))
                .map_err(|e| LlmError::Api {
                    message: format!("stream error: {}", e),
                    status: None,
                })
        });

        Ok(Box::new(Box::pin(mapped)))
    }

    fn name(&self) -> &str {
        self.provider_type.alias()
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn supports_thinking(&self) -> bool {
        matches!(
            self.provider_type,
            ProviderType::Anthropic | ProviderType::DeepSeek | ProviderType::Ollama
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_type_parses_aliases() {
        for t in [
            ProviderType::OpenAI,
            ProviderType::Anthropic,
            ProviderType::Ollama,
            ProviderType::DeepSeek,
            ProviderType::Groq,
            ProviderType::Google,
            ProviderType::Mistral,
        ] {
            assert_eq!(t.alias().parse::<ProviderType>().unwrap(), t);
        }
        assert!("carrier-pigeon".parse::<ProviderType>().is_err());
    }

    #[test]
    fn ollama_needs_no_api_key() {
        let provider = UnifiedProvider::new(ProviderType::Ollama, "llama3", None, None).unwrap();
        assert_eq!(provider.name(), "ollama");
        assert_eq!(provider.default_model(), "llama3");
    }

    #[test]
    fn missing_env_key_is_a_config_error() {
        std::env::remove_var("MISTRAL_API_KEY");
        let err = UnifiedProvider::new(ProviderType::Mistral, "mistral-small", None, None)
            .unwrap_err();
        assert!(matches!(err, LlmError::Config(_)));
    }

    #[test]
    fn explicit_key_skips_environment() {
        let provider = UnifiedProvider::new(
            ProviderType::OpenAI,
            "gpt-4o-mini",
            Some("sk-test".into()),
            None,
        )
        .unwrap();
        assert_eq!(provider.provider_type(), ProviderType::OpenAI);
    }
}
