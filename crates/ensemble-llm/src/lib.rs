//! LLM gateway: provider registry, retry policy, streaming

mod gateway;
pub mod mock;
pub mod providers;

pub use gateway::{GenerateRequest, LlmGateway, RetryPolicy};
pub use mock::MockProvider;
pub use providers::{ProviderType, UnifiedProvider};

pub use ensemble_core::{ChatMessage, GenerationConfig, LlmChunk, LlmError, LlmProvider, LlmResponse, Role};
