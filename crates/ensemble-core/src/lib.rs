//! Core types and traits for the Ensemble agent runtime

pub mod bus;
pub mod capability;
pub mod code;
pub mod descriptor;
pub mod error;
pub mod message;
pub mod result;
pub mod traits;
pub mod types;

pub use bus::{BusMessage, DelegationResult, MessageKind, MessagePriority};
pub use capability::{Capability, TaskType};
pub use code::{CodeEntity, CodeEntityKind};
pub use descriptor::{AgentDescriptor, AgentOverrides, ReflectionSettings};
pub use error::{EnsembleError, Result};
pub use message::{ChatMessage, Role};
pub use result::{TaskContext, TaskResult};
pub use traits::directory::AgentDirectory;
pub use traits::llm::{LlmError, LlmProvider};
pub use traits::tool::{Tool, ToolInfo, ToolResult};
pub use traits::vector::{Embedder, HashingEmbedder, VectorHit, VectorIndex, cosine_similarity};
pub use types::{FinishReason, GenerationConfig, LlmChunk, LlmResponse, TokenUsage};
