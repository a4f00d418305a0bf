//! Error taxonomy shared across the runtime

use std::time::Duration;

use thiserror::Error;

use crate::traits::llm::LlmError;

pub type Result<T> = std::result::Result<T, EnsembleError>;

/// Runtime-wide error kinds. Every user-visible error names the component
/// it originated in.
#[derive(Debug, Error)]
pub enum EnsembleError {
    /// Unresolvable setting. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// LLM vendor failure that survived the retry policy.
    #[error("provider error: {0}")]
    Provider(#[from] LlmError),

    /// A bounded wait expired (mediator future, HTTP tool, code sandbox, LLM call).
    #[error("{component} timed out after {waited:?}")]
    Timeout { component: String, waited: Duration },

    /// A tool invocation failed.
    #[error("tool error: {0}")]
    Tool(String),

    /// Invalid workflow, invalid user input, or a forbidden code construct.
    #[error("validation error: {0}")]
    Validation(String),

    /// Denied by the sandbox guard. Always fatal for the step.
    #[error("safety error: {0}")]
    Safety(String),

    /// MemoryStore read/write failure. Logged and swallowed at call sites.
    #[error("memory error: {0}")]
    Memory(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected failure. Logged with full detail, surfaced as internal.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EnsembleError {
    pub fn timeout(component: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            component: component.into(),
            waited,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The component a user-visible error is attributed to.
    pub fn component(&self) -> &str {
        match self {
            Self::Config(_) => "config",
            Self::Provider(_) => "llm",
            Self::Timeout { component, .. } => component,
            Self::Tool(_) => "tools",
            Self::Validation(_) => "validator",
            Self::Safety(_) => "sandbox",
            Self::Memory(_) => "memory",
            Self::Agent(_) => "agent",
            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_carries_component() {
        let err = EnsembleError::timeout("mediator", Duration::from_secs(2));
        assert!(err.is_timeout());
        assert_eq!(err.component(), "mediator");
        assert!(err.to_string().contains("mediator timed out"));
    }

    #[test]
    fn provider_errors_convert() {
        let err: EnsembleError = LlmError::Network("connection reset".into()).into();
        assert_eq!(err.component(), "llm");
        assert!(err.to_string().contains("connection reset"));
    }
}
